//! Small shared types for the reactor (spec §3 "Loop state", §4.1).

use std::os::unix::io::RawFd;

pub type TimerId = u64;
pub type AttachmentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

pub type HandleKey = (Direction, RawFd);

/// `interval` argument to `watch_time` (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub enum TimerSpec {
    /// Absent: periodic with period == `after`.
    Periodic,
    /// `"abs"`: `after` is an absolute wall-clock time; fires once.
    Absolute,
    /// `"rel"`: fire once after `after`.
    Relative,
    /// Numeric: one-shot after `after`, then periodic at the given interval.
    OneShotThenPeriodic(std::time::Duration),
}

/// Values `stop(*args)` is signalled with; forwarded to `start_nb`'s
/// callback and returned from `start()`. Kept as a small closed enum rather
/// than a dynamic "varargs" bag -- every caller in this crate stops the
/// loop with either nothing, a single exit code, or a short reason string.
#[derive(Debug, Clone, Default)]
pub enum StopArgs {
    #[default]
    None,
    Code(i64),
    Reason(String),
}
