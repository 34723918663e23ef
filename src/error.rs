//! Error taxonomy for the runtime (spec §7). Variants are a classification,
//! not a 1:1 port of the original exception class hierarchy -- callers match
//! on `Error` rather than downcasting a class name.

use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required parameter was missing at construction or call time.
    #[error("missing required parameter: {0}")]
    Unspecified(&'static str),

    /// An untrusted string failed a validation regex.
    #[error("tainted value rejected by validator: {0}")]
    Tainted(String),

    /// `(type, name)` conflicted with a live registry entry.
    #[error("notifier id not unique: {type_name}/{name}")]
    NotifierIdNotUnique { type_name: &'static str, name: String },

    /// Syscall errno surfaced from a read/write/socketpair/watch failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A write was attempted on a stream marked closing.
    #[error("stream is closing")]
    StreamClosing,

    /// Encoder/codec lookup failed.
    #[error("unknown encoding: {0}")]
    EncodingUnknown(String),

    /// The OS refused to create a filesystem-notification watch.
    #[error("watcher create failed: {0}")]
    WatcherCreateFailed(String),

    /// `invoke_event` was given a name with no implemented handler.
    #[error("no handler implemented for event {0:?}")]
    EventUnknown(&'static str),

    /// Dynamic class resolution failed (kept for API completeness; the
    /// default `Factory` never produces this itself -- see SPEC_FULL.md §9.3
    /// Open Question 4).
    #[error("class load failed: {0}")]
    ClassLoadFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a raw OS errno the way the reactor/stream/channel code needs
/// to: non-fatal (re-arm and retry) vs fatal (surface through `on_error`).
pub fn is_retryable(errno: nix::errno::Errno) -> bool {
    use nix::errno::Errno;
    matches!(errno, Errno::EAGAIN | Errno::EWOULDBLOCK | Errno::EINTR)
}

/// A notifier's `on_error` slot: raises through `invoke_error` when absent.
/// `kind` is a free-form classification string (e.g. "io", "codec"),
/// `details` are formatted positional arguments, mirroring §4.2's
/// `invoke_error(msg, kind?, details…)`.
#[derive(Debug, Clone)]
pub struct NotifierError {
    pub message: String,
    pub kind: Option<String>,
}

impl fmt::Display for NotifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(k) => write!(f, "[{k}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for NotifierError {}
