//! The `Builder` contract (spec §6): the set of services the core needs
//! injected from its host application. The concrete configuration-object
//! injection mechanism is a non-goal (spec §1) -- this module only defines
//! the trait surface the core calls through, plus a small default
//! implementation usable in tests and simple embeddings.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Static configuration a `Builder` exposes (spec §6: `config` with
/// `tempdir`, `script/pathname`).
#[derive(Debug, Clone)]
pub struct Config {
    pub tempdir: PathBuf,
    pub pathname: PathBuf,
}

/// A named advisory lock, used by `Semaphore` (spec §6) to coalesce
/// concurrent raises. `set` attempts to acquire (optionally asynchronously);
/// `reset` releases.
pub trait NamedLock {
    fn set(&self, key: &str, r#async: bool) -> bool;
    fn reset(&self, key: &str, pid: i32);
}

/// Host-supplied services a `Factory` needs to hand to every notifier it
/// constructs.
pub trait Builder {
    fn config(&self) -> &Config;
    fn debug(&self) -> bool;
    fn lock(&self) -> &dyn NamedLock;

    /// Spawn `cmd` (argv) as described by spec §4.9: always async
    /// (non-blocking start), never auto-reaping zombies -- the caller
    /// installs its own `watch_child`.
    fn run_cmd(&self, cmd: &[String], ignore_zombies: bool) -> Result<RunHandle>;
}

/// What `run_cmd` hands back: the child's pid. `ignore_zombies` is recorded
/// so callers can tell whether the builder itself reaps the child.
#[derive(Debug, Clone, Copy)]
pub struct RunHandle {
    pub pid: i32,
    pub ignore_zombies: bool,
}

/// A `NamedLock` backed by an in-process `HashSet`, suitable for tests and
/// single-process embeddings. Each key maps to "held" or "free"; `set`
/// returns `true` iff it transitioned free -> held.
#[derive(Debug, Default)]
pub struct LocalLock {
    held: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl NamedLock for LocalLock {
    fn set(&self, key: &str, _async: bool) -> bool {
        self.held.lock().unwrap().insert(key.to_string())
    }

    fn reset(&self, key: &str, _pid: i32) {
        self.held.lock().unwrap().remove(key);
    }
}

/// A minimal `Builder` good enough to drive the core runtime in tests and
/// small embeddings: a tempdir, non-debug, a `LocalLock`, and `run_cmd`
/// implemented via `fork`+`execvp`.
pub struct DefaultBuilder {
    config: Config,
    debug: bool,
    lock: LocalLock,
}

impl DefaultBuilder {
    pub fn new(pathname: impl Into<PathBuf>) -> std::io::Result<Self> {
        let tempdir = std::env::temp_dir();
        Ok(Self {
            config: Config {
                tempdir,
                pathname: pathname.into(),
            },
            debug: false,
            lock: LocalLock::default(),
        })
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn tempdir(&self) -> &Path {
        &self.config.tempdir
    }
}

impl Builder for DefaultBuilder {
    fn config(&self) -> &Config {
        &self.config
    }

    fn debug(&self) -> bool {
        self.debug
    }

    fn lock(&self) -> &dyn NamedLock {
        &self.lock
    }

    fn run_cmd(&self, cmd: &[String], ignore_zombies: bool) -> Result<RunHandle> {
        if cmd.is_empty() {
            return Err(crate::error::Error::Unspecified("cmd"));
        }
        let pid = crate::process::spawn_argv(cmd)?;
        Ok(RunHandle {
            pid: pid.as_raw(),
            ignore_zombies,
        })
    }
}
