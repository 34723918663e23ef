//! `Process` (spec §4.9): a forked (or `execvp`'d) child, watched for exit
//! through the reactor's child-reaping path (`Loop::watch_child`) rather
//! than a blocking `waitpid` on the hot path.

use crate::error::{Error, Result};
use crate::reactor::Loop;
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid};
use std::ffi::CString;

/// How a child finished, decoded from `waitpid`'s status (spec §4.9
/// `ChildCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildCode {
    Exited(i32),
    Signaled(i32),
}

impl ChildCode {
    fn from_status(status: i32) -> Self {
        match WaitStatus::from_raw(Pid::from_raw(0), status) {
            Ok(WaitStatus::Exited(_, code)) => ChildCode::Exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ChildCode::Signaled(sig as i32),
            _ => ChildCode::Exited(status),
        }
    }
}

pub struct Process {
    pid: Pid,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Forks, running `child_body` in the new process and never returning
    /// from it (spec: "the child side replaces its own control flow";
    /// callers that need `execvp` instead should call `spawn_argv`).
    pub fn fork(loop_after_fork: impl FnOnce() + 'static, child_body: impl FnOnce() -> ! ) -> Result<Process> {
        match unsafe { nix::unistd::fork() }.map_err(|e| Error::Io(std::io::Error::from(e)))? {
            ForkResult::Parent { child } => Ok(Process { pid: child }),
            ForkResult::Child => {
                crate::logging::refresh_pid_after_fork();
                loop_after_fork();
                child_body()
            }
        }
    }

    /// Registers `cb` against the reactor's child-reaping path. The
    /// `ChildCode` is decoded from the raw wait status the reactor already
    /// collected via `waitpid(WNOHANG)`.
    pub fn watch_exit(&self, loop_: &Loop, cb: impl FnOnce(&Loop, ChildCode) + 'static) -> Result<()> {
        loop_.watch_child(self.pid, move |l, status| cb(l, ChildCode::from_status(status)))
    }

    pub fn kill(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, signal).map_err(|e| Error::Io(std::io::Error::from(e)))
    }
}

/// Forks and `execvp`s `cmd` (spec §4.9/§6 `run_cmd`: "always async, never
/// auto-reaping"). Returns the child's pid; the caller installs its own
/// `watch_child`.
pub fn spawn_argv(cmd: &[String]) -> Result<Pid> {
    let argv: Vec<CString> = cmd.iter().map(|s| CString::new(s.as_str()).unwrap()).collect();

    match unsafe { nix::unistd::fork() }.map_err(|e| Error::Io(std::io::Error::from(e)))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let _ = nix::unistd::execvp(&argv[0], &argv);
            // execvp only returns on failure.
            std::process::exit(127)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_argv_runs_true_and_exits_zero() {
        let l = Loop::new().unwrap();
        let pid = spawn_argv(&["/bin/true".to_string()]).unwrap();
        let got = std::rc::Rc::new(std::cell::RefCell::new(None));
        let got2 = got.clone();
        l.watch_child(pid, move |_, status| *got2.borrow_mut() = Some(status)).unwrap();
        l.once(Some(std::time::Duration::from_millis(500)), None::<fn(&Loop)>);
        assert_eq!(*got.borrow(), Some(0));
    }
}
