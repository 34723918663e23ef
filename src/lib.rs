//! A single-threaded, cooperative event loop and fork-based worker IPC
//! runtime: one reactor multiplexes timers, idle hooks, signals, FD
//! readiness and child-process reaping; notifiers (streams, channels,
//! routines, pools, semaphores, file watchers) are all built on top of it.
//!
//! Linux-only: relies on `epoll` and `inotify` directly rather than a
//! cross-platform polling abstraction.

#![cfg(target_os = "linux")]

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod factory;
pub mod file_stream;
pub mod file_watcher;
pub mod future;
pub mod handle;
pub mod logging;
pub mod notifier;
pub mod periodical;
pub mod pool;
pub mod process;
pub mod reactor;
pub mod routine;
pub mod semaphore;
pub mod stream;

pub use channel::{Channel, Mode};
pub use codec::Codec;
pub use config::{Builder, Config, DefaultBuilder, NamedLock};
pub use error::{Error, Result};
pub use factory::{Factory, NotifierKind};
pub use file_stream::FileStream;
pub use file_watcher::{FileEvent, FileEventKind, FileWatcher, Stat};
pub use future::{FutureResult, LoopFuture};
pub use handle::Handle;
pub use periodical::Periodical;
pub use pool::Pool;
pub use process::{ChildCode, Process};
pub use reactor::{AttachmentId, Direction, Loop, StopArgs, TimerId, TimerSpec};
pub use routine::Routine;
pub use semaphore::Semaphore;
pub use stream::{ReadOutcome, Stream, WriteData};
