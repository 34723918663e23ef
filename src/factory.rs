//! `Factory` (spec §6): a thin, `NotifierKind`-keyed constructor façade. The
//! distilled spec's dynamic `+classname` override (load an arbitrary class
//! at runtime in place of the built-in one) has no Rust equivalent -- there
//! is no runtime class loader -- so this factory only ever produces the
//! built-in notifier for each kind (SPEC_FULL.md §9.3, Open Question 4).

use crate::error::{Error, Result};
use crate::file_stream::FileStream;
use crate::file_watcher::FileWatcher;
use crate::reactor::Loop;
use crate::stream::Stream;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifierKind {
    Stream,
    Periodical,
    FileWatcher,
    FileStream,
}

/// Builds notifiers of a given `NotifierKind` against one `Loop`.
pub struct Factory {
    loop_: Loop,
}

impl Factory {
    pub fn new(loop_: Loop) -> Self {
        Self { loop_ }
    }

    pub fn stream(&self, fd: RawFd) -> Rc<Stream> {
        Stream::new(self.loop_.clone(), fd)
    }

    pub fn file_watcher(&self, path: impl Into<PathBuf>) -> Result<Rc<FileWatcher>> {
        FileWatcher::native(self.loop_.clone(), path)
    }

    pub fn file_stream(&self, path: impl Into<PathBuf>) -> Result<Rc<FileStream>> {
        FileStream::native(self.loop_.clone(), path)
    }

    /// Placeholder for the rejected dynamic-override path: always fails,
    /// kept so callers porting code that used `+classname` get a clear
    /// error instead of silently getting the built-in.
    pub fn by_classname(&self, classname: &str) -> Result<()> {
        Err(Error::ClassLoadFailed(classname.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classname_override_is_rejected() {
        let l = Loop::new().unwrap();
        let f = Factory::new(l);
        assert!(f.by_classname("SomeCustomStream").is_err());
    }
}
