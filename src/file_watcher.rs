//! `FileWatcher` (spec §4.1 supplement / §9.2): watches a path for
//! creation, deletion, and per-field metadata changes. Two backends:
//!
//! - **native** (default on Linux): an `inotify` instance whose fd is
//!   watched through the same `Loop::watch_read_handle` path any other fd
//!   notifier uses -- no separate poll source. The target file doesn't
//!   need to exist at construction time: the watcher always holds a watch
//!   on the *parent directory* for `CREATE`/`MOVED_TO` entries matching the
//!   target's filename, and layers a second, per-file watch
//!   (`ATTRIB`/`MODIFY`/`DELETE_SELF`/`MOVE_SELF`) on top once the file
//!   actually exists -- re-established across delete-then-recreate cycles.
//! - **polling**: a `Periodical` stat-diffing the path on each tick, for
//!   filesystems or platforms where inotify isn't available.
//!
//! Both backends funnel into one `check` method that diffs the previous and
//! current `Stat`, so inotify here is purely a wakeup signal -- the actual
//! event classification (created/deleted/which fields changed) is the same
//! stat-diff logic the polling backend's timer drives directly.

use crate::error::{Error, Result};
use crate::periodical::Periodical;
use crate::reactor::Loop;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// A snapshot of the `stat(2)` fields the spec tracks for change detection,
/// via `std::os::unix::fs::MetadataExt` (no extra crate needed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Stat {
    fn from_metadata(m: &fs::Metadata) -> Self {
        Self {
            dev: m.dev(),
            ino: m.ino(),
            mode: m.mode(),
            nlink: m.nlink(),
            uid: m.uid(),
            gid: m.gid(),
            rdev: m.rdev(),
            size: m.size(),
            atime: m.atime(),
            mtime: m.mtime(),
            ctime: m.ctime(),
        }
    }
}

enum Backend {
    Native {
        inotify: RefCell<Inotify>,
        dir_wd: RefCell<Option<WatchDescriptor>>,
        file_wd: RefCell<Option<WatchDescriptor>>,
        filename: OsString,
    },
    Polling {
        periodical: RefCell<Option<Rc<Periodical>>>,
    },
}

pub struct FileWatcher {
    loop_: Loop,
    path: PathBuf,
    backend: Backend,
    on_event: RefCell<Option<Box<dyn FnMut(&Loop, FileEvent)>>>,
    /// Fires with `(old, new)` whenever any tracked field differs between
    /// two observations.
    on_stat_changed: RefCell<Option<Box<dyn FnMut(&Loop, Stat, Stat)>>>,
    /// Fires with `(old, new)` specifically when `dev`/`ino` differ -- the
    /// path now refers to a different underlying file (e.g. replaced via a
    /// rename-over-existing-name).
    on_devino_changed: RefCell<Option<Box<dyn FnMut(&Loop, Stat, Stat)>>>,
    last_seen: RefCell<Option<Stat>>,
}

impl FileWatcher {
    /// Builds a native (inotify-backed) watcher. Succeeds even if `path`
    /// doesn't exist yet.
    pub fn native(loop_: Loop, path: impl Into<PathBuf>) -> Result<Rc<Self>> {
        let path = path.into();
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new(".")).to_path_buf();
        let filename = path
            .file_name()
            .ok_or_else(|| Error::WatcherCreateFailed("path has no filename component".to_string()))?
            .to_os_string();

        let mut inotify = Inotify::init().map_err(|e| Error::WatcherCreateFailed(e.to_string()))?;
        let dir_wd = inotify
            .watches()
            .add(&parent, WatchMask::CREATE | WatchMask::MOVED_TO)
            .map_err(|e| Error::WatcherCreateFailed(e.to_string()))?;

        let watcher = Rc::new(Self {
            loop_: loop_.clone(),
            path,
            backend: Backend::Native {
                inotify: RefCell::new(inotify),
                dir_wd: RefCell::new(Some(dir_wd)),
                file_wd: RefCell::new(None),
                filename,
            },
            on_event: RefCell::new(None),
            on_stat_changed: RefCell::new(None),
            on_devino_changed: RefCell::new(None),
            last_seen: RefCell::new(None),
        });

        watcher.prime_stat();
        watcher.ensure_file_watch();

        let fd = match &watcher.backend {
            Backend::Native { inotify, .. } => inotify.borrow().as_raw_fd(),
            _ => unreachable!(),
        };
        let weak = Rc::downgrade(&watcher);
        loop_.watch_read_handle(fd, move |l| {
            if let Some(w) = weak.upgrade() {
                w.drain_inotify(l);
            }
        })?;

        Ok(watcher)
    }

    /// Builds a polling (stat-diff) watcher, checking every `interval`.
    pub fn polling(loop_: Loop, path: impl Into<PathBuf>, interval: Duration) -> Rc<Self> {
        let path = path.into();
        let watcher = Rc::new(Self {
            loop_: loop_.clone(),
            path,
            backend: Backend::Polling { periodical: RefCell::new(None) },
            on_event: RefCell::new(None),
            on_stat_changed: RefCell::new(None),
            on_devino_changed: RefCell::new(None),
            last_seen: RefCell::new(None),
        });
        watcher.prime_stat();

        let weak = Rc::downgrade(&watcher);
        let periodical = Periodical::new(loop_, interval, move |l| {
            if let Some(w) = weak.upgrade() {
                w.check(l);
            }
        });
        periodical.start();
        if let Backend::Polling { periodical: slot } = &watcher.backend {
            *slot.borrow_mut() = Some(periodical);
        }
        watcher
    }

    pub fn on_event(&self, cb: impl FnMut(&Loop, FileEvent) + 'static) {
        *self.on_event.borrow_mut() = Some(Box::new(cb));
    }

    pub fn on_stat_changed(&self, cb: impl FnMut(&Loop, Stat, Stat) + 'static) {
        *self.on_stat_changed.borrow_mut() = Some(Box::new(cb));
    }

    pub fn on_devino_changed(&self, cb: impl FnMut(&Loop, Stat, Stat) + 'static) {
        *self.on_devino_changed.borrow_mut() = Some(Box::new(cb));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn emit(&self, l: &Loop, kind: FileEventKind) {
        if let Some(cb) = self.on_event.borrow_mut().as_mut() {
            cb(l, FileEvent { path: self.path.clone(), kind });
        }
    }

    fn prime_stat(&self) {
        if let Ok(meta) = fs::metadata(&self.path) {
            *self.last_seen.borrow_mut() = Some(Stat::from_metadata(&meta));
        }
    }

    /// Diffs the current stat against the last observation and fires
    /// whichever events apply. Shared by both backends: inotify just wakes
    /// this up sooner than the polling timer would.
    fn check(&self, l: &Loop) {
        let current = fs::metadata(&self.path).ok().map(|m| Stat::from_metadata(&m));
        let previous = self.last_seen.replace(current);
        match (previous, current) {
            (None, Some(_)) => self.emit(l, FileEventKind::Created),
            (Some(_), None) => self.emit(l, FileEventKind::Deleted),
            (Some(p), Some(c)) if p != c => {
                if p.dev != c.dev || p.ino != c.ino {
                    if let Some(cb) = self.on_devino_changed.borrow_mut().as_mut() {
                        cb(l, p, c);
                    }
                }
                if let Some(cb) = self.on_stat_changed.borrow_mut().as_mut() {
                    cb(l, p, c);
                }
            }
            _ => {}
        }
    }

    fn ensure_file_watch(&self) {
        let Backend::Native { inotify, file_wd, .. } = &self.backend else { return };
        if file_wd.borrow().is_some() || !self.path.exists() {
            return;
        }
        if let Ok(wd) = inotify
            .borrow_mut()
            .watches()
            .add(&self.path, WatchMask::ATTRIB | WatchMask::MODIFY | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF)
        {
            *file_wd.borrow_mut() = Some(wd);
        }
    }

    fn clear_file_watch(&self) {
        let Backend::Native { inotify, file_wd, .. } = &self.backend else { return };
        if let Some(wd) = file_wd.borrow_mut().take() {
            let _ = inotify.borrow_mut().watches().remove(wd);
        }
    }

    fn drain_inotify(&self, l: &Loop) {
        let Backend::Native { inotify, filename, .. } = &self.backend else { return };
        let mut buf = [0u8; 4096];
        let events: Vec<(inotify::EventMask, Option<OsString>)> = match inotify.borrow_mut().read_events(&mut buf) {
            Ok(events) => events.map(|ev| (ev.mask, ev.name.map(|n| n.to_os_string()))).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(_) => return,
        };

        let mut should_check = false;
        for (mask, name) in events {
            let is_dir_entry_event = name.as_deref() == Some(filename.as_os_str());
            if is_dir_entry_event && (mask.contains(EventMask::CREATE) || mask.contains(EventMask::MOVED_TO)) {
                self.ensure_file_watch();
                should_check = true;
            } else if mask.contains(EventMask::DELETE_SELF) || mask.contains(EventMask::MOVE_SELF) {
                self.clear_file_watch();
                should_check = true;
            } else if !is_dir_entry_event {
                // ATTRIB/MODIFY on the file's own watch, or an unrelated
                // directory entry we don't otherwise care about.
                should_check = true;
            }
        }
        if should_check {
            self.check(l);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    #[test]
    fn polling_watcher_fires_stat_changed_on_modification() {
        let l = Loop::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, "one").unwrap();

        let watcher = FileWatcher::polling(l.clone(), &path, Duration::from_millis(5));
        let changed = Rc::new(Cell::new(false));
        let changed2 = changed.clone();
        watcher.on_stat_changed(move |_, old, new| {
            assert!(new.size > old.size);
            changed2.set(true);
        });

        std::thread::sleep(Duration::from_millis(10));
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "more").unwrap();
        drop(f);

        for _ in 0..5 {
            l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
        }
        assert!(changed.get());
    }

    #[test]
    fn polling_watcher_detects_create_and_delete_of_a_not_yet_existing_path() {
        let l = Loop::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-yet.txt");

        let watcher = FileWatcher::polling(l.clone(), &path, Duration::from_millis(5));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        watcher.on_event(move |_, ev| seen2.borrow_mut().push(ev.kind));

        fs::write(&path, "hello").unwrap();
        for _ in 0..5 {
            l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
        }
        assert_eq!(seen.borrow().as_slice(), [FileEventKind::Created]);

        fs::remove_file(&path).unwrap();
        for _ in 0..5 {
            l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
        }
        assert_eq!(seen.borrow().as_slice(), [FileEventKind::Created, FileEventKind::Deleted]);
    }
}
