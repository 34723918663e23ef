//! `FileStream` notifier (spec §6/§8 scenario 6): tails a regular file
//! line-by-line, growth-driven by an underlying `FileWatcher` rather than
//! fd readiness (regular files aren't epoll-pollable the way pipes and
//! sockets are).
//!
//! Construction seeks to the file's current end -- a freshly built
//! `FileStream` only sees lines appended *after* it starts watching, the
//! usual `tail -f` contract. `offset` tracks the read-resumption point
//! (the full length already consumed); `partial` carries a previously
//! incomplete trailing line across reads so a line split across two growth
//! events isn't reported twice or truncated.

use crate::error::Result;
use crate::file_watcher::{FileEventKind, FileWatcher};
use crate::reactor::Loop;
use std::cell::RefCell;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

pub struct FileStream {
    watcher: Rc<FileWatcher>,
    offset: RefCell<u64>,
    partial: RefCell<Vec<u8>>,
    on_line: RefCell<Option<Box<dyn FnMut(&Loop, Vec<u8>)>>>,
}

impl FileStream {
    pub fn native(loop_: Loop, path: impl Into<PathBuf>) -> Result<Rc<Self>> {
        let watcher = FileWatcher::native(loop_, path)?;
        Ok(Self::wrap(watcher))
    }

    pub fn polling(loop_: Loop, path: impl Into<PathBuf>, interval: Duration) -> Rc<Self> {
        let watcher = FileWatcher::polling(loop_, path, interval);
        Self::wrap(watcher)
    }

    fn wrap(watcher: Rc<FileWatcher>) -> Rc<Self> {
        let initial_offset = fs::metadata(watcher.path()).map(|m| m.len()).unwrap_or(0);
        let stream = Rc::new(Self {
            watcher: watcher.clone(),
            offset: RefCell::new(initial_offset),
            partial: RefCell::new(Vec::new()),
            on_line: RefCell::new(None),
        });

        let weak = Rc::downgrade(&stream);
        watcher.on_event(move |l, ev| {
            let Some(s) = weak.upgrade() else { return };
            match ev.kind {
                FileEventKind::Created => {
                    *s.offset.borrow_mut() = 0;
                    s.partial.borrow_mut().clear();
                    s.drain(l);
                }
                FileEventKind::Deleted => {
                    *s.offset.borrow_mut() = 0;
                    s.partial.borrow_mut().clear();
                }
            }
        });

        let weak = Rc::downgrade(&stream);
        watcher.on_stat_changed(move |l, old, new| {
            if new.size > old.size {
                if let Some(s) = weak.upgrade() {
                    s.drain(l);
                }
            }
        });

        stream
    }

    /// Registers the callback fired once per complete (`\n`-terminated)
    /// line appended to the file. A trailing partial line is held back
    /// until a following write completes it.
    pub fn on_line(&self, cb: impl FnMut(&Loop, Vec<u8>) + 'static) {
        *self.on_line.borrow_mut() = Some(Box::new(cb));
    }

    pub fn path(&self) -> &std::path::Path {
        self.watcher.path()
    }

    fn drain(self: &Rc<Self>, l: &Loop) {
        let mut f = match fs::File::open(self.watcher.path()) {
            Ok(f) => f,
            Err(_) => return,
        };
        let start = *self.offset.borrow();
        if f.seek(SeekFrom::Start(start)).is_err() {
            return;
        }
        let mut chunk = Vec::new();
        if f.read_to_end(&mut chunk).is_err() {
            return;
        }
        *self.offset.borrow_mut() = start + chunk.len() as u64;

        let mut buf = std::mem::take(&mut *self.partial.borrow_mut());
        buf.extend_from_slice(&chunk);

        let mut rest: &[u8] = &buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let line = rest[..pos].to_vec();
            rest = &rest[pos + 1..];
            if let Some(cb) = self.on_line.borrow_mut().as_mut() {
                cb(l, line);
            }
        }
        *self.partial.borrow_mut() = rest.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tails_only_lines_appended_after_construction() {
        let l = Loop::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.log");
        fs::write(&path, "line one\n").unwrap();

        let stream = FileStream::polling(l.clone(), &path, Duration::from_millis(5));
        let lines = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
        let lines2 = lines.clone();
        stream.on_line(move |_, line| lines2.borrow_mut().push(line));

        std::thread::sleep(Duration::from_millis(10));
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "line two").unwrap();
        writeln!(f, "line three").unwrap();
        drop(f);

        for _ in 0..10 {
            l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
            if lines.borrow().len() >= 2 {
                break;
            }
        }

        assert_eq!(lines.borrow().as_slice(), &[b"line two".to_vec(), b"line three".to_vec()]);
    }

    #[test]
    fn a_line_split_across_two_writes_is_reported_once_and_whole() {
        let l = Loop::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.log");
        fs::write(&path, "").unwrap();

        let stream = FileStream::polling(l.clone(), &path, Duration::from_millis(5));
        let lines = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
        let lines2 = lines.clone();
        stream.on_line(move |_, line| lines2.borrow_mut().push(line));

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "half").unwrap();
        f.flush().unwrap();
        for _ in 0..5 {
            l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
        }
        assert!(lines.borrow().is_empty());

        writeln!(f, "-line").unwrap();
        drop(f);
        for _ in 0..10 {
            l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
            if !lines.borrow().is_empty() {
                break;
            }
        }

        assert_eq!(lines.borrow().as_slice(), &[b"half-line".to_vec()]);
    }
}
