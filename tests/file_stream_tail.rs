//! Seed scenario: tailing a growing file through the `FileStream` notifier
//! (not hand-rolled tailing logic) -- a `FileWatcher` underneath notices
//! growth and `FileStream` turns the appended bytes into whole lines.

use async_ipc_rt::{FileStream, Loop};
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn tail_reports_only_newly_appended_whole_lines() {
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
    drop(f);

    for _ in 0..10 {
        l.once(Some(Duration::from_millis(10)), None::<fn(&Loop)>);
        if !lines.borrow().is_empty() {
            break;
        }
    }

    assert_eq!(lines.borrow().as_slice(), &[b"line two".to_vec()]);
}
