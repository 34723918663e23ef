//! Seed scenario: native (inotify) watcher observes create/modify/delete of
//! a file under a temp directory, end to end through the reactor -- and,
//! per the parent-directory-watch design, the watcher is constructed
//! *before* the file exists at all.

use async_ipc_rt::{FileEventKind, FileWatcher, Loop};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn native_watcher_sees_create_stat_change_and_delete_of_a_not_yet_existing_file() {
    let l = Loop::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watched.txt");

    let watcher = FileWatcher::native(l.clone(), &path).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let events2 = events.clone();
    watcher.on_event(move |_, ev| events2.borrow_mut().push(ev.kind));

    let changed = Rc::new(RefCell::new(false));
    let changed2 = changed.clone();
    watcher.on_stat_changed(move |_, old, new| {
        assert!(new.size > old.size);
        *changed2.borrow_mut() = true;
    });

    fs::write(&path, "one").unwrap();
    for _ in 0..20 {
        l.once(Some(Duration::from_millis(20)), None::<fn(&Loop)>);
        if events.borrow().contains(&FileEventKind::Created) {
            break;
        }
    }
    assert!(events.borrow().contains(&FileEventKind::Created));

    fs::write(&path, "one two").unwrap();
    for _ in 0..20 {
        l.once(Some(Duration::from_millis(20)), None::<fn(&Loop)>);
        if *changed.borrow() {
            break;
        }
    }
    assert!(*changed.borrow());

    fs::remove_file(&path).unwrap();
    for _ in 0..20 {
        l.once(Some(Duration::from_millis(20)), None::<fn(&Loop)>);
        if events.borrow().contains(&FileEventKind::Deleted) {
            break;
        }
    }
    assert!(events.borrow().contains(&FileEventKind::Deleted));
}
