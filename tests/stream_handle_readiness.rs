//! Seed scenario: a `Stream` over a `socketpair` observes backpressure
//! (write queue draining triggers `on_drain`) and readiness transitions
//! (readable callback only fires once data is actually available).

use async_ipc_rt::{Loop, ReadOutcome, Stream};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[test]
fn on_drain_fires_once_the_write_queue_empties() {
    let l = Loop::new().unwrap();
    let (r, w) = nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::SOCK_NONBLOCK,
    )
    .unwrap();

    let stream = Stream::new(l.clone(), w);
    let drained = Rc::new(Cell::new(false));
    let drained2 = drained.clone();
    stream.on_drain(move |_| drained2.set(true));

    stream.write(b"ping".to_vec()).unwrap();
    l.once(Some(Duration::from_millis(50)), None::<fn(&Loop)>);
    assert!(drained.get());

    let mut buf = [0u8; 16];
    let n = nix::unistd::read(r, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    let _ = nix::unistd::close(r);
}

#[test]
fn read_until_eof_collects_everything_written_before_close() {
    let l = Loop::new().unwrap();
    let (r, w) = nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::SOCK_NONBLOCK,
    )
    .unwrap();

    let reader = Stream::new(l.clone(), r);
    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    reader.read_until_eof(move |_, outcome| match outcome {
        ReadOutcome::Eof(data) => *got2.borrow_mut() = data,
        _ => panic!("expected Eof"),
    });

    nix::unistd::write(w, b"first").unwrap();
    l.once(Some(Duration::from_millis(30)), None::<fn(&Loop)>);
    nix::unistd::write(w, b"second").unwrap();
    let _ = nix::unistd::close(w);
    l.once(Some(Duration::from_millis(30)), None::<fn(&Loop)>);

    assert_eq!(got.borrow().as_slice(), b"firstsecond");
}
