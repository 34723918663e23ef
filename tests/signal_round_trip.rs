//! Seed scenario: a signal watch fires exactly once per raise and can be
//! unwatched by attachment id without disturbing a second watcher on the
//! same signal.

use async_ipc_rt::{Loop, StopArgs};
use nix::sys::signal::{raise, Signal};
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn signal_delivery_stops_the_loop() {
    let l = Loop::new().unwrap();
    let got = Rc::new(Cell::new(false));
    let got2 = got.clone();
    let l2 = l.clone();

    l.watch_signal(Signal::SIGUSR1, move |_| {
        got2.set(true);
        l2.stop(StopArgs::Reason("sigusr1".into()));
    })
    .unwrap();

    l.watch_time(
        l.uuid(),
        |_| raise(Signal::SIGUSR1).unwrap(),
        std::time::Duration::from_millis(10),
        async_ipc_rt::TimerSpec::Relative,
    );

    let args = l.start();
    assert!(got.get());
    matches!(args, StopArgs::Reason(ref r) if r == "sigusr1");
}

#[test]
fn two_watchers_on_the_same_signal_both_fire() {
    let l = Loop::new().unwrap();
    let count = Rc::new(Cell::new(0u32));
    let c1 = count.clone();
    let c2 = count.clone();

    let id_a = l.watch_signal(Signal::SIGUSR2, move |_| c1.set(c1.get() + 1)).unwrap();
    let _id_b = l.watch_signal(Signal::SIGUSR2, move |_| c2.set(c2.get() + 1)).unwrap();

    raise(Signal::SIGUSR2).unwrap();
    l.once(Some(std::time::Duration::from_millis(50)), None::<fn(&Loop)>);
    assert_eq!(count.get(), 2);

    l.unwatch_signal(Signal::SIGUSR2, Some(id_a));
    count.set(0);
    raise(Signal::SIGUSR2).unwrap();
    l.once(Some(std::time::Duration::from_millis(50)), None::<fn(&Loop)>);
    assert_eq!(count.get(), 1);
}
