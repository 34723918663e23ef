//! `Periodical` (spec §4.4): a start/stop/restart wrapper over a single
//! `Loop` timer slot, so callers don't juggle timer ids by hand.

use crate::reactor::{Loop, TimerId, TimerSpec};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

pub struct Periodical {
    loop_: Loop,
    id: TimerId,
    interval: Duration,
    cb: Rc<RefCell<Box<dyn FnMut(&Loop)>>>,
    running: Cell<bool>,
}

impl Periodical {
    pub fn new(loop_: Loop, interval: Duration, cb: impl FnMut(&Loop) + 'static) -> Rc<Self> {
        let id = loop_.uuid();
        Rc::new(Self {
            loop_,
            id,
            interval,
            cb: Rc::new(RefCell::new(Box::new(cb))),
            running: Cell::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Arms the timer if not already running. No-op if already running.
    pub fn start(self: &Rc<Self>) {
        if self.running.get() {
            return;
        }
        self.running.set(true);
        let cb = self.cb.clone();
        self.loop_.watch_time(
            self.id,
            move |l| (cb.borrow_mut())(l),
            self.interval,
            TimerSpec::Periodic,
        );
    }

    /// Disarms the timer. No-op if not running.
    pub fn stop(&self) {
        if !self.running.get() {
            return;
        }
        self.running.set(false);
        self.loop_.unwatch_time(self.id);
    }

    pub fn restart(self: &Rc<Self>) {
        self.stop();
        self.start();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    #[test]
    fn start_stop_toggles_running() {
        let l = Loop::new().unwrap();
        let ticks = Rc::new(StdCell::new(0));
        let ticks2 = ticks.clone();
        let p = Periodical::new(l.clone(), Duration::from_millis(2), move |_| ticks2.set(ticks2.get() + 1));
        assert!(!p.is_running());
        p.start();
        assert!(p.is_running());
        p.stop();
        assert!(!p.is_running());
    }
}
