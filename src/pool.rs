//! `Pool` (spec §4.10 "Function/Pool"): a round-robin set of up to
//! `max_workers` `Routine` workers. Workers are created on demand --
//! nothing is spawned until `call` first dispatches to a given slot -- and
//! respawned, also on demand, after a worker exits (crashed, or retired
//! once it's served `max_calls` requests). The cursor only ever walks
//! forward through the slot `Vec` (wrapping), so a slot going empty and
//! being refilled later doesn't perturb whichever position the next
//! dispatch would have landed on.

use crate::codec::Codec;
use crate::error::Result;
use crate::future::LoopFuture;
use crate::reactor::Loop;
use crate::routine::Routine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Slot<Req, Resp> {
    routine: Rc<Routine<Req, Resp>>,
    calls: usize,
}

pub struct Pool<Req, Resp> {
    loop_: Loop,
    codec: Codec,
    max_workers: usize,
    max_calls: Option<usize>,
    worker: Rc<dyn Fn(Req) -> Resp>,
    slots: RefCell<Vec<Option<Slot<Req, Resp>>>>,
    cursor: Cell<usize>,
}

impl<Req, Resp> Pool<Req, Resp>
where
    Req: Serialize + DeserializeOwned + 'static,
    Resp: Serialize + DeserializeOwned + Clone + 'static,
{
    /// Builds a pool with room for up to `max_workers` sync workers. No
    /// child process exists yet -- the first `call` to reach each slot
    /// spawns it.
    pub fn new_sync(loop_: Loop, codec: Codec, max_workers: usize, worker: impl Fn(Req) -> Resp + 'static) -> Self {
        let mut slots = Vec::with_capacity(max_workers);
        slots.resize_with(max_workers, || None);
        Self {
            loop_,
            codec,
            max_workers,
            max_calls: None,
            worker: Rc::new(worker),
            slots: RefCell::new(slots),
            cursor: Cell::new(0),
        }
    }

    /// Retires and lazily respawns a worker once it's served this many
    /// calls. Builder-style, call before the pool is shared as an `Rc`.
    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = Some(max_calls);
        self
    }

    pub fn size(&self) -> usize {
        self.max_workers
    }

    /// How many slots currently hold a spawned worker (as opposed to being
    /// empty, awaiting their first dispatch).
    pub fn active_workers(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn ensure_slot(self: &Rc<Self>, idx: usize) -> Result<Rc<Routine<Req, Resp>>> {
        if let Some(slot) = self.slots.borrow()[idx].as_ref() {
            return Ok(slot.routine.clone());
        }

        let worker = self.worker.clone();
        let routine = Routine::spawn_sync(self.loop_.clone(), self.codec, move |req| worker(req))?;

        let weak = Rc::downgrade(self);
        routine.process().watch_exit(&self.loop_, move |_l, _code| {
            if let Some(pool) = weak.upgrade() {
                pool.slots.borrow_mut()[idx] = None;
            }
        })?;

        self.slots.borrow_mut()[idx] = Some(Slot { routine: routine.clone(), calls: 0 });
        Ok(routine)
    }

    fn retire_slot(self: &Rc<Self>, idx: usize) {
        if let Some(slot) = self.slots.borrow_mut()[idx].take() {
            let _ = slot.routine.process().kill(nix::sys::signal::Signal::SIGTERM);
        }
    }

    /// Dispatches `req` to the next worker in rotation, spawning its slot
    /// first if empty.
    pub fn call(self: &Rc<Self>, req: &Req) -> Result<LoopFuture<Resp>> {
        let idx = self.cursor.get();
        self.cursor.set((idx + 1) % self.max_workers);
        let routine = self.ensure_slot(idx)?;
        let fut = routine.call(&self.loop_, req)?;

        if let Some(max_calls) = self.max_calls {
            let calls = {
                let mut slots = self.slots.borrow_mut();
                let slot = slots[idx].as_mut().expect("ensure_slot just populated this slot");
                slot.calls += 1;
                slot.calls
            };
            if calls >= max_calls {
                // Wait for this call's response before tearing the worker
                // down, so the in-flight request isn't dropped along with it.
                let weak = Rc::downgrade(self);
                fut.on_ready(move |_l, _result| {
                    if let Some(pool) = weak.upgrade() {
                        pool.retire_slot(idx);
                    }
                });
            }
        }
        Ok(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn round_robins_across_workers_spawned_on_demand() {
        let l = Loop::new().unwrap();
        let pool: Rc<Pool<u32, u32>> = Rc::new(Pool::new_sync(l.clone(), Codec::Native, 3, |n| n + 1));
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.active_workers(), 0);

        let futs: Vec<_> = (0..3).map(|i| pool.call(&i).unwrap()).collect();
        assert_eq!(pool.active_workers(), 3);

        l.once(Some(Duration::from_millis(200)), None::<fn(&Loop)>);
        for (i, fut) in futs.into_iter().enumerate() {
            match fut.wait() {
                crate::future::FutureResult::Done(v) => assert_eq!(v, i as u32 + 1),
                _ => panic!("expected a response"),
            }
        }
    }

    #[test]
    fn worker_is_retired_and_respawned_after_max_calls() {
        let l = Loop::new().unwrap();
        let pool: Rc<Pool<u32, u32>> = Rc::new(Pool::new_sync(l.clone(), Codec::Native, 1, |n| n + 1).with_max_calls(1));

        let fut1 = pool.call(&1).unwrap();
        l.once(Some(Duration::from_millis(200)), None::<fn(&Loop)>);
        match fut1.wait() {
            crate::future::FutureResult::Done(v) => assert_eq!(v, 2),
            _ => panic!("expected a response"),
        }

        for _ in 0..20 {
            l.once(Some(Duration::from_millis(20)), None::<fn(&Loop)>);
            if pool.active_workers() == 0 {
                break;
            }
        }
        assert_eq!(pool.active_workers(), 0);

        let fut2 = pool.call(&10).unwrap();
        l.once(Some(Duration::from_millis(200)), None::<fn(&Loop)>);
        match fut2.wait() {
            crate::future::FutureResult::Done(v) => assert_eq!(v, 11),
            _ => panic!("expected a response"),
        }
    }
}
