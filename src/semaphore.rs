//! `Semaphore` (spec §4.11 / §6): a thin specialisation of `Routine`. A
//! `raise(identity, pid)` either becomes the sole in-flight call for that
//! identity (dispatched through the wrapped routine's single worker) or,
//! if `identity` is already held by someone else, is cancelled immediately
//! without dispatching a second call at all -- there is nothing to
//! piggyback on, since the routine itself has no notion of "the same
//! request already in flight" (§6 Open Question: "returns true without
//! calling", resolved here as an immediate `Cancelled` rather than a
//! queued result, since a forked worker's reply can't be faithfully
//! duplicated to a second caller after the fact).
//!
//! The lock is released from the *parent* side, in the leader future's
//! `on_ready` continuation -- not from inside the forked worker -- since
//! the worker runs in its own address space after `fork` and can't mutate
//! the in-process `NamedLock` the parent holds.

use crate::codec::Codec;
use crate::config::NamedLock;
use crate::error::Result;
use crate::future::LoopFuture;
use crate::reactor::Loop;
use crate::routine::Routine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub struct Semaphore<Resp: Clone + 'static> {
    loop_: Loop,
    lock: Rc<dyn NamedLock>,
    routine: Rc<Routine<(String, i32), Resp>>,
    /// Identities this instance currently believes are held on its behalf,
    /// so `Drop` can release anything still outstanding.
    held: RefCell<HashMap<String, i32>>,
}

impl<Resp> Semaphore<Resp>
where
    Resp: Serialize + DeserializeOwned + Clone + 'static,
{
    /// Wraps a sync worker (`(identity, pid) -> Resp`) as the routine every
    /// `raise` dispatches through.
    pub fn new(
        loop_: Loop,
        codec: Codec,
        lock: Rc<dyn NamedLock>,
        worker: impl Fn((String, i32)) -> Resp + 'static,
    ) -> Result<Rc<Self>> {
        let routine = Routine::spawn_sync(loop_.clone(), codec, worker)?;
        Ok(Rc::new(Self { loop_, lock, routine, held: RefCell::new(HashMap::new()) }))
    }

    /// Raises `identity` on behalf of `pid`. Becomes the leader (and
    /// dispatches through the wrapped routine) iff `identity` isn't already
    /// held; otherwise cancels immediately.
    pub fn raise(self: &Rc<Self>, identity: &str, pid: i32) -> LoopFuture<Resp> {
        if !self.lock.set(identity, false) {
            let fut = LoopFuture::new(self.loop_.clone());
            fut.cancel();
            return fut;
        }
        self.held.borrow_mut().insert(identity.to_string(), pid);

        let leader = match self.routine.call(&self.loop_, &(identity.to_string(), pid)) {
            Ok(fut) => fut,
            Err(e) => {
                self.release(identity, pid);
                let fut = LoopFuture::new(self.loop_.clone());
                fut.fail(e.to_string());
                return fut;
            }
        };

        let this = self.clone();
        let identity = identity.to_string();
        leader.on_ready(move |_l, _result| this.release(&identity, pid));
        leader
    }

    fn release(&self, identity: &str, pid: i32) {
        self.lock.reset(identity, pid);
        self.held.borrow_mut().remove(identity);
    }
}

impl<Resp: Clone + 'static> Drop for Semaphore<Resp> {
    fn drop(&mut self) {
        for (identity, pid) in self.held.borrow_mut().drain() {
            self.lock.reset(&identity, pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalLock;
    use crate::future::FutureResult;
    use std::time::Duration;

    #[test]
    fn raising_an_identity_already_held_elsewhere_is_cancelled_without_dispatching() {
        let l = Loop::new().unwrap();
        let lock = Rc::new(LocalLock::default());
        lock.set("k", false); // simulates another in-flight holder
        let sem: Rc<Semaphore<u32>> = Semaphore::new(l.clone(), Codec::Native, lock, |(_id, _pid): (String, i32)| 0u32).unwrap();

        let fut = sem.raise("k", 42);
        match fut.wait() {
            FutureResult::Cancelled => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn raise_dispatches_through_the_wrapped_routine_and_releases_the_lock_on_completion() {
        let l = Loop::new().unwrap();
        let lock = Rc::new(LocalLock::default());
        let sem: Rc<Semaphore<String>> = Semaphore::new(l.clone(), Codec::Native, lock.clone(), |(id, pid): (String, i32)| {
            format!("{id}:{pid}")
        })
        .unwrap();

        let fut = sem.raise("k", 7);
        l.once(Some(Duration::from_millis(200)), None::<fn(&Loop)>);
        match fut.wait() {
            FutureResult::Done(v) => assert_eq!(v, "k:7"),
            other => panic!("expected Done, got {other:?}"),
        }

        // The lock was released once the leader's response arrived.
        assert!(lock.set("k", false));
    }
}
