//! `Routine` (spec §4.10): a `Process` paired with a `Channel`, running a
//! worker function in the forked child and exposing call/response to the
//! parent. Two child execution styles, matching the spec's sync/async
//! worker split:
//!
//! - **sync**: the child never builds its own reactor; it blocks directly
//!   on its (true blocking, per spec §4.8) channel fd in a
//!   read-compute-write loop. Simple, and correct for workers that do
//!   nothing but CPU-bound or blocking work.
//! - **async**: the child builds its own `Loop` and `Channel` (a forked
//!   child never inherits the parent's reactor registrations -- each
//!   side's epoll instance is independent even though the fds survive the
//!   fork) and runs `before`/`after` hooks around `Loop::start()`, letting
//!   the worker body itself watch other notifiers while it's alive.
//!
//! The parent always talks to the child asynchronously via its own
//! `Channel`, matching requests to responses in send order (a single pipe
//! has no concurrent reordering, so no request id is needed).

use crate::channel::{Channel, Mode};
use crate::codec::Codec;
use crate::error::Result;
use crate::future::LoopFuture;
use crate::process::Process;
use crate::reactor::Loop;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub struct Routine<Req, Resp> {
    process: Process,
    channel: Rc<Channel>,
    pending: std::cell::RefCell<VecDeque<LoopFuture<Resp>>>,
    _req: PhantomData<Req>,
}

impl<Req, Resp> Routine<Req, Resp>
where
    Req: Serialize + DeserializeOwned + 'static,
    Resp: Serialize + DeserializeOwned + Clone + 'static,
{
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Spawns a worker that blocks directly on its channel fd, one request
    /// at a time, with no event loop of its own. The child's side of the
    /// pair is a true blocking fd (`Mode::Sync`), created asymmetrically so
    /// the parent's side stays `Mode::Async` without needing a second
    /// `fcntl` round trip after the fork.
    pub fn spawn_sync(loop_: Loop, codec: Codec, worker: impl Fn(Req) -> Resp + 'static) -> Result<Rc<Self>> {
        let (parent_chan, child_chan) = Channel::pair_asymmetric(loop_, codec, Mode::Async, Mode::Sync)?;
        let process = Process::fork(
            || {},
            move || {
                sync_child_loop(&child_chan, worker);
                std::process::exit(0)
            },
        )?;
        Ok(Self::wrap(process, parent_chan))
    }

    /// Spawns a worker with its own nested `Loop`, running `before` just
    /// before `Loop::start()` and `after` just after it returns.
    pub fn spawn_async(
        loop_: Loop,
        codec: Codec,
        before: impl FnOnce(&Loop, &Rc<Channel>) + 'static,
        after: impl FnOnce(&Loop) + 'static,
    ) -> Result<Rc<Self>> {
        let (parent_chan, child_fd) = Self::make_async_pair(&loop_, codec)?;
        let process = Process::fork(
            || {},
            move || {
                let child_loop = Loop::new().expect("child reactor");
                let child_chan = Channel::from_fd(child_loop.clone(), child_fd, codec, Mode::Async);
                before(&child_loop, &child_chan);
                child_loop.start();
                after(&child_loop);
                std::process::exit(0)
            },
        )?;
        Ok(Self::wrap(process, parent_chan))
    }

    /// Builds an Async/Async pair and leaks the child-side wrapper: its fd
    /// must survive the fork intact and be re-wrapped from scratch in the
    /// child's own reactor (a fresh `Loop` there has no registrations for
    /// it yet). This leak is specific to `spawn_async` -- `spawn_sync`'s
    /// child keeps using its own already-constructed `Rc<Channel>` directly,
    /// since `ForkResult::Child` just runs `child_body` with that value
    /// still intact, and `ForkResult::Parent` drops it immediately (closing
    /// the parent's copy of the child's fd end), which is exactly the
    /// desired cleanup.
    fn make_async_pair(loop_: &Loop, codec: Codec) -> Result<(Rc<Channel>, RawFd)> {
        let (parent_chan, child_chan) = Channel::pair(loop_.clone(), codec, Mode::Async)?;
        let child_fd = child_chan.fd();
        std::mem::forget(child_chan);
        Ok((parent_chan, child_fd))
    }

    fn wrap(process: Process, channel: Rc<Channel>) -> Rc<Self> {
        let routine = Rc::new(Self {
            process,
            channel,
            pending: std::cell::RefCell::new(VecDeque::new()),
            _req: PhantomData,
        });
        let weak = Rc::downgrade(&routine);
        routine.channel.on_frame(move |_l, payload| {
            let Some(routine) = weak.upgrade() else { return };
            let front = routine.pending.borrow_mut().pop_front();
            if let Some(fut) = front {
                match routine.channel.decode::<Resp>(&payload) {
                    Ok(resp) => fut.done(resp),
                    Err(e) => fut.fail(e.to_string()),
                }
            }
        });
        routine
    }

    /// Sends `req` and returns a future for the matching response.
    pub fn call(self: &Rc<Self>, loop_: &Loop, req: &Req) -> Result<LoopFuture<Resp>> {
        let fut = LoopFuture::new(loop_.clone());
        self.channel.send(req)?;
        self.pending.borrow_mut().push_back(fut.clone());
        Ok(fut)
    }

    pub fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }
}

fn sync_child_loop<Req, Resp>(channel: &Channel, worker: impl Fn(Req) -> Resp)
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    loop {
        let req: Req = match channel.recv_sync::<Req>() {
            Ok(Some(req)) => req,
            Ok(None) => break, // clean EOF: parent closed its end
            Err(_) => break,
        };
        let resp = worker(req);
        if channel.send(&resp).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_worker_doubles_its_input() {
        let l = Loop::new().unwrap();
        let routine: Rc<Routine<u32, u32>> = Routine::spawn_sync(l.clone(), Codec::Native, |n: u32| n * 2).unwrap();
        let fut = routine.call(&l, &21).unwrap();
        l.once(Some(std::time::Duration::from_millis(200)), None::<fn(&Loop)>);
        match fut.wait() {
            crate::future::FutureResult::Done(v) => assert_eq!(v, 42),
            _ => panic!("expected a response"),
        }
    }
}
