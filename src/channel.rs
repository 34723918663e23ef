//! `Channel` (spec §4.8): a length-prefixed framed duplex transport between
//! a parent and a forked worker. Frames are `u32` (native byte order) length
//! prefix + codec payload.
//!
//! Each direction (read/write) has its own `Mode`:
//!
//! - **Async**: driven by a `Stream` over the reactor, frames delivered via
//!   `on_frame` -- the same buffered `read_exactly(4)` / `read_exactly(len)`
//!   chain any other stream consumer uses, just queued recursively.
//! - **Sync**: no `Stream`, no reactor registration at all. The channel's raw
//!   fd is read/written with blocking syscalls directly -- this is what a
//!   `Routine::spawn_sync` child uses, since it never builds a `Loop` of its
//!   own.
//!
//! A `socketpair(2)`'s two endpoints are independent file descriptions, so
//! `O_NONBLOCK` can be set per-side after creation: `pair_asymmetric` always
//! creates the pair blocking, then selectively flips each side to
//! non-blocking depending on its `Mode`, letting one `socketpair` call serve
//! an Async parent / Sync child split in one shot.

use crate::codec::Codec;
use crate::error::{is_retryable, Error, Result};
use crate::reactor::Loop;
use crate::stream::{ReadOutcome, Stream};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Driven by the reactor through a `Stream`; never blocks.
    Async,
    /// Direct blocking syscalls on the raw fd; no `Loop` involvement.
    Sync,
}

pub struct Channel {
    fd: RawFd,
    stream: Option<Rc<Stream>>,
    codec: Codec,
    closed: Cell<bool>,
    on_frame: RefCell<Option<Box<dyn FnMut(&Loop, Vec<u8>)>>>,
    on_error: RefCell<Option<Box<dyn FnMut(&Loop, Error)>>>,
}

impl Channel {
    /// Creates a symmetric pair: both sides use the same `mode`.
    pub fn pair(loop_: Loop, codec: Codec, mode: Mode) -> Result<(Rc<Channel>, Rc<Channel>)> {
        Self::pair_asymmetric(loop_, codec, mode, mode)
    }

    /// Creates a pair where each side may run in a different `Mode` (spec
    /// §4.8: a sync child and an async parent sharing one `socketpair`).
    pub fn pair_asymmetric(
        loop_: Loop,
        codec: Codec,
        side_a: Mode,
        side_b: Mode,
    ) -> Result<(Rc<Channel>, Rc<Channel>)> {
        let (a, b) =
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).map_err(|e| Error::Io(std::io::Error::from(e)))?;
        if side_a == Mode::Async {
            set_nonblocking(a)?;
        }
        if side_b == Mode::Async {
            set_nonblocking(b)?;
        }
        Ok((Self::from_fd(loop_.clone(), a, codec, side_a), Self::from_fd(loop_, b, codec, side_b)))
    }

    pub fn from_fd(loop_: Loop, fd: RawFd, codec: Codec, mode: Mode) -> Rc<Channel> {
        let stream = match mode {
            Mode::Async => Some(Stream::new(loop_, fd)),
            Mode::Sync => None,
        };
        let chan = Rc::new(Channel {
            fd,
            stream,
            codec,
            closed: Cell::new(false),
            on_frame: RefCell::new(None),
            on_error: RefCell::new(None),
        });
        if let Some(stream) = &chan.stream {
            stream.on_error({
                let weak = Rc::downgrade(&chan);
                move |l, err| {
                    if let Some(c) = weak.upgrade() {
                        c.dispatch_error(l, err);
                    }
                }
            });
            Self::queue_next_frame(&chan);
        }
        chan
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_sync(&self) -> bool {
        self.stream.is_none()
    }

    /// Registers the handler invoked with each frame's raw payload (Async
    /// mode only; a Sync channel is driven by direct `recv_sync` calls
    /// instead). Kept untyped since a single channel may in principle
    /// multiplex several message shapes across its lifetime.
    pub fn on_frame(&self, cb: impl FnMut(&Loop, Vec<u8>) + 'static) {
        *self.on_frame.borrow_mut() = Some(Box::new(cb));
    }

    pub fn on_error(&self, cb: impl FnMut(&Loop, Error) + 'static) {
        *self.on_error.borrow_mut() = Some(Box::new(cb));
    }

    /// Sends `value`, via the `Stream` write queue in Async mode or a
    /// direct blocking write in Sync mode.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        let framed = self.frame(value)?;
        match &self.stream {
            Some(stream) => stream.write(framed),
            None => blocking_write_all(self.fd, &framed),
        }
    }

    /// Blocking receive + decode, for a Sync-mode channel only. Returns
    /// `Ok(None)` on a clean EOF (peer closed its end).
    pub fn recv_sync<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.stream.is_some() {
            return Err(Error::Unspecified("recv_sync on an Async-mode channel"));
        }
        let Some(len_bytes) = blocking_read_exact(self.fd, LEN_PREFIX)? else {
            return Ok(None);
        };
        let len = u32::from_ne_bytes(len_bytes.try_into().expect("read_exact(4) guarantees 4 bytes")) as usize;
        let Some(payload) = blocking_read_exact(self.fd, len)? else {
            return Ok(None);
        };
        Ok(Some(self.codec.decode(&payload)?))
    }

    fn frame<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let payload = self.codec.encode(value)?;
        let len = payload.len() as u32;
        let mut framed = Vec::with_capacity(LEN_PREFIX + payload.len());
        framed.extend_from_slice(&len.to_ne_bytes());
        framed.extend_from_slice(&payload);
        Ok(framed)
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        self.codec.decode(payload)
    }

    fn dispatch_error(self: &Rc<Self>, l: &Loop, err: Error) {
        if let Some(cb) = self.on_error.borrow_mut().as_mut() {
            cb(l, err);
        }
    }

    fn queue_next_frame(chan: &Rc<Channel>) {
        let stream = chan.stream.clone().expect("queue_next_frame only called in Async mode");
        let weak_len = Rc::downgrade(chan);
        stream.read_exactly(LEN_PREFIX, move |l, outcome| {
            let Some(chan) = weak_len.upgrade() else { return };
            match outcome {
                ReadOutcome::Data(bytes) => {
                    let len = u32::from_ne_bytes(bytes.try_into().expect("read_exactly(4) guarantees 4 bytes")) as usize;
                    Self::queue_payload(&chan, len);
                }
                ReadOutcome::Eof(_) => {}
                ReadOutcome::Error(e) => chan.dispatch_error(l, e),
            }
        });
    }

    fn queue_payload(chan: &Rc<Channel>, len: usize) {
        let stream = chan.stream.clone().expect("queue_payload only called in Async mode");
        let weak_payload = Rc::downgrade(chan);
        stream.read_exactly(len, move |l, outcome| {
            let Some(chan) = weak_payload.upgrade() else { return };
            match outcome {
                ReadOutcome::Data(payload) => {
                    if let Some(cb) = chan.on_frame.borrow_mut().as_mut() {
                        cb(l, payload);
                    }
                    Self::queue_next_frame(&chan);
                }
                ReadOutcome::Eof(_) => {}
                ReadOutcome::Error(e) => chan.dispatch_error(l, e),
            }
        });
    }

    pub fn close_when_empty(&self) {
        match &self.stream {
            Some(stream) => stream.close_when_empty(),
            None => self.close_raw(),
        }
    }

    pub fn close_now(&self) {
        match &self.stream {
            Some(stream) => stream.close_now(),
            None => self.close_raw(),
        }
    }

    /// Closes the raw fd directly. Only meaningful in Sync mode: in Async
    /// mode the underlying `Stream`'s `Handle` already owns fd-closing duty.
    fn close_raw(&self) {
        if self.closed.replace(true) {
            return;
        }
        let _ = nix::unistd::close(self.fd);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.stream.is_none() {
            self.close_raw();
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Io(std::io::Error::from(e)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Io(std::io::Error::from(e)))?;
    Ok(())
}

/// Blocking read of exactly `n` bytes. `Ok(None)` on a clean EOF before any
/// bytes of this call were read; a partial read followed by EOF is a
/// genuine I/O error (the peer went away mid-frame).
pub(crate) fn blocking_read_exact(fd: RawFd, n: usize) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 4096];
    while out.len() < n {
        let want = (n - out.len()).min(buf.len());
        match nix::unistd::read(fd, &mut buf[..want]) {
            Ok(0) if out.is_empty() => return Ok(None),
            Ok(0) => return Err(Error::StreamClosing),
            Ok(got) => out.extend_from_slice(&buf[..got]),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) if is_retryable(e) => continue,
            Err(e) => return Err(Error::Io(std::io::Error::from(e))),
        }
    }
    Ok(Some(out))
}

pub(crate) fn blocking_write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match nix::unistd::write(fd, data) {
            Ok(0) => return Err(Error::StreamClosing),
            Ok(n) => data = &data[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) if is_retryable(e) => continue,
            Err(e) => return Err(Error::Io(std::io::Error::from(e))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn round_trips_a_framed_value() {
        let l = Loop::new().unwrap();
        let (a, b) = Channel::pair(l.clone(), Codec::Native, Mode::Async).unwrap();

        let received: Rc<StdRefCell<Vec<String>>> = Rc::new(StdRefCell::new(Vec::new()));
        let received2 = received.clone();
        let codec = Codec::Native;
        b.on_frame(move |_, payload| {
            let value: String = codec.decode(&payload).unwrap();
            received2.borrow_mut().push(value);
        });

        a.send(&"hello worker".to_string()).unwrap();
        l.once(Some(std::time::Duration::from_millis(50)), None::<fn(&Loop)>);
        assert_eq!(received.borrow().as_slice(), ["hello worker"]);
    }

    #[test]
    fn sync_side_sends_and_receives_with_blocking_calls() {
        let l = Loop::new().unwrap();
        let (a, b) = Channel::pair(l, Codec::Native, Mode::Sync).unwrap();
        assert!(a.is_sync());
        assert!(b.is_sync());

        a.send(&42u32).unwrap();
        let got: Option<u32> = b.recv_sync().unwrap();
        assert_eq!(got, Some(42));

        drop(a);
        let eof: Option<u32> = b.recv_sync().unwrap();
        assert_eq!(eof, None);
    }

    #[test]
    fn asymmetric_pair_lets_one_side_block_and_the_other_poll() {
        let l = Loop::new().unwrap();
        let (async_side, sync_side) = Channel::pair_asymmetric(l.clone(), Codec::Native, Mode::Async, Mode::Sync).unwrap();
        assert!(!async_side.is_sync());
        assert!(sync_side.is_sync());

        async_side.send(&7u32).unwrap();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);
        let got: Option<u32> = sync_side.recv_sync().unwrap();
        assert_eq!(got, Some(7));
    }
}
