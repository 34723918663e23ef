//! `Stream` (spec §4.6/§4.7): a buffered, watermarked read/write layer over
//! a `Handle`. Incoming bytes accumulate in a read buffer until a pending
//! read request (`read_atmost`/`read_exactly`/`read_until`/`read_until_eof`/
//! `read_decoded`) can be satisfied; outgoing writes queue until the fd is
//! writeable, with `want_writeready` toggled on/off as the queue goes
//! non-empty/empty so the reactor never busy-polls a drained fd (mirrors
//! `Handle`'s "only watch what's wanted" contract).
//!
//! Writes accept three kinds of source (spec §4.7 `WriteData`): plain
//! bytes, a generator pulled lazily once its turn in the queue arrives, or
//! a `LoopFuture` whose resolved bytes are written once it's ready (the
//! queue blocks on it in place -- FIFO order, not reordering around it).
//! Each queued item carries its own optional `on_write`/`on_flush`/
//! `on_error` completion hooks, independent of the stream-wide `on_drain`.

use crate::error::{is_retryable, Error, Result};
use crate::future::{FutureResult, LoopFuture};
use crate::handle::Handle;
use crate::reactor::Loop;
use regex::bytes::Regex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

const DEFAULT_READ_HIGH_WATERMARK: usize = 1 << 20; // 1 MiB
const DEFAULT_READ_LOW_WATERMARK: usize = 1 << 16; // 64 KiB

enum ReadRequest {
    AtMost(usize),
    Exactly(usize),
    UntilEof,
    UntilPattern(Regex),
    /// Stop-at-partial decoder: called with the contiguous buffered bytes,
    /// returns the number consumed for one complete frame, or 0 if more
    /// data is needed. Must be a pure function of its input (it may be
    /// invoked more than once against the same bytes).
    Decode(Box<dyn FnMut(&[u8]) -> usize>),
}

struct PendingRead {
    request: ReadRequest,
    cb: Box<dyn FnOnce(&Loop, ReadOutcome)>,
}

/// What a satisfied (or failed) read request hands back.
pub enum ReadOutcome {
    Data(Vec<u8>),
    Eof(Vec<u8>),
    Error(Error),
}

/// The source of a queued write (spec §4.7).
pub enum WriteData {
    Bytes(Vec<u8>),
    /// Called repeatedly once this item reaches the front of the queue,
    /// until it returns `None`, to build up the bytes to send.
    Generator(Box<dyn FnMut() -> Option<Vec<u8>>>),
    /// The queue blocks on this item (and anything behind it) until the
    /// future resolves; `Failed`/`Cancelled` fire this item's `on_error`
    /// and move on to the next item without writing anything for it.
    Deferred(LoopFuture<Vec<u8>>),
}

struct WriteItem {
    data: WriteData,
    written: usize,
    /// Whether an `on_ready` continuation has already been armed for a
    /// `Deferred` item still waiting on its future.
    armed: bool,
    on_write: Option<Box<dyn FnOnce(&Loop)>>,
    on_flush: Option<Box<dyn FnOnce(&Loop)>>,
    on_error: Option<Box<dyn FnOnce(&Loop, Error)>>,
}

impl WriteItem {
    fn plain(data: WriteData) -> Self {
        Self { data, written: 0, armed: false, on_write: None, on_flush: None, on_error: None }
    }

    fn is_coalescable_bytes(&self) -> bool {
        matches!(self.data, WriteData::Bytes(_)) && self.on_write.is_none() && self.on_flush.is_none() && self.on_error.is_none()
    }
}

enum MaterializeOutcome {
    Ready,
    WaitingOnDeferred,
    Empty,
}

struct Inner {
    read_buf: VecDeque<u8>,
    read_requests: VecDeque<PendingRead>,
    read_paused: bool,
    high_watermark: usize,
    low_watermark: usize,

    write_queue: VecDeque<WriteItem>,
    closing: bool,

    on_eof: Option<Box<dyn FnOnce(&Loop)>>,
    on_drain: Option<Box<dyn FnMut(&Loop)>>,
    on_error: Option<Box<dyn FnMut(&Loop, Error)>>,
    on_read_high_watermark: Option<Box<dyn FnMut(&Loop)>>,
    on_read_low_watermark: Option<Box<dyn FnMut(&Loop)>>,
    on_write_eof: Option<Box<dyn FnOnce(&Loop)>>,
    on_write_error: Option<Box<dyn FnMut(&Loop, Error)>>,
}

pub struct Stream {
    loop_: Loop,
    handle: Rc<Handle>,
    inner: RefCell<Inner>,
}

impl Stream {
    pub fn new(loop_: Loop, fd: RawFd) -> Rc<Self> {
        let handle = Handle::new(loop_.clone(), fd);
        Rc::new_cyclic(|weak: &std::rc::Weak<Stream>| {
            let weak_read = weak.clone();
            let weak_write = weak.clone();
            handle.on_readable(move |l| {
                if let Some(s) = weak_read.upgrade() {
                    s.on_fd_readable(l);
                }
            });
            handle.on_writeable(move |l| {
                if let Some(s) = weak_write.upgrade() {
                    s.on_fd_writeable(l);
                }
            });
            Self {
                loop_,
                handle,
                inner: RefCell::new(Inner {
                    read_buf: VecDeque::new(),
                    read_requests: VecDeque::new(),
                    read_paused: false,
                    high_watermark: DEFAULT_READ_HIGH_WATERMARK,
                    low_watermark: DEFAULT_READ_LOW_WATERMARK,
                    write_queue: VecDeque::new(),
                    closing: false,
                    on_eof: None,
                    on_drain: None,
                    on_error: None,
                    on_read_high_watermark: None,
                    on_read_low_watermark: None,
                    on_write_eof: None,
                    on_write_error: None,
                }),
            }
        })
    }

    pub fn fd(&self) -> RawFd {
        self.handle.fd()
    }

    pub fn set_watermarks(&self, low: usize, high: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.low_watermark = low;
        inner.high_watermark = high;
    }

    pub fn on_error(&self, cb: impl FnMut(&Loop, Error) + 'static) {
        self.inner.borrow_mut().on_error = Some(Box::new(cb));
    }

    pub fn on_eof(&self, cb: impl FnOnce(&Loop) + 'static) {
        self.inner.borrow_mut().on_eof = Some(Box::new(cb));
    }

    pub fn on_drain(&self, cb: impl FnMut(&Loop) + 'static) {
        self.inner.borrow_mut().on_drain = Some(Box::new(cb));
    }

    /// Fires once the read buffer crosses above the high watermark (the
    /// same transition that internally pauses `want_readready`).
    pub fn on_read_high_watermark(&self, cb: impl FnMut(&Loop) + 'static) {
        self.inner.borrow_mut().on_read_high_watermark = Some(Box::new(cb));
    }

    /// Fires once the read buffer drains back to or below the low
    /// watermark after having been paused.
    pub fn on_read_low_watermark(&self, cb: impl FnMut(&Loop) + 'static) {
        self.inner.borrow_mut().on_read_low_watermark = Some(Box::new(cb));
    }

    /// Fires once, the first time a write hits EPIPE (peer gone).
    pub fn on_write_eof(&self, cb: impl FnOnce(&Loop) + 'static) {
        self.inner.borrow_mut().on_write_eof = Some(Box::new(cb));
    }

    pub fn on_write_error(&self, cb: impl FnMut(&Loop, Error) + 'static) {
        self.inner.borrow_mut().on_write_error = Some(Box::new(cb));
    }

    fn start_reading(self: &Rc<Self>) {
        self.handle.want_readready(true).ok();
        self.inner.borrow_mut().read_paused = false;
    }

    // ---- read requests --------------------------------------------------

    pub fn read_atmost(self: &Rc<Self>, n: usize, cb: impl FnOnce(&Loop, ReadOutcome) + 'static) {
        self.queue_read(ReadRequest::AtMost(n), Box::new(cb));
    }

    pub fn read_exactly(self: &Rc<Self>, n: usize, cb: impl FnOnce(&Loop, ReadOutcome) + 'static) {
        self.queue_read(ReadRequest::Exactly(n), Box::new(cb));
    }

    pub fn read_until_eof(self: &Rc<Self>, cb: impl FnOnce(&Loop, ReadOutcome) + 'static) {
        self.queue_read(ReadRequest::UntilEof, Box::new(cb));
    }

    pub fn read_until(self: &Rc<Self>, pattern: Regex, cb: impl FnOnce(&Loop, ReadOutcome) + 'static) {
        self.queue_read(ReadRequest::UntilPattern(pattern), Box::new(cb));
    }

    /// A single-shot variable-length decode: `decode` is called with the
    /// contiguous buffered bytes and either returns `None` (need more data,
    /// keep waiting) or `Some((value, consumed))`. Generalizes the
    /// length-prefix-then-payload chain `Channel` builds out of two
    /// `read_exactly` calls into one request for consumers with their own
    /// framing (e.g. a self-delimiting wire format).
    pub fn read_decoded<T: 'static>(
        self: &Rc<Self>,
        mut decode: impl FnMut(&[u8]) -> Option<(T, usize)> + 'static,
        cb: impl FnOnce(&Loop, Result<T>) + 'static,
    ) {
        let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let probe = move |buf: &[u8]| -> usize {
            match decode(buf) {
                Some((value, consumed)) => {
                    *slot2.borrow_mut() = Some(value);
                    consumed
                }
                None => 0,
            }
        };
        self.queue_read(
            ReadRequest::Decode(Box::new(probe)),
            Box::new(move |l, outcome| match outcome {
                ReadOutcome::Data(_) => {
                    let value = slot.borrow_mut().take().expect("Decode satisfied implies decode() produced a value");
                    cb(l, Ok(value));
                }
                ReadOutcome::Eof(_) => cb(l, Err(Error::StreamClosing)),
                ReadOutcome::Error(e) => cb(l, Err(e)),
            }),
        );
    }

    fn queue_read(self: &Rc<Self>, request: ReadRequest, cb: Box<dyn FnOnce(&Loop, ReadOutcome)>) {
        self.inner.borrow_mut().read_requests.push_back(PendingRead { request, cb });
        self.start_reading();
        self.try_satisfy_reads();
    }

    fn on_fd_readable(self: &Rc<Self>, _l: &Loop) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match nix::unistd::read(self.handle.fd(), &mut buf) {
                Ok(0) => {
                    self.handle_eof();
                    break;
                }
                Ok(n) => {
                    self.inner.borrow_mut().read_buf.extend(&buf[..n]);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) if is_retryable(e) => break,
                Err(e) => {
                    self.fail(Error::Io(std::io::Error::from(e)));
                    return;
                }
            }
        }
        self.try_satisfy_reads();
        self.maybe_apply_backpressure();
    }

    fn maybe_apply_backpressure(self: &Rc<Self>) {
        let (over_high, under_low, paused) = {
            let inner = self.inner.borrow();
            (
                inner.read_buf.len() >= inner.high_watermark,
                inner.read_buf.len() <= inner.low_watermark,
                inner.read_paused,
            )
        };
        if over_high && !paused {
            self.handle.want_readready(false).ok();
            self.inner.borrow_mut().read_paused = true;
            if let Some(cb) = self.inner.borrow_mut().on_read_high_watermark.as_mut() {
                cb(&self.loop_);
            }
        } else if under_low && paused {
            self.handle.want_readready(true).ok();
            self.inner.borrow_mut().read_paused = false;
            if let Some(cb) = self.inner.borrow_mut().on_read_low_watermark.as_mut() {
                cb(&self.loop_);
            }
        }
    }

    fn try_satisfy_reads(self: &Rc<Self>) {
        loop {
            let satisfied = {
                let mut inner = self.inner.borrow_mut();
                let Some(pending) = inner.read_requests.front_mut() else { return };
                match &mut pending.request {
                    ReadRequest::AtMost(n) => !inner.read_buf.is_empty() || *n == 0,
                    ReadRequest::Exactly(n) => inner.read_buf.len() >= *n,
                    ReadRequest::UntilEof => false, // only satisfied by handle_eof
                    ReadRequest::UntilPattern(re) => {
                        let contiguous: Vec<u8> = inner.read_buf.iter().copied().collect();
                        re.find(&contiguous).is_some()
                    }
                    ReadRequest::Decode(probe) => {
                        let contiguous: Vec<u8> = inner.read_buf.iter().copied().collect();
                        probe(&contiguous) > 0
                    }
                }
            };
            if !satisfied {
                return;
            }
            let PendingRead { request, cb } = {
                let mut inner = self.inner.borrow_mut();
                inner.read_requests.pop_front().unwrap()
            };
            let data = {
                let mut inner = self.inner.borrow_mut();
                match request {
                    ReadRequest::AtMost(n) => {
                        let take = n.min(inner.read_buf.len());
                        inner.read_buf.drain(..take).collect()
                    }
                    ReadRequest::Exactly(n) => inner.read_buf.drain(..n).collect(),
                    ReadRequest::UntilPattern(re) => {
                        let contiguous: Vec<u8> = inner.read_buf.iter().copied().collect();
                        let m = re.find(&contiguous).expect("checked satisfied above");
                        let end = m.end();
                        inner.read_buf.drain(..end).collect()
                    }
                    ReadRequest::Decode(mut probe) => {
                        let contiguous: Vec<u8> = inner.read_buf.iter().copied().collect();
                        let consumed = probe(&contiguous);
                        inner.read_buf.drain(..consumed).collect()
                    }
                    ReadRequest::UntilEof => unreachable!(),
                }
            };
            cb(&self.loop_, ReadOutcome::Data(data));
        }
    }

    fn handle_eof(self: &Rc<Self>) {
        let pending: Vec<PendingRead> = self.inner.borrow_mut().read_requests.drain(..).collect();
        let remaining: Vec<u8> = self.inner.borrow().read_buf.iter().copied().collect();
        for (i, p) in pending.into_iter().enumerate() {
            let chunk = if i == 0 { remaining.clone() } else { Vec::new() };
            (p.cb)(&self.loop_, ReadOutcome::Eof(chunk));
        }
        let on_eof = self.inner.borrow_mut().on_eof.take();
        if let Some(cb) = on_eof {
            cb(&self.loop_);
        }
    }

    fn fail(self: &Rc<Self>, err: Error) {
        let mut on_error = self.inner.borrow_mut().on_error.take();
        if let Some(cb) = on_error.as_mut() {
            cb(&self.loop_, err);
        }
        if let Some(cb) = on_error {
            self.inner.borrow_mut().on_error = Some(cb);
        }
    }

    // ---- writes -----------------------------------------------------------

    pub fn write(self: &Rc<Self>, data: impl Into<Vec<u8>>) -> Result<()> {
        self.write_item(WriteData::Bytes(data.into()), None, None, None)
    }

    pub fn write_generator(self: &Rc<Self>, gen: impl FnMut() -> Option<Vec<u8>> + 'static) -> Result<()> {
        self.write_item(WriteData::Generator(Box::new(gen)), None, None, None)
    }

    pub fn write_deferred(self: &Rc<Self>, value: LoopFuture<Vec<u8>>) -> Result<()> {
        self.write_item(WriteData::Deferred(value), None, None, None)
    }

    /// Queues `data` with optional per-item completion hooks: `on_write`
    /// once its bytes are fully handed to the kernel, `on_flush` right
    /// after (both fire back-to-back on success), `on_error` if the item
    /// fails or its `Deferred` source resolves to `Failed`/`Cancelled`.
    pub fn write_item(
        self: &Rc<Self>,
        data: WriteData,
        on_write: Option<Box<dyn FnOnce(&Loop)>>,
        on_flush: Option<Box<dyn FnOnce(&Loop)>>,
        on_error: Option<Box<dyn FnOnce(&Loop, Error)>>,
    ) -> Result<()> {
        let item = WriteItem { data, written: 0, armed: false, on_write, on_flush, on_error };
        self.enqueue(item)
    }

    fn enqueue(self: &Rc<Self>, item: WriteItem) -> Result<()> {
        if self.inner.borrow().closing {
            return Err(Error::StreamClosing);
        }
        let mut inner = self.inner.borrow_mut();
        let was_empty = inner.write_queue.is_empty();
        let coalesced = match (inner.write_queue.back_mut(), &item.data) {
            (Some(back), WriteData::Bytes(new_bytes)) if back.is_coalescable_bytes() && item.is_coalescable_bytes() => {
                if let WriteData::Bytes(existing) = &mut back.data {
                    existing.extend_from_slice(new_bytes);
                }
                true
            }
            _ => false,
        };
        if !coalesced {
            inner.write_queue.push_back(item);
        }
        drop(inner);
        if was_empty {
            self.handle.want_writeready(true)?;
        }
        Ok(())
    }

    /// Ensures the front of the write queue is `WriteData::Bytes`, pulling
    /// a `Generator` to exhaustion or converting a resolved `Deferred` in
    /// place. Pops and fails any `Deferred` item whose future resolved to
    /// `Failed`/`Cancelled` and moves on to the next item.
    fn materialize_front(self: &Rc<Self>, l: &Loop) -> MaterializeOutcome {
        enum Step {
            Ready,
            ResolvedDone(Vec<u8>),
            ResolvedFailed,
            NeedArm,
            Waiting,
        }
        loop {
            let step = {
                let mut inner = self.inner.borrow_mut();
                let Some(item) = inner.write_queue.front_mut() else { return MaterializeOutcome::Empty };
                match &mut item.data {
                    WriteData::Bytes(_) => Step::Ready,
                    WriteData::Generator(gen) => {
                        let mut collected = Vec::new();
                        while let Some(chunk) = gen() {
                            collected.extend(chunk);
                        }
                        item.data = WriteData::Bytes(collected);
                        Step::Ready
                    }
                    WriteData::Deferred(fut) => match fut.peek() {
                        Some(FutureResult::Done(bytes)) => Step::ResolvedDone(bytes),
                        Some(FutureResult::Failed(_)) | Some(FutureResult::Cancelled) => Step::ResolvedFailed,
                        None if item.armed => Step::Waiting,
                        None => {
                            item.armed = true;
                            Step::NeedArm
                        }
                    },
                }
            };
            match step {
                Step::Ready => return MaterializeOutcome::Ready,
                Step::ResolvedDone(bytes) => {
                    let mut inner = self.inner.borrow_mut();
                    let item = inner.write_queue.front_mut().expect("front item present");
                    item.data = WriteData::Bytes(bytes);
                    continue;
                }
                Step::ResolvedFailed => {
                    let mut failed = self.inner.borrow_mut().write_queue.pop_front().expect("front item present");
                    if let Some(cb) = failed.on_error.take() {
                        cb(l, Error::StreamClosing);
                    }
                    continue;
                }
                Step::NeedArm => {
                    let fut = {
                        let inner = self.inner.borrow();
                        let item = inner.write_queue.front().expect("front item present");
                        match &item.data {
                            WriteData::Deferred(fut) => fut.clone(),
                            _ => unreachable!("NeedArm only produced for a Deferred item"),
                        }
                    };
                    let weak = Rc::downgrade(self);
                    fut.on_ready(move |l, _| {
                        if let Some(s) = weak.upgrade() {
                            s.on_fd_writeable(l);
                        }
                    });
                    return MaterializeOutcome::WaitingOnDeferred;
                }
                Step::Waiting => return MaterializeOutcome::WaitingOnDeferred,
            }
        }
    }

    fn on_fd_writeable(self: &Rc<Self>, l: &Loop) {
        loop {
            match self.materialize_front(l) {
                MaterializeOutcome::Empty => return self.write_queue_drained(l),
                MaterializeOutcome::WaitingOnDeferred => return,
                MaterializeOutcome::Ready => {}
            }
            let outcome = {
                let inner = self.inner.borrow();
                let item = inner.write_queue.front().expect("materialized above");
                let bytes = match &item.data {
                    WriteData::Bytes(b) => b,
                    _ => unreachable!("materialize_front guarantees Bytes before writing"),
                };
                nix::unistd::write(self.handle.fd(), &bytes[item.written..])
            };
            match outcome {
                Ok(n) => self.advance_front_write(l, n),
                Err(nix::errno::Errno::EPIPE) => {
                    self.handle_write_eof(l);
                    return;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) if is_retryable(e) => return,
                Err(e) => {
                    self.fail_front_write(l, Error::Io(std::io::Error::from(e)));
                    return;
                }
            }
        }
    }

    fn advance_front_write(self: &Rc<Self>, l: &Loop, n: usize) {
        let finished = {
            let mut inner = self.inner.borrow_mut();
            let item = inner.write_queue.front_mut().expect("front item present for a successful write");
            item.written += n;
            match &item.data {
                WriteData::Bytes(bytes) => item.written >= bytes.len(),
                _ => unreachable!("materialize_front guarantees Bytes before writing"),
            }
        };
        if finished {
            let mut item = self.inner.borrow_mut().write_queue.pop_front().expect("front item present");
            if let Some(cb) = item.on_write.take() {
                cb(l);
            }
            if let Some(cb) = item.on_flush.take() {
                cb(l);
            }
        }
    }

    fn fail_front_write(self: &Rc<Self>, l: &Loop, err: Error) {
        let item = self.inner.borrow_mut().write_queue.pop_front();
        match item {
            Some(mut item) => match item.on_error.take() {
                Some(cb) => cb(l, err),
                None => self.fail(err),
            },
            None => self.fail(err),
        }
    }

    fn handle_write_eof(self: &Rc<Self>, l: &Loop) {
        let (write_eof_cb, mut write_error_cb) = {
            let mut inner = self.inner.borrow_mut();
            inner.write_queue.clear();
            (inner.on_write_eof.take(), inner.on_write_error.take())
        };
        let mut handled = false;
        if let Some(cb) = write_eof_cb {
            cb(l);
            handled = true;
        }
        if let Some(cb) = write_error_cb.as_mut() {
            cb(l, Error::StreamClosing);
            handled = true;
        }
        if let Some(cb) = write_error_cb {
            self.inner.borrow_mut().on_write_error = Some(cb);
        }
        if !handled {
            self.handle.close();
        }
    }

    fn write_queue_drained(self: &Rc<Self>, l: &Loop) {
        self.handle.want_writeready(false).ok();
        if let Some(cb) = self.inner.borrow_mut().on_drain.as_mut() {
            cb(l);
        }
        if self.inner.borrow().closing {
            self.handle.close();
        }
    }

    /// Closes the underlying fd immediately, failing any pending reads and
    /// firing `on_error` for every queued write instead of silently
    /// dropping them.
    pub fn close_now(self: &Rc<Self>) {
        let pending: Vec<PendingRead> = self.inner.borrow_mut().read_requests.drain(..).collect();
        for p in pending {
            (p.cb)(&self.loop_, ReadOutcome::Error(Error::StreamClosing));
        }
        let queued: Vec<WriteItem> = self.inner.borrow_mut().write_queue.drain(..).collect();
        for mut item in queued {
            if let Some(cb) = item.on_error.take() {
                cb(&self.loop_, Error::StreamClosing);
            }
        }
        self.handle.close();
    }

    /// Marks the stream closing: no new writes accepted, existing queued
    /// writes still flush, fd closes once the write queue drains.
    pub fn close_when_empty(self: &Rc<Self>) {
        let empty = {
            let mut inner = self.inner.borrow_mut();
            inner.closing = true;
            inner.write_queue.is_empty()
        };
        if empty {
            self.handle.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn socketpair_nonblocking() -> (RawFd, RawFd) {
        nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::SOCK_NONBLOCK,
        )
        .unwrap()
    }

    #[test]
    fn read_exactly_waits_for_full_count() {
        let l = Loop::new().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        let stream = Stream::new(l.clone(), r);
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        stream.read_exactly(5, move |_, outcome| {
            if let ReadOutcome::Data(d) = outcome {
                *got2.borrow_mut() = Some(d);
            }
        });
        nix::unistd::write(w, b"ab").unwrap();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);
        assert!(got.borrow().is_none());
        nix::unistd::write(w, b"cde").unwrap();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);
        assert_eq!(got.borrow().as_ref().unwrap(), b"abcde");
        let _ = nix::unistd::close(w);
    }

    #[test]
    fn write_then_close_when_empty_flushes_before_closing() {
        let l = Loop::new().unwrap();
        let (r, w) = socketpair_nonblocking();
        let stream = Stream::new(l.clone(), w);
        stream.write(b"hello".to_vec()).unwrap();
        stream.close_when_empty();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);

        let mut buf = [0u8; 16];
        let n = nix::unistd::read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let _ = nix::unistd::close(r);
    }

    #[test]
    fn write_item_on_write_and_on_flush_fire_on_completion() {
        let l = Loop::new().unwrap();
        let (r, w) = socketpair_nonblocking();
        let stream = Stream::new(l.clone(), w);
        let written = Rc::new(Cell::new(false));
        let flushed = Rc::new(Cell::new(false));
        let written2 = written.clone();
        let flushed2 = flushed.clone();
        stream
            .write_item(
                WriteData::Bytes(b"hi".to_vec()),
                Some(Box::new(move |_| written2.set(true))),
                Some(Box::new(move |_| flushed2.set(true))),
                None,
            )
            .unwrap();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);
        assert!(written.get());
        assert!(flushed.get());

        let mut buf = [0u8; 8];
        let n = nix::unistd::read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        let _ = nix::unistd::close(r);
    }

    #[test]
    fn write_generator_is_drained_lazily_once_at_the_front_of_the_queue() {
        let l = Loop::new().unwrap();
        let (r, w) = socketpair_nonblocking();
        let stream = Stream::new(l.clone(), w);
        let mut chunks = vec![b"world".to_vec(), b"hello ".to_vec()];
        stream.write_generator(move || chunks.pop()).unwrap();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);

        let mut buf = [0u8; 16];
        let n = nix::unistd::read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        let _ = nix::unistd::close(r);
    }

    #[test]
    fn write_after_peer_closed_fires_write_eof_instead_of_hanging() {
        let l = Loop::new().unwrap();
        let (r, w) = socketpair_nonblocking();
        nix::unistd::close(r).unwrap();
        let stream = Stream::new(l.clone(), w);
        let got_eof = Rc::new(Cell::new(false));
        let got_eof2 = got_eof.clone();
        stream.on_write_eof(move |_| got_eof2.set(true));
        stream.write(b"x".to_vec()).unwrap();
        l.once(Some(std::time::Duration::from_millis(30)), None::<fn(&Loop)>);
        assert!(got_eof.get());
    }

    #[test]
    fn close_now_fires_on_error_for_queued_writes_instead_of_dropping_them_silently() {
        let l = Loop::new().unwrap();
        let (_r, w) = socketpair_nonblocking();
        let stream = Stream::new(l.clone(), w);
        let errored = Rc::new(Cell::new(false));
        let errored2 = errored.clone();
        // Fill the socket buffer so the first item never fully drains, then
        // queue a second item behind it to prove close_now reaches it too.
        stream.write(vec![0u8; 1 << 20]).unwrap();
        stream
            .write_item(WriteData::Bytes(b"never sent".to_vec()), None, None, Some(Box::new(move |_, _| errored2.set(true))))
            .unwrap();
        stream.close_now();
        assert!(errored.get());
    }
}
