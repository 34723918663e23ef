//! `Handle` (spec §4.5): the fd-level notifier `Stream` builds on. Owns the
//! raw descriptor, tracks the four independent readiness flags (spec: "an
//! fd can be watched for read and write independently of whether the
//! caller currently wants either"), and forwards to whichever of
//! `watch_read_handle`/`watch_write_handle` are currently armed.

use crate::error::Result;
use crate::reactor::Loop;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub struct Handle {
    loop_: Loop,
    fd: Cell<RawFd>,
    want_read: Cell<bool>,
    want_write: Cell<bool>,
    on_readable: RefCell<Option<Box<dyn FnMut(&Loop)>>>,
    on_writeable: RefCell<Option<Box<dyn FnMut(&Loop)>>>,
    closed: Cell<bool>,
}

impl Handle {
    pub fn new(loop_: Loop, fd: RawFd) -> Rc<Self> {
        Rc::new(Self {
            loop_,
            fd: Cell::new(fd),
            want_read: Cell::new(false),
            want_write: Cell::new(false),
            on_readable: RefCell::new(None),
            on_writeable: RefCell::new(None),
            closed: Cell::new(false),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn on_readable(&self, cb: impl FnMut(&Loop) + 'static) {
        *self.on_readable.borrow_mut() = Some(Box::new(cb));
    }

    pub fn on_writeable(&self, cb: impl FnMut(&Loop) + 'static) {
        *self.on_writeable.borrow_mut() = Some(Box::new(cb));
    }

    /// `set_handle`: swaps in a new underlying fd (spec §4.5), e.g. after a
    /// reconnect. Re-arms whichever watches were previously active.
    pub fn set_handle(self: &Rc<Self>, fd: RawFd) {
        self.unwatch_all();
        self.fd.set(fd);
        if self.want_read.get() {
            self.want_readready(true).ok();
        }
        if self.want_write.get() {
            self.want_writeready(true).ok();
        }
    }

    pub fn want_readready(self: &Rc<Self>, want: bool) -> Result<()> {
        self.want_read.set(want);
        if want {
            let this = self.clone();
            self.loop_.watch_read_handle(self.fd.get(), move |l| {
                let mut cb = this.on_readable.borrow_mut();
                if let Some(cb) = cb.as_mut() {
                    cb(l);
                }
            })
        } else {
            self.loop_.unwatch_read_handle(self.fd.get());
            Ok(())
        }
    }

    pub fn want_writeready(self: &Rc<Self>, want: bool) -> Result<()> {
        self.want_write.set(want);
        if want {
            let this = self.clone();
            self.loop_.watch_write_handle(self.fd.get(), move |l| {
                let mut cb = this.on_writeable.borrow_mut();
                if let Some(cb) = cb.as_mut() {
                    cb(l);
                }
            })
        } else {
            self.loop_.unwatch_write_handle(self.fd.get());
            Ok(())
        }
    }

    fn unwatch_all(&self) {
        self.loop_.unwatch_read_handle(self.fd.get());
        self.loop_.unwatch_write_handle(self.fd.get());
    }

    /// Tears down watches and closes the fd. Idempotent.
    pub fn close(&self) {
        if self.closed.get() {
            return;
        }
        self.closed.set(true);
        self.unwatch_all();
        let _ = nix::unistd::close(self.fd.get());
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn readable_callback_fires_on_pipe_write() {
        let l = Loop::new().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        let handle = Handle::new(l.clone(), r);
        let fired = Rc::new(StdCell::new(false));
        let fired2 = fired.clone();
        handle.on_readable(move |_| fired2.set(true));
        handle.want_readready(true).unwrap();

        nix::unistd::write(w, b"x").unwrap();
        l.once(Some(std::time::Duration::from_millis(50)), None::<fn(&Loop)>);
        assert!(fired.get());
        let _ = nix::unistd::close(w);
    }

    #[test]
    fn close_is_idempotent() {
        let l = Loop::new().unwrap();
        let (r, _w) = nix::unistd::pipe().unwrap();
        let handle = Handle::new(l, r);
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }
}
