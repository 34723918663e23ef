//! `NotifierBase` (spec §4.2): shared plumbing every concrete notifier
//! embeds -- a `(type, name)` identity, weak-self capture so a notifier's
//! own callbacks can reach back into itself without creating an `Rc` cycle
//! with the `Loop`, and the `invoke_event`/`invoke_error` dispatch pair.
//!
//! Rust has no implicit `self` inside a closure, so "weak-self capture" here
//! means: a notifier is always constructed via `Rc::new_cyclic`, which hands
//! the constructor a `Weak<RefCell<Self>>` pointing at the not-yet-built
//! value. Event callbacks close over that `Weak` and `.upgrade()` it on
//! every invocation (spec's `replace_weakself`), so a notifier whose last
//! strong reference was dropped simply stops firing instead of leaking.

use crate::error::{Error, NotifierError, Result};
use crate::reactor::Loop;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

/// Process-wide `(type_name, name)` uniqueness registry (spec §4.2
/// `NotifierIdNotUnique`). One instance is owned by the `Loop` in a full
/// embedding; kept standalone here so notifiers can be unit-tested without
/// constructing a reactor.
#[derive(Default)]
pub struct IdRegistry {
    live: RefCell<HashSet<(&'static str, String)>>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, type_name: &'static str, name: &str) -> Result<()> {
        let mut live = self.live.borrow_mut();
        let key = (type_name, name.to_string());
        if live.contains(&key) {
            return Err(Error::NotifierIdNotUnique { type_name, name: name.to_string() });
        }
        live.insert(key);
        Ok(())
    }

    pub fn release(&self, type_name: &'static str, name: &str) {
        self.live.borrow_mut().remove(&(type_name, name.to_string()));
    }
}

/// Base state embedded (by composition, not inheritance -- Rust has none)
/// in every concrete notifier: its loop handle, identity, and error slot.
pub struct NotifierBase {
    pub type_name: &'static str,
    pub name: String,
    loop_: Loop,
    on_error: RefCell<Option<Box<dyn FnMut(&Loop, NotifierError)>>>,
}

impl NotifierBase {
    pub fn new(loop_: Loop, type_name: &'static str, name: impl Into<String>) -> Self {
        Self {
            type_name,
            name: name.into(),
            loop_,
            on_error: RefCell::new(None),
        }
    }

    pub fn loop_handle(&self) -> &Loop {
        &self.loop_
    }

    pub fn set_on_error(&self, cb: impl FnMut(&Loop, NotifierError) + 'static) {
        *self.on_error.borrow_mut() = Some(Box::new(cb));
    }

    /// Dispatches to the registered `on_error` handler, or logs and drops
    /// the error if none was installed (spec §4.2 `invoke_error`).
    pub fn invoke_error(&self, message: impl Into<String>, kind: Option<&str>) {
        let err = NotifierError { message: message.into(), kind: kind.map(str::to_string) };
        let mut slot = self.on_error.borrow_mut();
        match slot.as_mut() {
            Some(cb) => cb(&self.loop_, err),
            None => log::error!(target: "notifier", "{}/{}: {err}", self.type_name, self.name),
        }
    }
}

/// Wraps a value behind weak-self so its own callbacks can re-enter it.
/// Concrete notifiers hold `WeakSelf<Inner>` fields the way the spec's
/// notifiers hold `$self->{weakself}`.
pub struct WeakSelf<T>(Weak<RefCell<T>>);

impl<T> Clone for WeakSelf<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> WeakSelf<T> {
    pub fn capture(strong: &Rc<RefCell<T>>) -> Self {
        Self(Rc::downgrade(strong))
    }

    /// Runs `f` against the live value, or calls `on_gone` if the strong
    /// owner has already been dropped (spec's `maybe_invoke_event`: a
    /// no-op when the notifier no longer exists).
    pub fn maybe_invoke(&self, f: impl FnOnce(&Rc<RefCell<T>>)) {
        if let Some(strong) = self.0.upgrade() {
            f(&strong);
        }
    }
}

/// Builds a value and its own `WeakSelf` handle in one step, mirroring
/// `Rc::new_cyclic` but returning the strong `Rc` the constructor needs to
/// hand back to callers.
pub fn new_with_weak_self<T>(build: impl FnOnce(WeakSelf<T>) -> T) -> Rc<RefCell<T>> {
    Rc::new_cyclic(|weak: &Weak<RefCell<T>>| RefCell::new(build(WeakSelf(weak.clone()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_registry_rejects_duplicates() {
        let reg = IdRegistry::new();
        reg.claim("Timer", "a").unwrap();
        assert!(reg.claim("Timer", "a").is_err());
        reg.release("Timer", "a");
        reg.claim("Timer", "a").unwrap();
    }

    #[test]
    fn weak_self_noop_after_drop() {
        struct Counter(u32);
        let strong = new_with_weak_self(|_weak| Counter(0));
        let weak = WeakSelf::capture(&strong);
        weak.maybe_invoke(|s| s.borrow_mut().0 += 1);
        assert_eq!(strong.borrow().0, 1);
        drop(strong);
        weak.maybe_invoke(|s| s.borrow_mut().0 += 1); // no panic, no-op
    }
}
