//! Exclusive interpreter access
//!
//! Host code may only run while the calling thread holds the interpreter.
//! Native callbacks arrive on arbitrary threads, so every crossing from
//! native into host code brackets itself with [`ThreadState::ensure`], and
//! every potentially blocking native call made from host context gives the
//! interpreter up through [`allow_threads`].
//!
//! A single [`Interpreter`] implementation guards both directions. There is
//! no second lock layered on top, so the only ordering to respect is the
//! interpreter itself.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::HostError;

/// Proof that [`Interpreter::ensure`] was called; hand it back to `release`
#[derive(Debug)]
pub struct ThreadStateToken(usize);

impl ThreadStateToken {
    pub fn new(raw: usize) -> Self {
        ThreadStateToken(raw)
    }

    pub fn raw(&self) -> usize {
        self.0
    }
}

/// State captured by [`Interpreter::save`]; `None` when the calling thread
/// did not hold the interpreter
#[derive(Debug)]
pub struct SavedThreadState(Option<usize>);

impl SavedThreadState {
    pub fn new(raw: Option<usize>) -> Self {
        SavedThreadState(raw)
    }

    pub fn raw(&self) -> Option<usize> {
        self.0
    }
}

/// Access protocol for the host interpreter
pub trait Interpreter: Send + Sync {
    /// Acquire the interpreter for the calling thread. Re-entrant.
    fn ensure(&self) -> ThreadStateToken;

    /// Undo the matching `ensure`
    fn release(&self, token: ThreadStateToken);

    /// Give the interpreter up while the calling thread blocks in native code
    fn save(&self) -> SavedThreadState;

    /// Take the interpreter back after `save`
    fn restore(&self, saved: SavedThreadState);

    /// Print an exception raised by a host callback that has no caller to
    /// propagate to
    fn report(&self, error: &HostError) {
        log::error!("Unhandled exception in host callback: {error}");
    }
}

/// Scoped interpreter acquisition; released on drop
pub struct ThreadState<'a> {
    interpreter: &'a dyn Interpreter,
    token: Option<ThreadStateToken>,
}

impl<'a> ThreadState<'a> {
    pub fn ensure(interpreter: &'a dyn Interpreter) -> Self {
        let token = interpreter.ensure();
        ThreadState {
            interpreter,
            token: Some(token),
        }
    }
}

impl Drop for ThreadState<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.interpreter.release(token);
        }
    }
}

struct RestoreOnDrop<'a> {
    interpreter: &'a dyn Interpreter,
    saved: Option<SavedThreadState>,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.interpreter.restore(saved);
        }
    }
}

/// Run `f` with the interpreter released, re-acquiring it afterwards even
/// if `f` panics
pub fn allow_threads<R>(interpreter: &dyn Interpreter, f: impl FnOnce() -> R) -> R {
    let _restore = RestoreOnDrop {
        interpreter,
        saved: Some(interpreter.save()),
    };
    f()
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// In-process interpreter lock
///
/// Re-entrant per thread; other threads block until the holder releases or
/// saves. Suitable for embedding without a real interpreter.
#[derive(Debug, Default)]
pub struct LocalInterpreter {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl LocalInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock().thread == Some(thread::current().id())
    }

    fn lock(&self) -> MutexGuard<'_, Owner> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until_free<'g>(&self, mut owner: MutexGuard<'g, Owner>) -> MutexGuard<'g, Owner> {
        while owner.thread.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        owner
    }
}

impl Interpreter for LocalInterpreter {
    fn ensure(&self) -> ThreadStateToken {
        let me = thread::current().id();
        let mut owner = self.lock();
        if owner.thread != Some(me) {
            owner = self.wait_until_free(owner);
            owner.thread = Some(me);
        }
        owner.depth += 1;
        ThreadStateToken(owner.depth)
    }

    fn release(&self, token: ThreadStateToken) {
        let mut owner = self.lock();
        if owner.thread != Some(thread::current().id()) {
            log::warn!("Interpreter released by a thread that does not hold it");
            return;
        }
        if owner.depth != token.0 {
            log::warn!(
                "Interpreter released out of order (depth {}, token {})",
                owner.depth,
                token.0
            );
        }
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            self.released.notify_all();
        }
    }

    fn save(&self) -> SavedThreadState {
        let mut owner = self.lock();
        if owner.thread != Some(thread::current().id()) {
            return SavedThreadState(None);
        }
        let depth = owner.depth;
        owner.thread = None;
        owner.depth = 0;
        self.released.notify_all();
        SavedThreadState(Some(depth))
    }

    fn restore(&self, saved: SavedThreadState) {
        let Some(depth) = saved.0 else {
            return;
        };
        let owner = self.lock();
        let mut owner = self.wait_until_free(owner);
        owner.thread = Some(thread::current().id());
        owner.depth = depth;
    }
}
