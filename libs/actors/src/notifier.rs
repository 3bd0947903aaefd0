//! Completion notifiers
//!
//! A [`ResultNotifier`] is a one-shot continuation handed to an operation
//! that may not be able to complete immediately. The registering side arms
//! it with a [`CleanupHandler`] that can unhook the notifier from whatever
//! queue it was parked on; the completing side fires it. The two sides
//! race freely: whichever ordering happens at runtime, the callback runs
//! at most once and the cleanup handler always runs exactly once after
//! arming.
//!
//! The registrar must call [`ResultNotifier::init`] while holding the lock
//! of the structure the notifier was parked on. That makes the park+arm
//! step atomic with respect to a concurrent `notify`, which is the whole
//! trick that makes "check for data, then park" race-free.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Why a parked notifier fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    /// Data became available; consume again to pick it up.
    MessagesWaiting,
    /// The notifier sat parked past its eviction deadline.
    Timeout,
    /// The structure the notifier was parked on was torn down.
    IoError,
}

/// Unhooks a parked notifier from its registration point.
pub trait CleanupHandler: Send + Sync {
    fn detach(&self);
}

/// Cleanup for notifiers that were never parked anywhere.
pub struct NoopCleanup;

impl CleanupHandler for NoopCleanup {
    fn detach(&self) {}
}

enum State {
    /// Built but not yet armed with a cleanup handler.
    Created,
    /// Armed; fires at most once.
    Armed(Arc<dyn CleanupHandler>),
    /// Fired or detached; inert forever after.
    Completed,
}

struct NotifierInner {
    state: Mutex<State>,
    callback: Box<dyn Fn(NotifyStatus) + Send + Sync>,
}

/// One-shot completion callback with race-free arming.
#[derive(Clone)]
pub struct ResultNotifier {
    inner: Arc<NotifierInner>,
}

impl ResultNotifier {
    pub fn new(callback: impl Fn(NotifyStatus) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                state: Mutex::new(State::Created),
                callback: Box::new(callback),
            }),
        }
    }

    /// Arms the notifier with the handler that can unhook it.
    ///
    /// Must be called under the lock of the structure the notifier was
    /// parked on. If a `notify` already won the race the handler is
    /// detached immediately and the notifier stays completed.
    pub fn init(&self, cleanup: Arc<dyn CleanupHandler>) {
        let mut state = self.inner.state.lock();
        match &*state {
            State::Created => *state = State::Armed(cleanup),
            State::Armed(_) => {
                drop(state);
                panic!("ResultNotifier::init called twice");
            }
            State::Completed => {
                drop(state);
                cleanup.detach();
            }
        }
    }

    /// Fires the callback, at most once. The cleanup handler runs first
    /// so the callback observes the notifier already unhooked.
    pub fn notify(&self, status: NotifyStatus) {
        let cleanup = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, State::Completed) {
                State::Created => None,
                State::Armed(cleanup) => Some(cleanup),
                State::Completed => return,
            }
        };
        // Callbacks run outside the state lock; they may re-enter the
        // runtime (consume, re-register) freely.
        if let Some(cleanup) = cleanup {
            cleanup.detach();
        }
        (self.inner.callback)(status);
    }

    /// Retires the notifier without firing the callback. Idempotent.
    pub fn detach(&self) {
        let cleanup = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, State::Completed) {
                State::Armed(cleanup) => Some(cleanup),
                State::Created | State::Completed => None,
            }
        };
        if let Some(cleanup) = cleanup {
            cleanup.detach();
        }
    }
}

impl fmt::Debug for ResultNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let label = match &*state {
            State::Created => "created",
            State::Armed(_) => "armed",
            State::Completed => "completed",
        };
        f.debug_struct("ResultNotifier").field("state", &label).finish()
    }
}
