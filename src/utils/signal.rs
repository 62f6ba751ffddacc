//! Observable values shared between the orchestrator and its engines
//!
//! A [`Signal`] holds the current value of one input (a flag, a transcript,
//! an error message) and lets any number of observers subscribe to changes.
//! It is a thin wrapper over a `tokio::sync::watch` channel so reads never
//! block and writes never fail, even with no subscribers.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// A shared, observable value
pub struct Signal<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Signal<T> {
    /// Create a signal holding `initial`
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Get a copy of the current value
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify every subscriber, even if it is unchanged
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate the value in place and notify subscribers
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Subscribe to future changes
    ///
    /// The returned receiver treats the current value as already seen.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq> Signal<T> {
    /// Replace the value, notifying subscribers only when it actually changed
    ///
    /// Returns `true` if the value changed.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl Signal<bool> {
    /// Atomically flip `false` to `true`
    ///
    /// Returns `true` if this call performed the flip. Used for single-flight
    /// claims where a check followed by a separate set would race.
    pub fn try_raise(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current {
                false
            } else {
                *current = true;
                true
            }
        })
    }

    /// Raise the flag and lower it again when the returned guard drops
    pub fn raise_scoped(&self) -> FlagGuard {
        self.set_if_changed(true);
        FlagGuard {
            signal: self.clone(),
        }
    }
}

impl<T: Clone + Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&*self.tx.borrow()).finish()
    }
}

/// Lowers a boolean signal when dropped
///
/// Covers every exit path of a scope, including early returns and errors.
#[must_use = "the flag is lowered as soon as the guard is dropped"]
pub struct FlagGuard {
    signal: Signal<bool>,
}

impl FlagGuard {
    /// Take over an already-raised flag
    pub fn adopt(signal: &Signal<bool>) -> Self {
        Self {
            signal: signal.clone(),
        }
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.signal.set_if_changed(false);
    }
}
