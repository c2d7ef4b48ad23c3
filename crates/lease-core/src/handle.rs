use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::manager::Shared;

/// Acquisition state of a lease handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Unacquired,
    Acquired,
}

impl LeaseState {
    pub fn from_acquired(acquired: bool) -> Self {
        if acquired {
            Self::Acquired
        } else {
            Self::Unacquired
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseState::Unacquired => write!(f, "unacquired"),
            LeaseState::Acquired => write!(f, "acquired"),
        }
    }
}

/// Ownership transition delivered to a handle's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEvent {
    pub name: String,
    /// State the handle moved into
    pub state: LeaseState,
}

/// Transition callback registered with [`crate::LeaseManager::create`].
///
/// Runs on the manager's work queue, once per edge. A slow callback delays
/// the next maintenance cycle.
pub type TransitionCallback = Box<dyn FnMut(&LeaseEvent) + Send + 'static>;

/// One participant's claim on one named lease.
///
/// The handle only observes state; every mutation happens on the manager's
/// work queue. The state reflects the last completed maintenance cycle,
/// except that a released handle reads as unacquired at once.
///
/// Dropping the handle releases the lease.
pub struct LeaseHandle {
    name: String,
    id: u64,
    state: watch::Receiver<bool>,
    released: AtomicBool,
    shared: Arc<Shared>,
}

impl LeaseHandle {
    pub(crate) fn new(
        name: String,
        id: u64,
        state: watch::Receiver<bool>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            name,
            id,
            state,
            released: AtomicBool::new(false),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_acquired(&self) -> bool {
        !self.released.load(Ordering::Acquire) && *self.state.borrow()
    }

    pub fn state(&self) -> LeaseState {
        LeaseState::from_acquired(self.is_acquired())
    }

    /// Watch the acquired flag, e.g. to await the next transition.
    ///
    /// Receivers see a release once the work queue has processed it.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }

    /// Give the lease up so another participant can own it.
    ///
    /// Returns immediately and [`is_acquired`](Self::is_acquired) turns
    /// false right away; the callback and the store delete run on the work
    /// queue. Calling it again is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.release(&self.name, self.id);
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&LeaseState::Unacquired).unwrap(),
            "\"unacquired\""
        );
        assert_eq!(LeaseState::from_acquired(true), LeaseState::Acquired);
        assert_eq!(LeaseState::Acquired.to_string(), "acquired");
    }
}
