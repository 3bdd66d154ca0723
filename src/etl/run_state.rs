//! Idle/Running state with an atomic `Idle -> Running` transition.
//!
//! Used twice: by the scheduler per event type and by the pin driver per scope. A failed
//! transition means "something is already running": the caller skips, it never waits.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt `Idle -> Running`. The returned ticket moves the state back to `Idle` on drop.
    pub fn try_begin(self: &Arc<Self>) -> Option<RunTicket> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunTicket {
                state: Arc::clone(self),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Proof that the holder owns the `Running` state.
#[derive(Debug)]
pub struct RunTicket {
    state: Arc<RunState>,
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

/// Lazily created run states, one per key.
#[derive(Debug)]
pub struct RunStates<K> {
    states: Mutex<HashMap<K, Arc<RunState>>>,
}

impl<K> Default for RunStates<K> {
    fn default() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> RunStates<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Arc<RunState> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(states.entry(key.clone()).or_default())
    }

    pub fn try_begin(&self, key: &K) -> Option<RunTicket> {
        self.get(key).try_begin()
    }
}
