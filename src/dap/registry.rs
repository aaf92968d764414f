//! Handle registries.
//!
//! Debugger state that is valid only until execution stops again (frames, variable scopes,
//! stop events) is exposed to the client through small integer handles. A registry hands out
//! handles for one debug generation, [`Registry::purge`] starts the next one.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry with positional handles.
///
/// Handles are 1-based and allocated by a monotonic counter, handle `n` lives in slot `n - 1`.
/// Purge drops every entry and resets the counter, so the next handle is 1 again.
#[derive(Debug)]
pub struct Registry<T> {
    entries: Mutex<Vec<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value and return its handle.
    pub fn add(&self, value: T) -> i64 {
        let mut entries = lock(&self.entries);
        entries.push(value);
        entries.len() as i64
    }

    /// Return the value behind a handle, [`None`] if handle was never issued in this generation.
    pub fn get(&self, id: i64) -> Option<T> {
        if id < 1 {
            return None;
        }
        let entries = lock(&self.entries);
        entries.get((id - 1) as usize).cloned()
    }

    /// Drop all entries and reset the handle counter.
    pub fn purge(&self) {
        lock(&self.entries).clear();
    }

    /// Count of live handles.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A value that belongs to exactly one debuggee thread.
pub trait ThreadKeyed {
    fn thread_id(&self) -> i64;
}

/// Registry of live debug-stop events, at most one per thread.
#[derive(Debug)]
pub struct EventRegistry<T> {
    events: Mutex<BTreeMap<i64, T>>,
}

impl<T> Default for EventRegistry<T> {
    fn default() -> Self {
        Self {
            events: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T: ThreadKeyed + Clone> EventRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, replacing the previous event of the same thread (if any).
    pub fn retain(&self, event: T) -> Option<T> {
        lock(&self.events).insert(event.thread_id(), event)
    }

    pub fn get(&self, thread_id: i64) -> Option<T> {
        lock(&self.events).get(&thread_id).cloned()
    }

    /// Remove the event of a thread and return it.
    pub fn release(&self, thread_id: i64) -> Option<T> {
        lock(&self.events).remove(&thread_id)
    }

    /// Threads with a live event, in ascending order.
    pub fn threads(&self) -> Vec<i64> {
        lock(&self.events).keys().copied().collect()
    }

    pub fn purge(&self) {
        lock(&self.events).clear();
    }
}
