//! Deferred Deletion Queue
//!
//! `UNLINK` removes a key from its table right away but leaves the deletion
//! hook for later. The removed `(key, value)` pairs wait here until the
//! table's drain cycle (see [`crate::storage::Cleaner::unlink_drainer`])
//! hands them to the hook, off the caller's path.

use crate::storage::value::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A key removed by `UNLINK`, waiting for its hook.
pub type Unlinked = (String, Value);

/// Thread-safe double-ended queue of unlinked entries.
///
/// `UNLINK` appends at the back and the drain pops from the front, so hooks
/// run in unlink order.
#[derive(Debug, Default)]
pub struct UnlinkQueue {
    items: Mutex<VecDeque<Unlinked>>,
}

impl UnlinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, key: String, value: Value) {
        self.items.lock().push_back((key, value));
    }

    pub fn push_front(&self, key: String, value: Value) {
        self.items.lock().push_front((key, value));
    }

    pub fn pop_front(&self) -> Option<Unlinked> {
        self.items.lock().pop_front()
    }

    pub fn pop_back(&self) -> Option<Unlinked> {
        self.items.lock().pop_back()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Takes every queued entry in FIFO order, leaving the queue empty.
    pub fn take_all(&self) -> VecDeque<Unlinked> {
        std::mem::take(&mut *self.items.lock())
    }
}
