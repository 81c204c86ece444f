//! C3: tracks placed-but-unfilled orders, keyed by `pos_id`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::PendingOrder;

#[derive(Clone, Default)]
pub struct PendingOrderTable {
    inner: Arc<Mutex<HashMap<String, PendingOrder>>>,
}

impl PendingOrderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: PendingOrder) {
        self.inner.lock().insert(order.pos_id.clone(), order);
    }

    pub fn get(&self, pos_id: &str) -> Option<PendingOrder> {
        self.inner.lock().get(pos_id).cloned()
    }

    /// Atomically removes and returns the entry, if present. Idempotent:
    /// removing twice is a no-op the second time.
    pub fn remove(&self, pos_id: &str) -> Option<PendingOrder> {
        self.inner.lock().remove(pos_id)
    }

    /// Snapshot of all pending entries, safe to iterate without the lock.
    pub fn list(&self) -> Vec<PendingOrder> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
