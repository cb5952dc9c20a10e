//! Per-volume lock table.
//!
//! Lifecycle operations on one volume or snapshot id are serialized; work on
//! different ids runs in parallel. Locks are created on first use and
//! removed again once nobody holds or waits for them. Waiters are served in
//! arrival order (`tokio::sync::Mutex` is fair), and waiting is bounded so a
//! stuck call turns into a retryable `Aborted` for everyone queued behind it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};
use crate::metrics;

type Slot = Arc<AsyncMutex<()>>;

#[derive(Debug, Default)]
struct Table {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Table {
    fn slot(&self, id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id.to_string()).or_default().clone()
    }

    /// Drop the slot for `id` if no guard or waiter references it.
    fn collect(&self, id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // One reference held by the map itself
        if slots.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(id);
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Table of named async locks with bounded acquisition.
#[derive(Debug, Clone)]
pub struct LockTable {
    table: Arc<Table>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(Table::default()),
            timeout,
        }
    }

    /// Acquire the lock for `id`, waiting at most the configured timeout.
    ///
    /// The returned guard releases the lock when dropped, including when the
    /// surrounding request future is cancelled.
    pub async fn acquire(&self, id: &str) -> DriverResult<LockGuard> {
        let slot = self.table.slot(id);

        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => {
                debug!(id, "Acquired volume lock");
                Ok(LockGuard {
                    id: id.to_string(),
                    guard: Some(guard),
                    table: Arc::clone(&self.table),
                })
            }
            Err(_) => {
                // The timed-out lock future is gone, release our slot reference too
                self.table.collect(id);
                metrics::record_lock_timeout();
                warn!(id, timeout_ms = self.timeout.as_millis() as u64, "Timed out waiting for volume lock");
                Err(DriverError::LockTimeout(id.to_string()))
            }
        }
    }

    /// Number of ids with a live lock slot.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds the lock for one id until dropped.
#[derive(Debug)]
pub struct LockGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Table>,
}

impl LockGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Release the mutex before checking whether the slot is idle
        drop(self.guard.take());
        self.table.collect(&self.id);
    }
}
