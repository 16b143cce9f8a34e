//! Per-request mutual exclusion within one process

use dashmap::DashMap;
use diwan_core::RequestId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per request id. Writers on different requests never wait on
/// each other, and an entry lives only while someone holds or waits on it.
#[derive(Debug, Default)]
pub struct RequestLocks {
    locks: DashMap<RequestId, Arc<Mutex<()>>>,
}

/// Exclusive access to one request. Releasing the last interest in a request
/// removes its entry from the map.
#[derive(Debug)]
pub struct RequestLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a RequestLocks,
    request_id: RequestId,
}

impl Drop for RequestLockGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex first so its Arc clone is gone before counting
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.request_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `request_id`
    pub async fn acquire(&self, request_id: RequestId) -> RequestLockGuard<'_> {
        let lock = self
            .locks
            .entry(request_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RequestLockGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            request_id,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
