//! # Lock service client
//!
//! Best-effort range locking for objects whose batch atomicity demands it.
//! Acquisition busy-waits with bounded backoff, mirroring the
//! teardown-safe timeout idiom the transport layer uses for writes
//! ([`crate::transport::Endpoint::send`]); the lock is released before the
//! owning operation's output slot is written to caller memory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::sleep;

use crate::error::{CoreError, CoreResult};

/// A lock keyed by `(kind_name, object_path)`, covering the block ids a
/// distribution iterator reported for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind_name: String,
    pub object_path: String,
}

impl LockKey {
    pub fn new(kind_name: impl Into<String>, object_path: impl Into<String>) -> Self {
        Self {
            kind_name: kind_name.into(),
            object_path: object_path.into(),
        }
    }
}

/// Every block id currently locked under each key, shared between the
/// client and its outstanding guards.
type HeldLocks = Arc<Mutex<HashSet<(LockKey, Vec<u64>)>>>;

/// An in-process stand-in for the distributed lock service: sufficient to
/// exercise the acquire/release discipline and the `Conflict` error path
/// without a real lock server as a collaborator.
#[derive(Default)]
pub struct LockClient {
    held: HeldLocks,
}

/// A held lock; dropping it without calling [`LockGuard::release`] still
/// releases the block ids, since the guard's `Drop` impl removes them.
pub struct LockGuard {
    client: HeldLocks,
    key: LockKey,
    block_ids: Vec<u64>,
}

impl LockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Busy-waits with bounded jittered backoff until the block-id set for
    /// `key` is free, or `budget` elapses (surfacing [`CoreError::Conflict`]).
    pub async fn acquire(
        &self,
        key: LockKey,
        mut block_ids: Vec<u64>,
        budget: Duration,
    ) -> CoreResult<LockGuard> {
        block_ids.sort_unstable();
        block_ids.dedup();
        let deadline = Instant::now() + budget;
        let mut backoff_ms = 1u64;

        loop {
            {
                let mut held = self.held.lock();
                let conflict = held
                    .iter()
                    .any(|(k, ids)| k == &key && ids.iter().any(|id| block_ids.contains(id)));
                if !conflict {
                    held.insert((key.clone(), block_ids.clone()));
                    return Ok(LockGuard {
                        client: self.held.clone(),
                        key,
                        block_ids,
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(CoreError::Conflict(format!(
                    "could not acquire lock for {:?} within budget",
                    key
                )));
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff_ms);
            sleep(Duration::from_millis(backoff_ms + jitter)).await;
            backoff_ms = (backoff_ms * 2).min(50);
        }
    }
}

impl LockGuard {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.client.lock();
        held.remove(&(self.key.clone(), self.block_ids.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disjoint_block_ids_acquire_concurrently() {
        let client = LockClient::new();
        let a = client
            .acquire(LockKey::new("object", "ns/obj"), vec![0, 1], Duration::from_millis(100))
            .await
            .unwrap();
        let b = client
            .acquire(LockKey::new("object", "ns/obj"), vec![2, 3], Duration::from_millis(100))
            .await
            .unwrap();
        a.release();
        b.release();
    }

    #[tokio::test]
    async fn overlapping_block_ids_conflict_until_release() {
        let client = Arc::new(LockClient::new());
        let guard = client
            .acquire(LockKey::new("object", "ns/obj"), vec![0], Duration::from_millis(200))
            .await
            .unwrap();

        let client2 = client.clone();
        let waiter = tokio::spawn(async move {
            client2
                .acquire(LockKey::new("object", "ns/obj"), vec![0], Duration::from_millis(200))
                .await
        });

        sleep(Duration::from_millis(20)).await;
        guard.release();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn conflict_times_out_past_budget() {
        let client = LockClient::new();
        let _guard = client
            .acquire(LockKey::new("object", "ns/obj"), vec![0], Duration::from_secs(5))
            .await
            .unwrap();
        let result = client
            .acquire(LockKey::new("object", "ns/obj"), vec![0], Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }
}
