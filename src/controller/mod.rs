//! Reconcilers
//!
//! Three controllers share one schema cache: the Template reconciler drives
//! the patch/synthesize pipeline, the REST reconciler mirrors object
//! lifecycles onto HTTP endpoints, and the CRD reconciler expires the cache
//! when definitions change so the other two pick up new schemas.

pub mod crd;
pub mod rest;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-name async locks.
///
/// Reconciles for the same resource name must serialize even when they are
/// triggered from different places (the controller queue and the informer
/// fleet); distinct names run concurrently.
#[derive(Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `name`, creating it on first use
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_serializes() {
        let locks = Arc::new(NamedLocks::new());
        let guard = locks.lock("a").await;

        let locks2 = locks.clone();
        let second = tokio::spawn(async move { locks2.lock("a").await });

        // the second lock cannot complete while the first guard is held
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(guard);
        second.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_names_run_concurrently() {
        let locks = NamedLocks::new();
        let _a = locks.lock("a").await;
        // acquiring a different name must not block
        let _b = locks.lock("b").await;
    }
}
