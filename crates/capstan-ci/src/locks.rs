//! Named mutual-exclusion locks serializing conflicting phases and builds.

use capstan_core::config::LockScope;
use capstan_core::{obs, BuildObserver, ExecError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// A resolved lock: name plus scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockKey {
    pub name: String,
    pub scope: LockScope,
}

impl LockKey {
    pub fn new(name: impl Into<String>, scope: LockScope) -> Self {
        LockKey {
            name: name.into(),
            scope,
        }
    }

    /// Registry identifier; scope is part of the identity so a branch lock
    /// and a repo lock with the same name do not collide.
    fn id(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

/// Coordinates named locks across concurrent builds in one process.
///
/// Acquisition always happens in sorted key order so two builds requesting
/// overlapping lock sets cannot deadlock. Waiters on one name are served
/// FIFO (tokio's mutex queue is fair).
pub struct LockCoordinator {
    registry: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wait: Duration,
}

impl LockCoordinator {
    pub fn new(wait: Duration) -> Self {
        LockCoordinator {
            registry: Mutex::new(HashMap::new()),
            wait,
        }
    }

    /// Acquire every key, blocking until available, bounded by the
    /// configured wait. Released when the returned guard drops.
    pub async fn acquire_all(
        &self,
        keys: &[LockKey],
        observer: Arc<dyn BuildObserver>,
    ) -> Result<LockGuard, ExecError> {
        let mut sorted: Vec<LockKey> = keys.to_vec();
        sorted.sort_by(|a, b| a.id().cmp(&b.id()));
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for key in sorted {
            let mutex = {
                let mut registry = self.registry.lock().await;
                registry
                    .entry(key.id())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            };

            debug!(lock = %key.name, scope = %key.scope, "waiting for lock");
            let guard = tokio::time::timeout(self.wait, mutex.lock_owned())
                .await
                .map_err(|_| ExecError::LockTimeout {
                    name: key.name.clone(),
                    secs: self.wait.as_secs(),
                })?;

            obs::emit_lock_acquired(&key.name);
            observer.on_lock_acquired(&key.name);
            held.push((key.name.clone(), guard));
        }

        Ok(LockGuard {
            held,
            observer,
        })
    }
}

/// Held locks; releases everything when dropped.
pub struct LockGuard {
    held: Vec<(String, OwnedMutexGuard<()>)>,
    observer: Arc<dyn BuildObserver>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.names())
            .finish()
    }
}

impl LockGuard {
    pub fn names(&self) -> Vec<&str> {
        self.held.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for (name, _) in &self.held {
            obs::emit_lock_released(name);
            self.observer.on_lock_released(name);
        }
    }
}
