//! Process-wide cache of live store handles, keyed by canonical path.
//!
//! ## Disposal policy
//!
//! `dispose` never waits and never interrupts: if any lease is in flight (or
//! a migration holds the handle) it fails with [`StoreError::HandleBusy`] and
//! leaves the handle untouched. Callers retry once their work has drained.

mod handle;
mod path;

pub(crate) use handle::connect_options;
pub use handle::{DatabaseHandle, ExclusiveLease, HandleLease};
pub use path::CanonicalPath;

use crate::config::PoolConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Arc<DatabaseHandle>>>;

#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub path: String,
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub pool_size: u32,
    pub idle_connections: usize,
    pub in_flight: usize,
}

pub struct EngineCache {
    config: PoolConfig,
    // Held only to look up or insert a slot; handle construction runs under
    // the per-path OnceCell so different paths never wait on each other.
    slots: Mutex<HashMap<CanonicalPath, Slot>>,
    constructed: AtomicU64,
}

impl EngineCache {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            constructed: AtomicU64::new(0),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<CanonicalPath, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the handle for `path`, opening it on first use.
    ///
    /// Concurrent first callers for one path share a single construction.
    pub async fn acquire(&self, path: &CanonicalPath) -> Result<Arc<DatabaseHandle>> {
        loop {
            let slot = self
                .lock_slots()
                .entry(path.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let opened = slot
                .get_or_try_init(|| async {
                    let handle = DatabaseHandle::open(path.clone(), &self.config).await?;
                    self.constructed.fetch_add(1, Ordering::SeqCst);
                    tracing::info!("Opened store handle {} for {}", handle.id(), path);
                    Ok::<_, StoreError>(Arc::new(handle))
                })
                .await;
            let handle = match opened {
                Ok(handle) => handle,
                Err(e) => {
                    let mut slots = self.lock_slots();
                    if slots
                        .get(path)
                        .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                    {
                        slots.remove(path);
                    }
                    return Err(e);
                }
            };

            // Lost a race with dispose: drop the dead slot so the next pass
            // builds a fresh handle.
            if handle.is_disposed() {
                let mut slots = self.lock_slots();
                if slots.get(path).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(path);
                }
                continue;
            }

            handle.touch();
            return Ok(handle.clone());
        }
    }

    pub fn get(&self, path: &CanonicalPath) -> Option<Arc<DatabaseHandle>> {
        self.lock_slots()
            .get(path)
            .and_then(|slot| slot.get().cloned())
            .filter(|h| !h.is_disposed())
    }

    /// Closes the handle's connections and forgets it.
    pub async fn dispose(&self, path: &CanonicalPath) -> Result<()> {
        let handle = self
            .get(path)
            .ok_or_else(|| StoreError::HandleNotFound(path.to_string()))?;

        let exclusive = handle
            .try_exclusive()
            .ok_or_else(|| StoreError::HandleBusy(path.to_string()))?;
        if handle.is_disposed() {
            return Err(StoreError::HandleNotFound(path.to_string()));
        }
        handle.mark_disposed(&exclusive);

        {
            let mut slots = self.lock_slots();
            let same = slots
                .get(path)
                .and_then(|slot| slot.get())
                .map(|current| Arc::ptr_eq(current, &handle))
                .unwrap_or(false);
            if same {
                slots.remove(path);
            }
        }

        handle.close(&exclusive).await;
        tracing::info!("Disposed store handle {} for {}", handle.id(), path);
        Ok(())
    }

    pub fn list(&self) -> Vec<HandleInfo> {
        let mut handles: Vec<Arc<DatabaseHandle>> = self
            .lock_slots()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .filter(|h| !h.is_disposed())
            .collect();
        handles.sort_by(|a, b| a.path().cmp(b.path()));

        handles
            .iter()
            .map(|h| HandleInfo {
                path: h.path().to_string(),
                id: h.id(),
                created_at: h.created_at(),
                last_used_at: h.last_used_at(),
                pool_size: h.pool_size(),
                idle_connections: h.idle_connections(),
                in_flight: h.in_flight(),
            })
            .collect()
    }

    /// Number of handles ever constructed by this cache.
    pub fn constructed(&self) -> u64 {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for EngineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCache")
            .field("handles", &self.lock_slots().len())
            .field("constructed", &self.constructed())
            .finish()
    }
}
