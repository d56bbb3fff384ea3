//! Cache registry: the owner of every cache entry.
//!
//! # Locking
//!
//! The id index is a `RwLock<HashMap<CacheId, Arc<Mutex<CacheEntry>>>>`. The
//! index lock is only held to look up, insert, or remove an `Arc`; all state
//! changes on an entry happen under that entry's own mutex. No lock is ever
//! held across an `.await`, so blob and tokenizer I/O never blocks other
//! callers.
//!
//! `delete` marks the entry `Deleted` under its mutex before removing it from
//! the index. A concurrent `update_ttl` that already holds the `Arc` then
//! sees `Deleted` and fails, so a deleted entry can never be revived.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::content_store::{ContentStore, PendingContent, ReclaimReport};
use crate::error::{CacheError, Result};
use crate::expiration::ExpirationManager;
use crate::types::{
    CacheEntry, CacheId, CacheState, CreateCacheRequest, DeleteOutcome, ExpirationPolicy, ModelId,
};

type EntryHandle = Arc<Mutex<CacheEntry>>;

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries moved from ACTIVE to EXPIRED.
    pub expired: Vec<CacheId>,
    /// Expired entries deleted after their retention window.
    pub purged: Vec<CacheId>,
    /// Blob releases that failed and stay queued.
    pub reclaim_failures: usize,
}

impl SweepReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.purged.is_empty() && self.reclaim_failures == 0
    }
}

/// Thread-safe registry of cache entries.
#[derive(Debug)]
pub struct CacheRegistry {
    entries: RwLock<HashMap<CacheId, EntryHandle>>,
    store: ContentStore,
    expiration: ExpirationManager,
    default_ttl: Duration,
}

impl CacheRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    /// * `store` - Content storage for cached parts
    /// * `expiration` - Deadline tracking
    /// * `default_ttl` - TTL used when a request names no expiration
    #[must_use]
    pub fn new(store: ContentStore, expiration: ExpirationManager, default_ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), store, expiration, default_ttl }
    }

    /// Creates and registers a cache.
    ///
    /// Either a fully populated ACTIVE entry is registered, or nothing is:
    /// content stored before a failure (or before the future is dropped) is
    /// discarded. Validation errors are raised before anything is stored.
    ///
    /// # Errors
    /// * `UnversionedModel` - the model id is an alias
    /// * `AmbiguousExpiration` - both `ttl` and `expire_time` were set
    /// * `InvalidArgument` - empty content or an invalid deadline
    /// * `ContentTooSmall` - below the minimum token count
    pub async fn create(&self, request: CreateCacheRequest, now: DateTime<Utc>) -> Result<CacheEntry> {
        let model_id = ModelId::parse(&request.model_id)?;
        let policy = ExpirationPolicy::from_options(request.ttl, request.expire_time)?
            .unwrap_or(ExpirationPolicy::Ttl(self.default_ttl));
        let expire_at = self.expiration.resolve(policy, now)?;

        let (content_ref, content) =
            self.store.put(&model_id, request.contents, request.system_instruction).await?;
        let pending = PendingContent::new(&self.store, content_ref.clone());

        let id = CacheId::generate();
        let entry = CacheEntry {
            id: id.clone(),
            model_id,
            display_name: request.display_name,
            content_ref,
            content,
            created_at: now,
            updated_at: now,
            expire_at,
            state: CacheState::Active,
        };

        {
            let mut entries = self.write_index()?;
            self.expiration.schedule(&id, ExpirationPolicy::ExpireAt(expire_at), now)?;
            entries.insert(id.clone(), Arc::new(Mutex::new(entry.clone())));
        }
        pending.commit();

        info!(
            cache_id = %id,
            model_id = %entry.model_id,
            token_count = entry.token_count(),
            expire_at = %entry.expire_at.to_rfc3339(),
            "Created context cache"
        );
        Ok(entry)
    }

    /// Returns a snapshot of a cache.
    ///
    /// A cache past its deadline is reported as EXPIRED even if the sweep has
    /// not run yet.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown or deleted ids.
    pub fn get(&self, id: &CacheId, now: DateTime<Utc>) -> Result<CacheEntry> {
        let handle = self.handle(id)?;
        let mut entry = lock_entry(&handle)?;
        Self::observe(&mut entry, now)?;
        Ok(entry.clone())
    }

    /// Lists ACTIVE and EXPIRED caches, oldest first.
    pub fn list(&self, now: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let handles: Vec<EntryHandle> = self.read_index()?.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut entry = lock_entry(&handle)?;
            if Self::observe(&mut entry, now).is_ok() {
                snapshots.push(entry.clone());
            }
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Replaces a cache's expiration.
    ///
    /// The new deadline is measured from `now`, not added to the old one.
    ///
    /// # Errors
    /// * `NotFound` - unknown id
    /// * `InvalidState` - the cache is EXPIRED or DELETED
    /// * `InvalidArgument` - the policy does not resolve to a valid deadline
    pub fn update_ttl(
        &self,
        id: &CacheId,
        policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let handle = self.handle(id)?;
        let mut entry = lock_entry(&handle)?;
        entry.expire_if_due(now);

        if entry.state != CacheState::Active {
            warn!(cache_id = %id, state = %entry.state, "Rejected TTL update");
            return Err(CacheError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "update_ttl",
            });
        }

        let expire_at = self.expiration.refresh(id, policy, now)?;
        entry.expire_at = expire_at;
        entry.updated_at = now;

        info!(cache_id = %id, expire_at = %expire_at.to_rfc3339(), "Updated cache expiration");
        Ok(entry.clone())
    }

    /// Deletes a cache and reclaims its content.
    ///
    /// Safe to call repeatedly: unknown and already-deleted ids return
    /// [`DeleteOutcome::AlreadyDeleted`].
    pub async fn delete(&self, id: &CacheId) -> Result<DeleteOutcome> {
        let Some(content_ref) = self.retire(id, None)? else {
            debug!(cache_id = %id, "Delete of absent cache is a no-op");
            return Ok(DeleteOutcome::AlreadyDeleted);
        };

        self.store.delete(&content_ref).await?;
        info!(cache_id = %id, "Deleted context cache");
        Ok(DeleteOutcome::Deleted)
    }

    /// Runs one expiration pass.
    ///
    /// Expires due caches, purges caches expired longer than the retention
    /// window, and retries queued blob releases. Failures on one cache are
    /// logged and do not stop the rest of the pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for id in self.expiration.sweep(now) {
            let Ok(handle) = self.handle(&id) else {
                continue;
            };
            match lock_entry(&handle) {
                Ok(mut entry) => {
                    if entry.expire_if_due(now) {
                        debug!(cache_id = %id, "Cache expired");
                        report.expired.push(id);
                    }
                }
                Err(e) => warn!(cache_id = %id, error = %e, "Skipping cache during sweep"),
            }
        }

        let retention = chrono::Duration::from_std(self.expiration.expired_retention())
            .unwrap_or(chrono::Duration::MAX);
        for id in self.expiration.due_for_purge(now) {
            match self.retire(&id, Some((now, retention))) {
                Ok(Some(content_ref)) => {
                    if let Err(e) = self.store.delete(&content_ref).await {
                        warn!(cache_id = %id, error = %e, "Failed to reclaim purged cache content");
                    }
                    info!(cache_id = %id, "Purged expired cache");
                    report.purged.push(id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(cache_id = %id, error = %e, "Failed to purge cache, retrying next sweep");
                    self.expiration.requeue_purge(&id, now);
                }
            }
        }

        let ReclaimReport { failed, .. } = self.store.reclaim_pending().await;
        report.reclaim_failures = failed;
        report
    }

    /// Number of registered (not deleted) caches.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_index()?.len())
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The content store backing this registry.
    #[must_use]
    pub fn content_store(&self) -> &ContentStore {
        &self.store
    }

    /// The expiration manager backing this registry.
    #[must_use]
    pub fn expiration(&self) -> &ExpirationManager {
        &self.expiration
    }

    /// Marks an entry DELETED and unlinks it, returning its content handle.
    ///
    /// With `purge_after`, only an EXPIRED entry whose deadline plus the
    /// retention window is at or before the given instant is retired.
    fn retire(
        &self,
        id: &CacheId,
        purge_after: Option<(DateTime<Utc>, chrono::Duration)>,
    ) -> Result<Option<crate::types::ContentRef>> {
        let Ok(handle) = self.handle(id) else {
            return Ok(None);
        };

        let content_ref = {
            let mut entry = lock_entry(&handle)?;
            if entry.state == CacheState::Deleted {
                return Ok(None);
            }
            if let Some((now, retention)) = purge_after {
                entry.expire_if_due(now);
                let window_over = entry
                    .expire_at
                    .checked_add_signed(retention)
                    .is_some_and(|purge_at| purge_at <= now);
                if entry.state != CacheState::Expired || !window_over {
                    return Ok(None);
                }
            }
            entry.state = CacheState::Deleted;
            entry.content_ref.clone()
        };

        self.write_index()?.remove(id);
        self.expiration.cancel(id);
        Ok(Some(content_ref))
    }

    /// Applies the lazy expiry check and hides deleted entries.
    fn observe(entry: &mut CacheEntry, now: DateTime<Utc>) -> Result<()> {
        if entry.state == CacheState::Deleted {
            return Err(CacheError::NotFound(entry.id.to_string()));
        }
        if entry.expire_if_due(now) {
            debug!(cache_id = %entry.id, "Cache expired on read");
        }
        Ok(())
    }

    fn handle(&self, id: &CacheId) -> Result<EntryHandle> {
        self.read_index()?
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(id.to_string()))
    }

    fn read_index(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<CacheId, EntryHandle>>> {
        self.entries.read().map_err(|_| CacheError::poisoned("cache registry"))
    }

    fn write_index(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<CacheId, EntryHandle>>> {
        self.entries.write().map_err(|_| CacheError::poisoned("cache registry"))
    }
}

fn lock_entry(handle: &EntryHandle) -> Result<MutexGuard<'_, CacheEntry>> {
    handle.lock().map_err(|_| CacheError::poisoned("cache entry"))
}
