//! Expiration scheduling.
//!
//! The manager keeps one deadline per cache plus two ordered queues: caches
//! waiting to expire, and expired caches waiting to be purged once their
//! retention window has passed. It never touches entries itself; the
//! registry applies the state transitions for the ids the queues yield.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CacheError, Result};
use crate::types::{CacheId, ExpirationPolicy};

#[derive(Debug, Default)]
struct Schedule {
    deadlines: HashMap<CacheId, DateTime<Utc>>,
    expiry_queue: BTreeSet<(DateTime<Utc>, CacheId)>,
    purge_queue: BTreeSet<(DateTime<Utc>, CacheId)>,
}

impl Schedule {
    fn unschedule(&mut self, id: &CacheId) -> Option<DateTime<Utc>> {
        let previous = self.deadlines.remove(id)?;
        self.expiry_queue.remove(&(previous, id.clone()));
        self.purge_queue.retain(|(_, queued)| queued != id);
        Some(previous)
    }

    fn insert(&mut self, id: &CacheId, at: DateTime<Utc>) {
        self.deadlines.insert(id.clone(), at);
        self.expiry_queue.insert((at, id.clone()));
    }
}

/// Tracks per-cache expiration deadlines.
#[derive(Debug)]
pub struct ExpirationManager {
    max_ttl: Duration,
    expired_retention: Duration,
    schedule: Mutex<Schedule>,
}

impl ExpirationManager {
    /// Creates a manager.
    ///
    /// # Arguments
    /// * `max_ttl` - Longest accepted distance between a request and its deadline
    /// * `expired_retention` - How long expired caches wait before purge
    #[must_use]
    pub fn new(max_ttl: Duration, expired_retention: Duration) -> Self {
        Self { max_ttl, expired_retention, schedule: Mutex::new(Schedule::default()) }
    }

    /// Turns a policy into an absolute deadline relative to `now`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the deadline is not in the future or is
    /// further away than the configured maximum TTL.
    pub fn resolve(&self, policy: ExpirationPolicy, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let at = match policy {
            ExpirationPolicy::Ttl(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|_| CacheError::InvalidArgument(format!("ttl {ttl:?} is out of range")))?;
                now.checked_add_signed(ttl)
                    .ok_or_else(|| CacheError::InvalidArgument("ttl overflows the clock".to_string()))?
            }
            ExpirationPolicy::ExpireAt(at) => at,
        };

        if at <= now {
            return Err(CacheError::InvalidArgument(format!(
                "expiration {} is not in the future",
                at.to_rfc3339()
            )));
        }

        let remaining = (at - now).to_std().unwrap_or(Duration::MAX);
        if remaining > self.max_ttl {
            return Err(CacheError::InvalidArgument(format!(
                "expiration is {}s away, maximum is {}s",
                remaining.as_secs(),
                self.max_ttl.as_secs()
            )));
        }

        Ok(at)
    }

    /// Schedules expiration for a new cache.
    ///
    /// Returns the resolved deadline.
    pub fn schedule(
        &self,
        id: &CacheId,
        policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let at = self.resolve(policy, now)?;
        let mut schedule = self.lock()?;
        schedule.unschedule(id);
        schedule.insert(id, at);
        Ok(at)
    }

    /// Replaces a cache's deadline.
    ///
    /// The new deadline is computed from `now`; it does not add to the old one.
    ///
    /// # Errors
    /// Returns `NotFound` if the id was never scheduled, or `InvalidArgument`
    /// if the policy does not resolve to a valid deadline.
    pub fn refresh(
        &self,
        id: &CacheId,
        policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let at = self.resolve(policy, now)?;
        let mut schedule = self.lock()?;
        if schedule.unschedule(id).is_none() {
            return Err(CacheError::NotFound(id.to_string()));
        }
        schedule.insert(id, at);
        Ok(at)
    }

    /// Whether the cache's deadline is at or before `now`.
    ///
    /// Unknown ids are not expired.
    pub fn is_expired(&self, id: &CacheId, now: DateTime<Utc>) -> bool {
        self.deadline(id).is_some_and(|at| at <= now)
    }

    /// The cache's current deadline.
    pub fn deadline(&self, id: &CacheId) -> Option<DateTime<Utc>> {
        self.lock().ok()?.deadlines.get(id).copied()
    }

    /// Pops every cache whose deadline is at or before `now`.
    ///
    /// Popped ids move to the purge queue, due at their deadline plus the
    /// retention window.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<CacheId> {
        let Ok(mut schedule) = self.lock() else {
            return Vec::new();
        };

        let retention = chrono::Duration::from_std(self.expired_retention)
            .unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();

        while let Some((at, id)) = schedule.expiry_queue.first().cloned() {
            if at > now {
                break;
            }
            schedule.expiry_queue.pop_first();
            let purge_at = at.checked_add_signed(retention).unwrap_or(DateTime::<Utc>::MAX_UTC);
            schedule.purge_queue.insert((purge_at, id.clone()));
            expired.push(id);
        }

        expired
    }

    /// Pops every expired cache whose retention window ended at or before `now`.
    pub fn due_for_purge(&self, now: DateTime<Utc>) -> Vec<CacheId> {
        let Ok(mut schedule) = self.lock() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        while let Some((at, id)) = schedule.purge_queue.first().cloned() {
            if at > now {
                break;
            }
            schedule.purge_queue.pop_first();
            due.push(id);
        }
        due
    }

    /// Puts a popped cache back on the purge queue, due at `at`.
    ///
    /// Ignored for caches that were cancelled in the meantime.
    pub fn requeue_purge(&self, id: &CacheId, at: DateTime<Utc>) {
        if let Ok(mut schedule) = self.lock() {
            if schedule.deadlines.contains_key(id) {
                schedule.purge_queue.insert((at, id.clone()));
            }
        }
    }

    /// Forgets a cache entirely.
    pub fn cancel(&self, id: &CacheId) {
        if let Ok(mut schedule) = self.lock() {
            schedule.unschedule(id);
        }
    }

    /// Configured retention for expired caches.
    #[must_use]
    pub fn expired_retention(&self) -> Duration {
        self.expired_retention
    }

    /// Number of scheduled caches.
    pub fn len(&self) -> usize {
        self.lock().map(|schedule| schedule.deadlines.len()).unwrap_or_default()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Schedule>> {
        self.schedule.lock().map_err(|_| CacheError::poisoned("expiration schedule"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn manager() -> ExpirationManager {
        ExpirationManager::new(Duration::from_secs(7 * 24 * 3600), HOUR)
    }

    #[test]
    fn test_resolve_ttl_and_absolute() {
        let manager = manager();
        assert_eq!(manager.resolve(ExpirationPolicy::Ttl(HOUR), t0()).unwrap(), t0() + minutes(60));

        let at = t0() + minutes(5);
        assert_eq!(manager.resolve(ExpirationPolicy::ExpireAt(at), t0()).unwrap(), at);
    }

    #[test]
    fn test_resolve_rejects_past_and_too_far() {
        let manager = manager();
        assert!(matches!(
            manager.resolve(ExpirationPolicy::ExpireAt(t0()), t0()),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.resolve(ExpirationPolicy::Ttl(Duration::ZERO), t0()),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.resolve(ExpirationPolicy::Ttl(Duration::from_secs(8 * 24 * 3600)), t0()),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_refresh_is_absolute_not_additive() {
        let manager = manager();
        let id = CacheId::generate();
        manager.schedule(&id, ExpirationPolicy::Ttl(HOUR), t0()).unwrap();

        let refreshed = manager.refresh(&id, ExpirationPolicy::Ttl(HOUR), t0() + minutes(30)).unwrap();

        assert_eq!(refreshed, t0() + minutes(90));
        assert_eq!(manager.deadline(&id), Some(t0() + minutes(90)));
        assert!(!manager.is_expired(&id, t0() + minutes(61)));
        assert!(manager.is_expired(&id, t0() + minutes(90)));
    }

    #[test]
    fn test_refresh_unknown_id() {
        let manager = manager();
        let id = CacheId::generate();
        assert!(matches!(
            manager.refresh(&id, ExpirationPolicy::Ttl(HOUR), t0()),
            Err(CacheError::NotFound(_))
        ));
        assert!(!manager.is_expired(&id, t0()));
    }

    #[test]
    fn test_sweep_pops_due_in_order() {
        let manager = manager();
        let early = CacheId::generate();
        let late = CacheId::generate();
        let later = CacheId::generate();
        manager.schedule(&late, ExpirationPolicy::Ttl(Duration::from_secs(120)), t0()).unwrap();
        manager.schedule(&early, ExpirationPolicy::Ttl(Duration::from_secs(60)), t0()).unwrap();
        manager.schedule(&later, ExpirationPolicy::Ttl(HOUR), t0()).unwrap();

        assert!(manager.sweep(t0()).is_empty());
        assert_eq!(manager.sweep(t0() + minutes(2)), vec![early.clone(), late.clone()]);
        assert!(manager.sweep(t0() + minutes(2)).is_empty());
        assert_eq!(manager.len(), 3);

        assert!(manager.due_for_purge(t0() + minutes(60)).is_empty());
        assert_eq!(manager.due_for_purge(t0() + minutes(62)), vec![early, late]);
    }

    #[test]
    fn test_requeue_purge_skips_cancelled() {
        let manager = manager();
        let kept = CacheId::generate();
        let cancelled = CacheId::generate();
        manager.schedule(&kept, ExpirationPolicy::Ttl(Duration::from_secs(60)), t0()).unwrap();
        manager.schedule(&cancelled, ExpirationPolicy::Ttl(Duration::from_secs(60)), t0()).unwrap();
        manager.sweep(t0() + minutes(1));
        assert_eq!(manager.due_for_purge(t0() + minutes(61)).len(), 2);

        manager.cancel(&cancelled);
        manager.requeue_purge(&kept, t0() + minutes(61));
        manager.requeue_purge(&cancelled, t0() + minutes(61));

        assert_eq!(manager.due_for_purge(t0() + minutes(62)), vec![kept]);
    }

    #[test]
    fn test_cancel_removes_everything() {
        let manager = manager();
        let id = CacheId::generate();
        manager.schedule(&id, ExpirationPolicy::Ttl(Duration::from_secs(60)), t0()).unwrap();
        manager.sweep(t0() + minutes(1));

        manager.cancel(&id);

        assert!(manager.is_empty());
        assert!(manager.deadline(&id).is_none());
        assert!(manager.due_for_purge(t0() + minutes(600)).is_empty());
    }
}
