//! In-process cache backend with TTL and a periodic expiry sweep

use super::{CacheBackendKind, CacheStats, PermissionCache};
use crate::models::{Permission, RoleGrant};
use crate::types::{TenantId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type CacheKey = (TenantId, UserId);

/// Cached entry with TTL and an optional hard deadline
#[derive(Clone)]
struct CachedEntry<T> {
    value: T,
    cached_at: Instant,
    valid_until: Option<DateTime<Utc>>,
}

impl<T> CachedEntry<T> {
    fn new(value: T, valid_until: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            valid_until,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl || self.valid_until.is_some_and(|at| at <= Utc::now())
    }
}

type EntryMap<T> = DashMap<CacheKey, CachedEntry<T>>;

/// Maps and counters shared with the sweep task
struct Shared {
    permissions: EntryMap<Vec<Permission>>,
    roles: EntryMap<Vec<RoleGrant>>,
    stats: DashMap<&'static str, usize>,
    ttl: Duration,
}

impl Shared {
    fn lookup<T: Clone>(&self, map: &EntryMap<T>, key: CacheKey) -> Option<T> {
        let found = match map.get(&key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                self.increment_stat("hits");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        // Only drop what is still expired; a writer may have replaced it
        if found && map.remove_if(&key, |_, entry| entry.is_expired(self.ttl)).is_some() {
            self.increment_stat("expirations");
        }
        self.increment_stat("misses");
        None
    }

    fn sweep(&self) -> usize {
        let before = self.permissions.len() + self.roles.len();
        let ttl = self.ttl;
        self.permissions.retain(|_, entry| !entry.is_expired(ttl));
        self.roles.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before.saturating_sub(self.permissions.len() + self.roles.len());

        if removed > 0 {
            self.stats
                .entry("expirations")
                .and_modify(|count| *count += removed)
                .or_insert(removed);
        }
        removed
    }

    fn increment_stat(&self, key: &'static str) {
        self.stats
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    fn get_stat(&self, key: &str) -> usize {
        self.stats.get(key).map(|v| *v).unwrap_or(0)
    }
}

/// In-process permission cache
///
/// Entries live for `ttl`. A background task started on construction sweeps
/// expired entries every `sweep_interval`; reads additionally drop expired
/// entries they run into. Call [`PermissionCache::shutdown`] to stop the task;
/// dropping the cache also stops it.
pub struct MemoryCache {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCache {
    /// Create the cache and start its sweep task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            permissions: DashMap::new(),
            roles: DashMap::new(),
            stats: DashMap::new(),
            ttl,
        });
        let cancel = CancellationToken::new();

        let task_shared = Arc::clone(&shared);
        let task_cancel = cancel.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = task_shared.sweep();
                        if removed > 0 {
                            debug!("Cache sweep removed {} expired entries", removed);
                        }
                    }
                }
            }
            debug!("Cache sweep task stopped");
        });

        Self {
            shared,
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Remove expired entries now. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        self.shared.sweep()
    }

    /// Number of live and not yet swept entries
    pub fn len(&self) -> usize {
        self.shared.permissions.len() + self.shared.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the sweep task is still running
    pub fn is_sweeping(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Clear every entry and reset statistics
    pub fn clear(&self) {
        self.shared.permissions.clear();
        self.shared.roles.clear();
        self.shared.stats.clear();
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl PermissionCache for MemoryCache {
    fn backend(&self) -> CacheBackendKind {
        CacheBackendKind::Memory
    }

    async fn get_user_permissions(&self, tenant: TenantId, user: UserId) -> Option<Vec<Permission>> {
        self.shared.lookup(&self.shared.permissions, (tenant, user))
    }

    async fn set_user_permissions(
        &self,
        tenant: TenantId,
        user: UserId,
        permissions: &[Permission],
        valid_until: Option<DateTime<Utc>>,
    ) {
        self.shared
            .permissions
            .insert((tenant, user), CachedEntry::new(permissions.to_vec(), valid_until));
    }

    async fn invalidate_user_permissions(&self, tenant: TenantId, user: UserId) {
        self.shared.permissions.remove(&(tenant, user));
    }

    async fn get_user_roles(&self, tenant: TenantId, user: UserId) -> Option<Vec<RoleGrant>> {
        self.shared.lookup(&self.shared.roles, (tenant, user))
    }

    async fn set_user_roles(&self, tenant: TenantId, user: UserId, grants: &[RoleGrant]) {
        self.shared
            .roles
            .insert((tenant, user), CachedEntry::new(grants.to_vec(), None));
    }

    async fn invalidate_user_roles(&self, tenant: TenantId, user: UserId) {
        self.shared.roles.remove(&(tenant, user));
    }

    async fn invalidate_user_everywhere(&self, user: UserId) {
        self.shared.permissions.retain(|(_, u), _| *u != user);
        self.shared.roles.retain(|(_, u), _| *u != user);
    }

    async fn invalidate_tenant(&self, tenant: TenantId) -> usize {
        let before = self.len();
        self.shared.permissions.retain(|(t, _), _| *t != tenant);
        self.shared.roles.retain(|(t, _), _| *t != tenant);
        before.saturating_sub(self.len())
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.shared.get_stat("hits"),
            misses: self.shared.get_stat("misses"),
            expirations: self.shared.get_stat("expirations"),
            errors: 0,
            entries: self.len(),
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
    }
}
