//! Distributed cache backend on Redis
//!
//! Values are stored as JSON under
//! `{prefix}:{tenant}:{kind}:{user}` with a fixed TTL, shortened to the
//! entry's deadline when it has one. Every failure is logged and reported as
//! a miss.

use super::{CacheBackendKind, CacheConfig, CacheStats, PermissionCache};
use crate::error::{AuthzError, Result};
use crate::models::{Permission, RoleGrant};
use crate::types::{TenantId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const PERMISSIONS_KIND: &str = "perms";
const ROLES_KIND: &str = "roles";
const SCAN_BATCH: usize = 500;

/// Milliseconds an entry may live: the TTL, capped by `valid_until`. `None`
/// when the deadline has already passed.
fn entry_ttl_millis(ttl: Duration, valid_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
    match valid_until {
        None => Some(ttl),
        Some(at) => {
            let remaining = (at - now).num_milliseconds();
            (remaining > 0).then(|| ttl.min(remaining as u64))
        }
    }
}

/// Decode a stored payload; `None` marks an entry to discard
fn decode_entry<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Discarding undecodable cache entry {}: {}", key, e);
            None
        }
    }
}

/// Redis-backed permission cache
pub struct RedisCache {
    conn: ConnectionManager,
    ttl: Duration,
    prefix: String,
    stats: DashMap<&'static str, usize>,
}

impl RedisCache {
    /// Connect and verify the server answers `PING` within
    /// `config.connect_timeout`.
    pub async fn connect(url: &str, config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AuthzError::CacheError(format!("Invalid redis url: {}", e)))?;

        let mut conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| AuthzError::CacheError("Timed out connecting to redis".to_string()))?
            .map_err(|e| AuthzError::CacheError(format!("Failed to connect to redis: {}", e)))?;

        let pong = tokio::time::timeout(
            config.connect_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| AuthzError::CacheError("Timed out waiting for PING".to_string()))?
        .map_err(|e| AuthzError::CacheError(format!("PING failed: {}", e)))?;
        debug!("Redis answered {}", pong);

        Ok(Self {
            conn,
            ttl: config.redis_ttl,
            prefix: config.key_prefix.clone(),
            stats: DashMap::new(),
        })
    }

    fn key(&self, tenant: TenantId, kind: &str, user: UserId) -> String {
        format!("{}:{}:{}:{}", self.prefix, tenant, kind, user)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let raw = match redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Redis GET {} failed, treating as miss: {}", key, e);
                self.increment_stat("errors");
                self.increment_stat("misses");
                return None;
            }
        };

        let Some(raw) = raw else {
            self.increment_stat("misses");
            return None;
        };

        match decode_entry(key, &raw) {
            Some(value) => {
                self.increment_stat("hits");
                Some(value)
            }
            None => {
                self.increment_stat("errors");
                self.increment_stat("misses");
                self.delete(&[key.to_string()]).await;
                None
            }
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T, valid_until: Option<DateTime<Utc>>) {
        let Some(ttl_millis) = entry_ttl_millis(self.ttl, valid_until, Utc::now()) else {
            self.delete(&[key.to_string()]).await;
            return;
        };

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                self.increment_stat("errors");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let result = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis)
            .query_async::<_, ()>(&mut conn)
            .await;

        if let Err(e) = result {
            warn!("Redis SET {} failed: {}", key, e);
            self.increment_stat("errors");
        }
    }

    async fn delete(&self, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }

        let mut conn = self.conn.clone();
        match redis::cmd("DEL").arg(keys).query_async::<_, usize>(&mut conn).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Redis DEL of {} keys failed: {}", keys.len(), e);
                self.increment_stat("errors");
                0
            }
        }
    }

    /// Delete every key matching a glob pattern, batch by batch
    async fn delete_matching(&self, pattern: &str) -> usize {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let scan = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await;

            let (next, keys) = match scan {
                Ok(page) => page,
                Err(e) => {
                    warn!("Redis SCAN {} failed: {}", pattern, e);
                    self.increment_stat("errors");
                    return removed;
                }
            };

            removed += self.delete(&keys).await;
            if next == 0 {
                return removed;
            }
            cursor = next;
        }
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

#[async_trait]
impl PermissionCache for RedisCache {
    fn backend(&self) -> CacheBackendKind {
        CacheBackendKind::Redis
    }

    async fn get_user_permissions(&self, tenant: TenantId, user: UserId) -> Option<Vec<Permission>> {
        self.read(&self.key(tenant, PERMISSIONS_KIND, user)).await
    }

    async fn set_user_permissions(
        &self,
        tenant: TenantId,
        user: UserId,
        permissions: &[Permission],
        valid_until: Option<DateTime<Utc>>,
    ) {
        self.write(&self.key(tenant, PERMISSIONS_KIND, user), permissions, valid_until)
            .await;
    }

    async fn invalidate_user_permissions(&self, tenant: TenantId, user: UserId) {
        self.delete(&[self.key(tenant, PERMISSIONS_KIND, user)]).await;
    }

    async fn get_user_roles(&self, tenant: TenantId, user: UserId) -> Option<Vec<RoleGrant>> {
        self.read(&self.key(tenant, ROLES_KIND, user)).await
    }

    async fn set_user_roles(&self, tenant: TenantId, user: UserId, grants: &[RoleGrant]) {
        self.write(&self.key(tenant, ROLES_KIND, user), grants, None).await;
    }

    async fn invalidate_user_roles(&self, tenant: TenantId, user: UserId) {
        self.delete(&[self.key(tenant, ROLES_KIND, user)]).await;
    }

    async fn invalidate_user_everywhere(&self, user: UserId) {
        let pattern = format!("{}:*:*:{}", self.prefix, user);
        let removed = self.delete_matching(&pattern).await;
        debug!("Invalidated {} cache entries of user {}", removed, user);
    }

    async fn invalidate_tenant(&self, tenant: TenantId) -> usize {
        self.delete_matching(&format!("{}:{}:*", self.prefix, tenant)).await
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.get_stat("hits"),
            misses: self.get_stat("misses"),
            expirations: 0,
            errors: self.get_stat("errors"),
            entries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, UserRole};
    use crate::types::{PermissionScope, PermissionType, RoleType};

    // Requires a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7

    fn redis_url() -> String {
        std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_round_trip_and_tenant_flush() {
        let config = CacheConfig {
            key_prefix: format!("authz-test-{}", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let cache = RedisCache::connect(&redis_url(), &config).await.unwrap();

        let permissions = vec![Permission::new(1, "user_list_api", PermissionType::Api, PermissionScope::Tenant)];
        let grants = vec![RoleGrant {
            grant: UserRole::new(UserId(5), 4, TenantId(2)),
            role: Role::new(4, TenantId(2), "viewer", RoleType::Custom),
        }];

        cache.set_user_permissions(TenantId(2), UserId(5), &permissions, None).await;
        cache.set_user_roles(TenantId(2), UserId(5), &grants).await;
        assert_eq!(cache.get_user_permissions(TenantId(2), UserId(5)).await, Some(permissions));
        assert_eq!(cache.get_user_roles(TenantId(2), UserId(5)).await, Some(grants));

        assert_eq!(cache.invalidate_tenant(TenantId(2)).await, 2);
        assert!(cache.get_user_permissions(TenantId(2), UserId(5)).await.is_none());
    }

    #[test]
    fn test_entry_ttl_is_capped_by_deadline() {
        let now = Utc::now();
        let ttl = Duration::from_secs(1800);

        assert_eq!(entry_ttl_millis(ttl, None, now), Some(1_800_000));
        assert_eq!(
            entry_ttl_millis(ttl, Some(now + chrono::Duration::milliseconds(150)), now),
            Some(150)
        );
        assert_eq!(
            entry_ttl_millis(ttl, Some(now + chrono::Duration::hours(2)), now),
            Some(1_800_000)
        );
        assert_eq!(entry_ttl_millis(ttl, Some(now), now), None);
        assert_eq!(entry_ttl_millis(ttl, Some(now - chrono::Duration::seconds(1)), now), None);
    }

    #[test]
    fn test_undecodable_entry_is_discarded() {
        let permissions = vec![Permission::new(1, "user_list_api", PermissionType::Api, PermissionScope::Tenant)];
        let raw = serde_json::to_string(&permissions).unwrap();

        assert_eq!(decode_entry::<Vec<Permission>>("k", &raw), Some(permissions));
        assert!(decode_entry::<Vec<Permission>>("k", "{not json").is_none());
        // Well-formed JSON of the wrong shape is discarded as well
        assert!(decode_entry::<Vec<RoleGrant>>("k", &raw).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_fast() {
        let config = CacheConfig {
            connect_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let result = RedisCache::connect("redis://127.0.0.1:1", &config).await;
        assert!(matches!(result, Err(AuthzError::CacheError(_))));
    }
}
