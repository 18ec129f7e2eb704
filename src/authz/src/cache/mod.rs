//! Cache-aside storage for resolved user permissions and roles
//!
//! Two interchangeable backends implement [`PermissionCache`]:
//!
//! - [`RedisCache`]: shared across replicas, fixed TTL, every transport or
//!   (de)serialization failure degrades to a miss
//! - [`MemoryCache`]: lock-free `DashMap` with per-entry TTL, a background
//!   sweep task and lazy expiry on read
//!
//! The backend is chosen once by [`build_cache`]; the engine only sees the
//! trait object.

mod memory;
mod redis_cache;

pub use self::memory::MemoryCache;
pub use self::redis_cache::RedisCache;

use crate::models::{Permission, RoleGrant};
use crate::types::{TenantId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which cache implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    /// In-process map with periodic sweep
    Memory,
    /// Distributed Redis cache
    Redis,
}

impl fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "local" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown cache backend '{}'", other)),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Preferred backend; Redis falls back to memory when unreachable
    pub backend: CacheBackendKind,

    /// Redis connection URL (required for the Redis backend)
    pub redis_url: Option<String>,

    /// Time-to-live of Redis entries
    pub redis_ttl: Duration,

    /// Time-to-live of in-process entries
    pub memory_ttl: Duration,

    /// Interval of the in-process expiry sweep
    pub sweep_interval: Duration,

    /// Budget for connecting to Redis and answering the first PING
    pub connect_timeout: Duration,

    /// Namespace prepended to every Redis key
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            redis_ttl: Duration::from_secs(30 * 60),
            memory_ttl: Duration::from_secs(2 * 60 * 60),
            sweep_interval: Duration::from_secs(15 * 60),
            connect_timeout: Duration::from_secs(2),
            key_prefix: "authz".to_string(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// - `AUTHZ_CACHE_BACKEND` - `memory` or `redis`
    /// - `REDIS_URL` - Redis connection URL
    /// - `AUTHZ_REDIS_TTL_SECS`, `AUTHZ_MEMORY_TTL_SECS`, `AUTHZ_SWEEP_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty());
        let backend = std::env::var("AUTHZ_CACHE_BACKEND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(if redis_url.is_some() {
                CacheBackendKind::Redis
            } else {
                defaults.backend
            });

        Self {
            backend,
            redis_url,
            redis_ttl: env_secs("AUTHZ_REDIS_TTL_SECS").unwrap_or(defaults.redis_ttl),
            memory_ttl: env_secs("AUTHZ_MEMORY_TTL_SECS").unwrap_or(defaults.memory_ttl),
            sweep_interval: env_secs("AUTHZ_SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
            connect_timeout: defaults.connect_timeout,
            key_prefix: std::env::var("AUTHZ_CACHE_PREFIX").unwrap_or(defaults.key_prefix),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
    /// Transport or (de)serialization failures swallowed as misses
    pub errors: usize,
    /// Live entries; only known for the in-process backend
    pub entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Uniform contract of both cache backends, keyed by `(tenant, user)`.
///
/// Methods never fail: a backend that cannot answer reports a miss, and a
/// failed write is dropped, so callers always fall back to the stores.
///
/// The roles entry holds the grants behind the roles, so readers can drop
/// grants that expired after the entry was written. A permission set is
/// written with the earliest expiry of the grants it came from and is
/// reported as a miss once that instant has passed.
#[async_trait]
pub trait PermissionCache: Send + Sync {
    /// Which implementation this is
    fn backend(&self) -> CacheBackendKind;

    async fn get_user_permissions(&self, tenant: TenantId, user: UserId) -> Option<Vec<Permission>>;

    async fn set_user_permissions(
        &self,
        tenant: TenantId,
        user: UserId,
        permissions: &[Permission],
        valid_until: Option<DateTime<Utc>>,
    );

    async fn invalidate_user_permissions(&self, tenant: TenantId, user: UserId);

    async fn get_user_roles(&self, tenant: TenantId, user: UserId) -> Option<Vec<RoleGrant>>;

    async fn set_user_roles(&self, tenant: TenantId, user: UserId, grants: &[RoleGrant]);

    async fn invalidate_user_roles(&self, tenant: TenantId, user: UserId);

    /// Drop every entry of a user across all tenants
    async fn invalidate_user_everywhere(&self, user: UserId);

    /// Drop every entry under a tenant. Returns the number of entries removed.
    async fn invalidate_tenant(&self, tenant: TenantId) -> usize;

    async fn stats(&self) -> CacheStats;

    /// Stop background work owned by the backend
    async fn shutdown(&self) {}
}

/// Pick and start the cache backend.
///
/// Redis is used only when configured and reachable within
/// `connect_timeout`; otherwise the in-process backend is started. Must be
/// called inside a Tokio runtime.
pub async fn build_cache(config: &CacheConfig) -> Arc<dyn PermissionCache> {
    if config.backend == CacheBackendKind::Redis {
        match config.redis_url.as_deref() {
            Some(url) => match RedisCache::connect(url, config).await {
                Ok(cache) => {
                    info!("Using redis permission cache (ttl={:?})", config.redis_ttl);
                    return Arc::new(cache);
                }
                Err(e) => {
                    warn!("Redis cache unavailable, falling back to memory cache: {}", e);
                }
            },
            None => warn!("Redis cache selected without REDIS_URL, falling back to memory cache"),
        }
    }

    info!(
        "Using memory permission cache (ttl={:?}, sweep={:?})",
        config.memory_ttl, config.sweep_interval
    );
    Arc::new(MemoryCache::new(config.memory_ttl, config.sweep_interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Redis".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Redis);
        assert_eq!("local".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Memory);
        assert!("memcached".parse::<CacheBackendKind>().is_err());
    }

    #[test]
    fn test_default_ttls() {
        let config = CacheConfig::default();
        assert_eq!(config.redis_ttl, Duration::from_secs(1800));
        assert_eq!(config.memory_ttl, Duration::from_secs(7200));
        assert_eq!(config.sweep_interval, Duration::from_secs(900));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_factory_defaults_to_memory() {
        let cache = build_cache(&CacheConfig::default()).await;
        assert_eq!(cache.backend(), CacheBackendKind::Memory);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_factory_falls_back_without_url() {
        let config = CacheConfig {
            backend: CacheBackendKind::Redis,
            ..Default::default()
        };
        let cache = build_cache(&config).await;
        assert_eq!(cache.backend(), CacheBackendKind::Memory);
        cache.shutdown().await;
    }
}
