//! # Warden Authorization Engine
//!
//! Multi-tenant role and permission resolution with a cache-aside layer.
//!
//! ## Features
//!
//! - **Two tenancy scopes**: platform-wide system roles (tenant `0`) and
//!   per-tenant roles
//! - **Hierarchical catalog** rendered as permission and menu trees
//! - **Field visibility** merged from role overrides and catalog defaults
//! - **API authorization** from request path and method
//! - **Dual cache backends**: Redis or an in-process `DashMap` with a
//!   background expiry sweep, picked at startup
//! - **PostgreSQL store** behind the `postgres` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use warden_authz::{
//!     AuthzEngine, EngineConfig, InMemoryStore, Permission, PermissionScope,
//!     PermissionType, Role, RoleType, TenantId, UserId, UserRole,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryStore::builder()
//!         .permissions(vec![
//!             Permission::new(0, "user_list_api", PermissionType::Api, PermissionScope::Tenant)
//!                 .with_endpoint("/api/v1/users", "GET"),
//!         ])
//!         .user(UserId(1), TenantId(7))
//!         .role(Role::new(10, TenantId(7), "viewer", RoleType::Custom))
//!         .grant(UserRole::new(UserId(1), 10, TenantId(7)))
//!         .role_permission(10, "user_list_api")
//!         .build()?;
//!
//!     let engine = AuthzEngine::from_store(EngineConfig::default(), store).await?;
//!
//!     if engine
//!         .check_user_api_permission(UserId(1), TenantId(7), "/api/v1/users", "GET")
//!         .await?
//!     {
//!         println!("Access granted!");
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod fields;
pub mod models;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cache::{build_cache, CacheBackendKind, CacheConfig, CacheStats, MemoryCache, PermissionCache, RedisCache};
pub use engine::{AuthzEngine, EngineConfig, EngineMetrics};
pub use error::{AuthzError, Result};
pub use fields::{FieldPermissionMap, FieldVisibilityResolver};
pub use models::{
    FieldPermission, MenuAttrs, MenuNode, NewPermission, Permission, PermissionFilter, PermissionNode,
    PermissionUpdate, Role, RoleFieldPermission, RoleGrant, RolePermission, UserRole,
};
pub use store::{FieldPermissionStore, InMemoryStore, PermissionStore, TenantDirectory};
pub use types::{
    ExternalTenantId, FieldVisibility, PermissionId, PermissionScope, PermissionType, RoleId, RoleType,
    TenantId, UserId,
};

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
