//! Authorization resolver
//!
//! Answers permission, role, menu and field questions for a `(tenant, user)`
//! pair with cache-aside reads over the stores, and keeps the cache coherent
//! across administrative mutations.

pub mod metrics;
pub mod path;
pub mod tree;

pub use metrics::{EngineMetrics, MetricsCollector};
pub use path::{template_matches, PathInference, DEFAULT_API_PREFIX};
pub use tree::{build_menu_tree, build_permission_tree};

use crate::cache::{build_cache, CacheBackendKind, CacheConfig, CacheStats, PermissionCache};
use crate::catalog::validate_permission;
use crate::error::{AuthzError, Result};
use crate::fields::{FieldPermissionMap, FieldVisibilityResolver};
use crate::models::{
    MenuNode, NewPermission, Permission, PermissionFilter, PermissionNode, PermissionUpdate, Role,
    RoleFieldPermission, RoleGrant, RolePermission, UserRole, SYSTEM_ADMIN_ROLE, TENANT_ADMIN_ROLE,
};
use crate::store::{FieldPermissionStore, PermissionStore, TenantDirectory};
use crate::types::{
    numeric_tenant, parse_numeric_tenant, ExternalTenantId, PermissionScope, RoleId, RoleType,
    TenantId, UserId,
};

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Upper bound on parent links followed when checking for cycles
const MAX_TREE_DEPTH: usize = 64;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cache backend selection and TTLs
    pub cache: CacheConfig,

    /// Regex matched at the start of request paths before code inference
    pub api_prefix: String,

    /// Enable metrics collection
    pub enable_metrics: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            enable_metrics: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, see [`CacheConfig::from_env`].
    /// `AUTHZ_API_PREFIX` and `AUTHZ_ENABLE_METRICS` cover the rest.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache: CacheConfig::from_env(),
            api_prefix: std::env::var("AUTHZ_API_PREFIX").unwrap_or(defaults.api_prefix),
            enable_metrics: std::env::var("AUTHZ_ENABLE_METRICS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.enable_metrics),
        }
    }
}

/// Authorization resolver
///
/// # Architecture
///
/// ```text
/// check_* ──> get_user_permissions ──> get_user_roles ──> PermissionStore
///                 │                        │
///                 └──── PermissionCache ───┘   (memory or redis)
///
/// admin mutations ──> stores ──> invalidate affected (tenant, user) entries
/// ```
///
/// Cache failures never reach callers; store failures always do.
pub struct AuthzEngine {
    store: Arc<dyn PermissionStore>,
    fields: FieldVisibilityResolver,
    directory: Arc<dyn TenantDirectory>,
    cache: Arc<dyn PermissionCache>,
    paths: PathInference,
    metrics: Option<Arc<MetricsCollector>>,
    config: EngineConfig,
}

impl AuthzEngine {
    /// Create an engine, starting the cache backend chosen by
    /// [`build_cache`].
    pub async fn new(
        config: EngineConfig,
        store: Arc<dyn PermissionStore>,
        field_store: Arc<dyn FieldPermissionStore>,
        directory: Arc<dyn TenantDirectory>,
    ) -> Result<Self> {
        let cache = build_cache(&config.cache).await;
        Self::with_cache(config, store, field_store, directory, cache)
    }

    /// Create an engine over a single value implementing every store trait
    pub async fn from_store<S>(config: EngineConfig, store: S) -> Result<Self>
    where
        S: PermissionStore + FieldPermissionStore + TenantDirectory + 'static,
    {
        let store = Arc::new(store);
        Self::new(config, store.clone(), store.clone(), store).await
    }

    /// Create an engine with an already constructed cache
    pub fn with_cache(
        config: EngineConfig,
        store: Arc<dyn PermissionStore>,
        field_store: Arc<dyn FieldPermissionStore>,
        directory: Arc<dyn TenantDirectory>,
        cache: Arc<dyn PermissionCache>,
    ) -> Result<Self> {
        let paths = PathInference::new(&config.api_prefix)?;
        let metrics = config.enable_metrics.then(|| Arc::new(MetricsCollector::new()));

        info!(
            "AuthzEngine initialized with cache={}, metrics={}",
            cache.backend(),
            config.enable_metrics
        );

        Ok(Self {
            store,
            fields: FieldVisibilityResolver::new(field_store),
            directory,
            cache,
            paths,
            metrics,
            config,
        })
    }

    /// Translate an external tenant identifier to the canonical id
    pub async fn resolve_tenant(&self, id: &ExternalTenantId) -> Result<TenantId> {
        match id {
            ExternalTenantId::Numeric(n) => numeric_tenant(*n),
            ExternalTenantId::Uuid(uuid) => self.observe(self.directory.tenant_by_uuid(*uuid).await),
            ExternalTenantId::Text(raw) => match Uuid::parse_str(raw.trim()) {
                Ok(uuid) => self.observe(self.directory.tenant_by_uuid(uuid).await),
                Err(_) => parse_numeric_tenant(raw),
            },
        }
    }

    /// Active roles of a user in a tenant, system-tenant roles included.
    /// Unknown users are `NotFound`.
    pub async fn get_user_roles(&self, user: UserId, tenant: TenantId) -> Result<Vec<Role>> {
        let grants = self.effective_grants(user, tenant).await?;
        Ok(grants.into_iter().map(|g| g.role).collect())
    }

    /// Union of the active permissions attached to the user's active roles.
    ///
    /// The cached set stops being served when the first grant it was built
    /// from expires.
    pub async fn get_user_permissions(&self, user: UserId, tenant: TenantId) -> Result<Vec<Permission>> {
        if let Some(permissions) = self.cache.get_user_permissions(tenant, user).await {
            self.record_cache(true);
            return Ok(permissions);
        }
        self.record_cache(false);

        let grants = self.effective_grants(user, tenant).await?;
        let valid_until = grants.iter().filter_map(|g| g.grant.expires_at).min();

        let permissions = if grants.is_empty() {
            Vec::new()
        } else {
            let role_ids: Vec<RoleId> = grants.iter().map(|g| g.role.id).collect();
            let mut seen = HashSet::new();
            self.observe(self.store.permissions_for_roles(&role_ids).await)?
                .into_iter()
                .filter(|p| p.is_active)
                .filter(|p| seen.insert(p.code.clone()))
                .collect()
        };

        debug!(
            "Resolved {} permissions for user {} in tenant {}",
            permissions.len(),
            user,
            tenant
        );
        self.cache
            .set_user_permissions(tenant, user, &permissions, valid_until)
            .await;
        Ok(permissions)
    }

    /// Grants currently in force, one per role, ordered by role id.
    ///
    /// The cache holds the grants rather than bare roles so that expiry is
    /// re-checked on every read.
    async fn effective_grants(&self, user: UserId, tenant: TenantId) -> Result<Vec<RoleGrant>> {
        let grants = match self.cache.get_user_roles(tenant, user).await {
            Some(grants) => {
                self.record_cache(true);
                grants
            }
            None => {
                self.record_cache(false);
                let grants = self.load_grants(user, tenant).await?;
                self.cache.set_user_roles(tenant, user, &grants).await;
                grants
            }
        };

        let now = Utc::now();
        Ok(grants.into_iter().filter(|g| g.grant.is_effective(now)).collect())
    }

    async fn load_grants(&self, user: UserId, tenant: TenantId) -> Result<Vec<RoleGrant>> {
        // An unknown user is an error, not an empty grant list
        self.observe(self.store.user_tenant(user).await)?;
        let grants = self.observe(self.store.user_role_grants(user, tenant).await)?;
        let now = Utc::now();

        let mut seen = HashSet::new();
        let mut grants: Vec<RoleGrant> = grants
            .into_iter()
            .filter(|g| {
                g.grant.is_effective(now)
                    && g.role.is_active
                    && (g.role.tenant_id == tenant || g.role.tenant_id.is_system())
            })
            .filter(|g| seen.insert(g.role.id))
            .collect();
        grants.sort_by_key(|g| g.role.id);

        debug!("Resolved {} roles for user {} in tenant {}", grants.len(), user, tenant);
        Ok(grants)
    }

    /// Whether `code` is in the user's resolved permission set
    pub async fn check_user_permission(&self, user: UserId, tenant: TenantId, code: &str) -> Result<bool> {
        let start = Instant::now();
        let permissions = self.get_user_permissions(user, tenant).await?;
        let allowed = permissions.iter().any(|p| p.code == code);

        debug!("Permission check user={} tenant={} code={} allowed={}", user, tenant, code, allowed);
        self.record_check(allowed, start);
        Ok(allowed)
    }

    /// Authorize an HTTP request.
    ///
    /// Candidates are the active API permissions whose stored route template
    /// and method match the request. Access is granted when any candidate is
    /// in the user's resolved set. A request no stored route matches is
    /// denied without resolving the user.
    pub async fn check_user_api_permission(
        &self,
        user: UserId,
        tenant: TenantId,
        path: &str,
        method: &str,
    ) -> Result<bool> {
        let start = Instant::now();

        let candidates: Vec<Permission> = self
            .observe(self.store.api_permissions(method).await)?
            .into_iter()
            .filter(|p| p.is_active)
            .filter(|p| p.resource_path.as_deref().is_some_and(|t| template_matches(t, path)))
            .collect();

        if candidates.is_empty() {
            debug!(
                "No route registered for {} {} (inferred {}), denying",
                method,
                path,
                self.paths.infer_code(path, method)
            );
            self.record_check(false, start);
            return Ok(false);
        }

        let permissions = self.get_user_permissions(user, tenant).await?;
        let allowed = candidates
            .iter()
            .any(|candidate| permissions.iter().any(|p| p.code == candidate.code));

        debug!(
            "API check user={} tenant={} {} {} candidates={} allowed={}",
            user,
            tenant,
            method,
            path,
            candidates.len(),
            allowed
        );
        self.record_check(allowed, start);
        Ok(allowed)
    }

    /// Conventional permission code for a request, e.g.
    /// `POST /api/v1/roles/:id/permissions` gives
    /// `roles_permissions_create_api`. Used when registering routes; never
    /// consulted by [`Self::check_user_api_permission`].
    pub fn infer_permission_code(&self, path: &str, method: &str) -> String {
        self.paths.infer_code(path, method)
    }

    /// Platform administrator: home tenant `0` and an active `system_admin`
    /// role of type `system`
    pub async fn is_system_admin(&self, user: UserId) -> Result<bool> {
        let start = Instant::now();
        let home = self.observe(self.store.user_tenant(user).await)?;
        if !home.is_system() {
            self.record_check(false, start);
            return Ok(false);
        }

        let roles = self.get_user_roles(user, TenantId::SYSTEM).await?;
        let allowed = roles.iter().any(|r| {
            r.code == SYSTEM_ADMIN_ROLE && r.role_type == RoleType::System && r.tenant_id.is_system()
        });

        self.record_check(allowed, start);
        Ok(allowed)
    }

    /// System administrator, or holder of `tenant_admin` in `tenant`
    pub async fn is_tenant_admin(&self, user: UserId, tenant: TenantId) -> Result<bool> {
        if self.is_system_admin(user).await? {
            return Ok(true);
        }

        let start = Instant::now();
        let roles = self.get_user_roles(user, tenant).await?;
        let allowed = roles
            .iter()
            .any(|r| r.code == TENANT_ADMIN_ROLE && r.tenant_id == tenant);

        self.record_check(allowed, start);
        Ok(allowed)
    }

    /// Permission forest of the active catalog.
    ///
    /// Unless `caller` is a system administrator acting in the system tenant,
    /// the scope is narrowed to `tenant`.
    pub async fn get_permission_tree(
        &self,
        caller: UserId,
        tenant: TenantId,
        scope: Option<PermissionScope>,
    ) -> Result<Vec<PermissionNode>> {
        let privileged = tenant.is_system() && self.is_system_admin(caller).await?;
        let scope = if privileged { scope } else { Some(PermissionScope::Tenant) };

        let filter = PermissionFilter {
            scope,
            active_only: true,
            ..Default::default()
        };
        let permissions = self.observe(self.store.list_permissions(&filter).await)?;
        Ok(build_permission_tree(&permissions))
    }

    /// Navigation menu built from the user's resolved menu permissions
    pub async fn get_user_menu_tree(&self, user: UserId, tenant: TenantId) -> Result<Vec<MenuNode>> {
        let permissions = self.get_user_permissions(user, tenant).await?;
        Ok(build_menu_tree(&permissions))
    }

    /// Resolved field visibility of `entity_table` for the user
    pub async fn get_user_field_permissions(
        &self,
        user: UserId,
        tenant: TenantId,
        entity_table: &str,
    ) -> Result<FieldPermissionMap> {
        let roles = self.get_user_roles(user, tenant).await?;
        let role_ids: Vec<RoleId> = roles.iter().map(|r| r.id).collect();
        self.observe(self.fields.resolve(tenant, &role_ids, entity_table).await)
    }

    /// List catalog entries
    pub async fn list_permissions(&self, filter: &PermissionFilter) -> Result<Vec<Permission>> {
        self.observe(self.store.list_permissions(filter).await)
    }

    /// Add a catalog entry. The parent, if any, must exist.
    pub async fn create_permission(&self, permission: NewPermission) -> Result<Permission> {
        validate_permission(&permission.clone().into_permission(0))?;
        self.ensure_parent(&permission.code, &permission.parent_code).await?;

        let created = self.observe(self.store.insert_permission(permission).await)?;
        info!("Created permission {} (id={})", created.code, created.id);
        Ok(created)
    }

    /// Apply a partial update and invalidate every holder of the permission
    pub async fn update_permission(&self, code: &str, update: PermissionUpdate) -> Result<Permission> {
        let mut permission = self
            .observe(self.store.get_permission(code).await)?
            .ok_or_else(|| AuthzError::not_found("permission", code))?;

        update.apply(&mut permission);
        validate_permission(&permission)?;
        self.ensure_parent(&permission.code, &permission.parent_code).await?;

        self.observe(self.store.update_permission(&permission).await)?;
        let role_ids = self.observe(self.store.roles_with_permission(permission.id).await)?;
        let invalidated = self.invalidate_role_holders(&role_ids).await?;

        info!("Updated permission {} ({} users invalidated)", code, invalidated);
        Ok(permission)
    }

    /// Delete a catalog entry. Builtin entries and entries with children are
    /// rejected.
    pub async fn delete_permission(&self, code: &str) -> Result<()> {
        let permission = self
            .observe(self.store.get_permission(code).await)?
            .ok_or_else(|| AuthzError::not_found("permission", code))?;

        if permission.is_builtin {
            return Err(AuthzError::BuiltinPermission(code.to_string()));
        }

        let catalog = self
            .observe(self.store.list_permissions(&PermissionFilter::default()).await)?;
        if let Some(child) = catalog.iter().find(|p| p.parent_code == code) {
            return Err(AuthzError::InvalidInput(format!(
                "permission '{}' still has child '{}'",
                code, child.code
            )));
        }

        let role_ids = self.observe(self.store.roles_with_permission(permission.id).await)?;
        self.observe(self.store.delete_permission(code).await)?;
        let invalidated = self.invalidate_role_holders(&role_ids).await?;

        info!("Deleted permission {} ({} users invalidated)", code, invalidated);
        Ok(())
    }

    /// Grant a role within the role's own tenant, or refresh an existing grant
    pub async fn assign_role(&self, grant: UserRole) -> Result<()> {
        let role = self.require_role(grant.role_id).await?;
        if role.tenant_id != grant.tenant_id {
            return Err(AuthzError::InvalidInput(format!(
                "role '{}' belongs to tenant {}, not {}",
                role.code, role.tenant_id, grant.tenant_id
            )));
        }
        self.observe(self.store.user_tenant(grant.user_id).await)?;

        let (user, tenant) = (grant.user_id, grant.tenant_id);
        self.observe(self.store.upsert_user_role(grant).await)?;
        self.invalidate_user(tenant, user).await;

        info!("Assigned role {} to user {} in tenant {}", role.code, user, tenant);
        Ok(())
    }

    /// Deactivate a grant without deleting it
    pub async fn revoke_role(&self, user: UserId, tenant: TenantId, role_id: RoleId) -> Result<()> {
        let found = self
            .observe(self.store.set_user_role_active(user, tenant, role_id, false).await)?;
        if !found {
            return Err(AuthzError::not_found(
                "role grant",
                format!("user={} tenant={} role={}", user, tenant, role_id),
            ));
        }

        self.invalidate_user(tenant, user).await;
        info!("Revoked role {} from user {} in tenant {}", role_id, user, tenant);
        Ok(())
    }

    /// Link a permission to a role
    pub async fn grant_role_permission(&self, role_id: RoleId, code: &str) -> Result<()> {
        let link = self.role_link(role_id, code).await?;
        let inserted = self.observe(self.store.insert_role_permission(link).await)?;
        if !inserted {
            return Err(AuthzError::InvalidInput(format!(
                "role {} already has permission '{}'",
                role_id, code
            )));
        }

        let invalidated = self.invalidate_role_holders(&[role_id]).await?;
        info!("Granted {} to role {} ({} users invalidated)", code, role_id, invalidated);
        Ok(())
    }

    /// Unlink a permission from a role
    pub async fn revoke_role_permission(&self, role_id: RoleId, code: &str) -> Result<()> {
        let link = self.role_link(role_id, code).await?;
        let removed = self.observe(self.store.delete_role_permission(link).await)?;
        if !removed {
            return Err(AuthzError::not_found(
                "role permission",
                format!("role={} permission={}", role_id, code),
            ));
        }

        let invalidated = self.invalidate_role_holders(&[role_id]).await?;
        info!("Revoked {} from role {} ({} users invalidated)", code, role_id, invalidated);
        Ok(())
    }

    /// Set a role's visibility override of one field. Field maps are not
    /// cached, so no invalidation is needed.
    pub async fn set_role_field_permission(&self, entry: RoleFieldPermission) -> Result<()> {
        let role = self.require_role(entry.role_id).await?;
        if role.tenant_id != entry.tenant_id && !role.tenant_id.is_system() {
            return Err(AuthzError::InvalidInput(format!(
                "role '{}' belongs to tenant {}, not {}",
                role.code, role.tenant_id, entry.tenant_id
            )));
        }
        if entry.entity_table.is_empty() || entry.field_name.is_empty() {
            return Err(AuthzError::InvalidInput("field override needs a table and a field".to_string()));
        }

        info!(
            "Setting {}.{} to {} for role {}",
            entry.entity_table, entry.field_name, entry.permission_type, role.code
        );
        self.observe(self.fields.store().upsert_role_field_override(entry).await)
    }

    /// Drop the cached roles and permissions of a user. Entries of a
    /// system-tenant user are dropped across all tenants, since system roles
    /// are visible everywhere.
    pub async fn invalidate_user(&self, tenant: TenantId, user: UserId) {
        if tenant.is_system() {
            self.cache.invalidate_user_everywhere(user).await;
        } else {
            self.cache.invalidate_user_permissions(tenant, user).await;
            self.cache.invalidate_user_roles(tenant, user).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_invalidations(1);
        }
        debug!("Invalidated cache of user {} in tenant {}", user, tenant);
    }

    /// Drop every cached entry of a tenant
    pub async fn invalidate_tenant(&self, tenant: TenantId) -> usize {
        let removed = self.cache.invalidate_tenant(tenant).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_invalidations(removed as u64);
        }
        info!("Flushed {} cache entries of tenant {}", removed, tenant);
        removed
    }

    /// Cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Active cache backend
    pub fn cache_backend(&self) -> CacheBackendKind {
        self.cache.backend()
    }

    /// Get engine metrics
    pub fn get_metrics(&self) -> Option<EngineMetrics> {
        self.metrics.as_ref().map(|metrics| metrics.get_metrics())
    }

    /// Metrics in Prometheus text format
    pub fn export_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(|metrics| metrics.export_prometheus())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop background work owned by the cache
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        info!("AuthzEngine shut down");
    }

    async fn require_role(&self, role_id: RoleId) -> Result<Role> {
        self.observe(self.store.get_role(role_id).await)?
            .ok_or_else(|| AuthzError::not_found("role", role_id))
    }

    async fn role_link(&self, role_id: RoleId, code: &str) -> Result<RolePermission> {
        self.require_role(role_id).await?;
        let permission = self
            .observe(self.store.get_permission(code).await)?
            .ok_or_else(|| AuthzError::not_found("permission", code))?;
        Ok(RolePermission {
            role_id,
            permission_id: permission.id,
        })
    }

    /// `parent` must be empty or an existing code whose ancestry does not
    /// contain `code`
    async fn ensure_parent(&self, code: &str, parent: &str) -> Result<()> {
        let mut current = parent.to_string();
        for _ in 0..MAX_TREE_DEPTH {
            if current.is_empty() {
                return Ok(());
            }
            if current == code {
                return Err(AuthzError::InvalidInput(format!(
                    "permission '{}' would be part of a parent cycle",
                    code
                )));
            }

            let ancestor = self
                .observe(self.store.get_permission(&current).await)?
                .ok_or_else(|| {
                    AuthzError::InvalidInput(format!(
                        "permission '{}' references unknown parent '{}'",
                        code, current
                    ))
                })?;
            current = ancestor.parent_code;
        }

        Err(AuthzError::InvalidInput(format!(
            "permission '{}' is nested deeper than {} levels",
            code, MAX_TREE_DEPTH
        )))
    }

    /// Invalidate every user holding any of the roles. Returns the number of
    /// `(tenant, user)` pairs invalidated.
    async fn invalidate_role_holders(&self, role_ids: &[RoleId]) -> Result<usize> {
        if role_ids.is_empty() {
            return Ok(0);
        }

        let holders = self.observe(self.store.role_holders(role_ids).await)?;
        join_all(holders.iter().map(|&(tenant, user)| self.invalidate_user(tenant, user))).await;
        Ok(holders.len())
    }

    /// Count store failures on their way out
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            if let Some(metrics) = &self.metrics {
                metrics.record_store_error();
            }
        }
        result
    }

    fn record_cache(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            if hit {
                metrics.record_cache_hit();
            } else {
                metrics.record_cache_miss();
            }
        }
    }

    fn record_check(&self, allowed: bool, start: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_check(allowed, start.elapsed());
        }
    }
}
