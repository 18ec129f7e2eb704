//! Store traits for the relational collaborators, plus an in-memory store

use crate::catalog::{validate_catalog, validate_permission};
use crate::error::{AuthzError, Result};
use crate::models::{
    FieldPermission, NewPermission, Permission, PermissionFilter, Role, RoleFieldPermission,
    RoleGrant, RolePermission, UserRole,
};
use crate::types::{PermissionId, RoleId, TenantId, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Permission catalog, roles and their join records
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Home tenant of a user
    async fn user_tenant(&self, user: UserId) -> Result<TenantId>;

    /// Grants the user holds in `tenant` or in the system tenant, joined with
    /// their roles. Inactive and expired grants are included; the engine
    /// filters them.
    async fn user_role_grants(&self, user: UserId, tenant: TenantId) -> Result<Vec<RoleGrant>>;

    /// Permissions linked to any of the given roles, without duplicates
    async fn permissions_for_roles(&self, role_ids: &[RoleId]) -> Result<Vec<Permission>>;

    /// List catalog entries, ordered by `sort_order` then `code`
    async fn list_permissions(&self, filter: &PermissionFilter) -> Result<Vec<Permission>>;

    /// Get a permission by code
    async fn get_permission(&self, code: &str) -> Result<Option<Permission>>;

    /// Active API permissions registered for an HTTP method
    async fn api_permissions(&self, method: &str) -> Result<Vec<Permission>>;

    /// Store a new permission and return it with its assigned id
    async fn insert_permission(&self, permission: NewPermission) -> Result<Permission>;

    /// Overwrite a permission, matched by id
    async fn update_permission(&self, permission: &Permission) -> Result<()>;

    /// Delete a permission and its role links
    async fn delete_permission(&self, code: &str) -> Result<()>;

    /// Get a role by id
    async fn get_role(&self, role_id: RoleId) -> Result<Option<Role>>;

    /// Roles linked to a permission
    async fn roles_with_permission(&self, permission_id: PermissionId) -> Result<Vec<RoleId>>;

    /// `(grant tenant, user)` pairs of every grant referencing the roles
    async fn role_holders(&self, role_ids: &[RoleId]) -> Result<Vec<(TenantId, UserId)>>;

    /// Insert a grant, or refresh the existing grant of the same
    /// `(user, role, tenant)`
    async fn upsert_user_role(&self, grant: UserRole) -> Result<()>;

    /// Flip a grant's active flag. Returns `false` if the grant does not exist.
    async fn set_user_role_active(
        &self,
        user: UserId,
        tenant: TenantId,
        role_id: RoleId,
        active: bool,
    ) -> Result<bool>;

    /// Link a permission to a role. Returns `false` if the pair already exists.
    async fn insert_role_permission(&self, link: RolePermission) -> Result<bool>;

    /// Unlink a permission from a role. Returns `false` if there was no link.
    async fn delete_role_permission(&self, link: RolePermission) -> Result<bool>;
}

/// Field-level visibility catalog and role overrides
#[async_trait]
pub trait FieldPermissionStore: Send + Sync {
    /// Active catalog defaults for a table
    async fn field_catalog(&self, entity_table: &str) -> Result<Vec<FieldPermission>>;

    /// Overrides set for any of the roles on a table
    async fn role_field_overrides(
        &self,
        role_ids: &[RoleId],
        entity_table: &str,
    ) -> Result<Vec<RoleFieldPermission>>;

    /// Insert or replace an override keyed by `(tenant, role, table, field)`
    async fn upsert_role_field_override(&self, entry: RoleFieldPermission) -> Result<()>;
}

/// Translates public tenant UUIDs to canonical tenant ids
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_by_uuid(&self, uuid: Uuid) -> Result<TenantId>;
}

#[derive(Debug, Default)]
struct MemoryState {
    permissions: Vec<Permission>,
    next_permission_id: PermissionId,
    users: HashMap<UserId, TenantId>,
    roles: HashMap<RoleId, Role>,
    user_roles: Vec<UserRole>,
    role_permissions: HashSet<RolePermission>,
    fields: Vec<FieldPermission>,
    field_overrides: Vec<RoleFieldPermission>,
    tenants: HashMap<Uuid, TenantId>,
}

impl MemoryState {
    fn permission_by_code(&self, code: &str) -> Option<&Permission> {
        self.permissions.iter().find(|p| p.code == code)
    }
}

/// In-memory implementation of every store trait
///
/// Backs tests, benches and single-process deployments seeded from a
/// static catalog.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Start seeding a store
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }
}

/// Synchronous seeding for [`InMemoryStore`]
#[derive(Default)]
pub struct InMemoryStoreBuilder {
    state: MemoryState,
    links: Vec<(RoleId, String)>,
}

impl InMemoryStoreBuilder {
    pub fn permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.state.permissions.extend(permissions);
        self
    }

    pub fn user(mut self, user: UserId, tenant: TenantId) -> Self {
        self.state.users.insert(user, tenant);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.state.roles.insert(role.id, role);
        self
    }

    pub fn grant(mut self, grant: UserRole) -> Self {
        self.state.user_roles.push(grant);
        self
    }

    /// Link a role to a permission by code; resolved in [`Self::build`]
    pub fn role_permission(mut self, role_id: RoleId, code: impl Into<String>) -> Self {
        self.links.push((role_id, code.into()));
        self
    }

    pub fn field(mut self, field: FieldPermission) -> Self {
        self.state.fields.push(field);
        self
    }

    pub fn field_override(mut self, entry: RoleFieldPermission) -> Self {
        self.state.field_overrides.push(entry);
        self
    }

    pub fn tenant_uuid(mut self, uuid: Uuid, tenant: TenantId) -> Self {
        self.state.tenants.insert(uuid, tenant);
        self
    }

    /// Validate the seeded catalog and references, then build the store.
    ///
    /// Permissions seeded with id `0` are assigned sequential ids.
    pub fn build(mut self) -> Result<InMemoryStore> {
        validate_catalog(&self.state.permissions)?;

        let mut next_id = self.state.permissions.iter().map(|p| p.id).max().unwrap_or(0);
        for permission in self.state.permissions.iter_mut().filter(|p| p.id == 0) {
            next_id += 1;
            permission.id = next_id;
        }
        self.state.next_permission_id = next_id;

        for (role_id, code) in self.links {
            if !self.state.roles.contains_key(&role_id) {
                return Err(AuthzError::not_found("role", role_id));
            }
            let permission = self
                .state
                .permission_by_code(&code)
                .ok_or_else(|| AuthzError::not_found("permission", &code))?;
            let link = RolePermission {
                role_id,
                permission_id: permission.id,
            };
            self.state.role_permissions.insert(link);
        }

        for grant in &self.state.user_roles {
            if !self.state.roles.contains_key(&grant.role_id) {
                return Err(AuthzError::not_found("role", grant.role_id));
            }
        }

        Ok(InMemoryStore {
            state: Arc::new(RwLock::new(self.state)),
        })
    }
}

fn sort_catalog(permissions: &mut [Permission]) {
    permissions.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.code.cmp(&b.code)));
}

#[async_trait]
impl PermissionStore for InMemoryStore {
    async fn user_tenant(&self, user: UserId) -> Result<TenantId> {
        let state = self.state.read().await;
        state
            .users
            .get(&user)
            .copied()
            .ok_or_else(|| AuthzError::not_found("user", user))
    }

    async fn user_role_grants(&self, user: UserId, tenant: TenantId) -> Result<Vec<RoleGrant>> {
        let state = self.state.read().await;
        let grants = state
            .user_roles
            .iter()
            .filter(|g| g.user_id == user && (g.tenant_id == tenant || g.tenant_id.is_system()))
            .filter_map(|g| {
                state.roles.get(&g.role_id).map(|role| RoleGrant {
                    grant: g.clone(),
                    role: role.clone(),
                })
            })
            .collect();
        Ok(grants)
    }

    async fn permissions_for_roles(&self, role_ids: &[RoleId]) -> Result<Vec<Permission>> {
        let state = self.state.read().await;
        let ids: HashSet<PermissionId> = state
            .role_permissions
            .iter()
            .filter(|link| role_ids.contains(&link.role_id))
            .map(|link| link.permission_id)
            .collect();

        let mut permissions: Vec<Permission> = state
            .permissions
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect();
        sort_catalog(&mut permissions);
        Ok(permissions)
    }

    async fn list_permissions(&self, filter: &PermissionFilter) -> Result<Vec<Permission>> {
        let state = self.state.read().await;
        let mut permissions: Vec<Permission> = state
            .permissions
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        sort_catalog(&mut permissions);
        Ok(permissions)
    }

    async fn get_permission(&self, code: &str) -> Result<Option<Permission>> {
        let state = self.state.read().await;
        Ok(state.permission_by_code(code).cloned())
    }

    async fn api_permissions(&self, method: &str) -> Result<Vec<Permission>> {
        let state = self.state.read().await;
        let permissions = state
            .permissions
            .iter()
            .filter(|p| {
                p.is_active
                    && p.resource_path.is_some()
                    && p.method.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(method))
            })
            .cloned()
            .collect();
        Ok(permissions)
    }

    async fn insert_permission(&self, permission: NewPermission) -> Result<Permission> {
        let mut state = self.state.write().await;
        if state.permission_by_code(&permission.code).is_some() {
            return Err(AuthzError::InvalidInput(format!(
                "duplicate permission code '{}'",
                permission.code
            )));
        }

        state.next_permission_id += 1;
        let permission = permission.into_permission(state.next_permission_id);
        validate_permission(&permission)?;
        state.permissions.push(permission.clone());
        Ok(permission)
    }

    async fn update_permission(&self, permission: &Permission) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .permissions
            .iter_mut()
            .find(|p| p.id == permission.id)
            .ok_or_else(|| AuthzError::not_found("permission", &permission.code))?;
        *slot = permission.clone();
        Ok(())
    }

    async fn delete_permission(&self, code: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let id = state
            .permission_by_code(code)
            .map(|p| p.id)
            .ok_or_else(|| AuthzError::not_found("permission", code))?;
        state.permissions.retain(|p| p.id != id);
        state.role_permissions.retain(|link| link.permission_id != id);
        Ok(())
    }

    async fn get_role(&self, role_id: RoleId) -> Result<Option<Role>> {
        let state = self.state.read().await;
        Ok(state.roles.get(&role_id).cloned())
    }

    async fn roles_with_permission(&self, permission_id: PermissionId) -> Result<Vec<RoleId>> {
        let state = self.state.read().await;
        Ok(state
            .role_permissions
            .iter()
            .filter(|link| link.permission_id == permission_id)
            .map(|link| link.role_id)
            .collect())
    }

    async fn role_holders(&self, role_ids: &[RoleId]) -> Result<Vec<(TenantId, UserId)>> {
        let state = self.state.read().await;
        let holders: HashSet<(TenantId, UserId)> = state
            .user_roles
            .iter()
            .filter(|g| role_ids.contains(&g.role_id))
            .map(|g| (g.tenant_id, g.user_id))
            .collect();
        Ok(holders.into_iter().collect())
    }

    async fn upsert_user_role(&self, grant: UserRole) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.roles.contains_key(&grant.role_id) {
            return Err(AuthzError::not_found("role", grant.role_id));
        }

        match state.user_roles.iter_mut().find(|g| {
            g.user_id == grant.user_id && g.role_id == grant.role_id && g.tenant_id == grant.tenant_id
        }) {
            Some(existing) => *existing = grant,
            None => state.user_roles.push(grant),
        }
        Ok(())
    }

    async fn set_user_role_active(
        &self,
        user: UserId,
        tenant: TenantId,
        role_id: RoleId,
        active: bool,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state
            .user_roles
            .iter_mut()
            .find(|g| g.user_id == user && g.role_id == role_id && g.tenant_id == tenant)
        {
            Some(grant) => {
                grant.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_role_permission(&self, link: RolePermission) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.role_permissions.insert(link))
    }

    async fn delete_role_permission(&self, link: RolePermission) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.role_permissions.remove(&link))
    }
}

#[async_trait]
impl FieldPermissionStore for InMemoryStore {
    async fn field_catalog(&self, entity_table: &str) -> Result<Vec<FieldPermission>> {
        let state = self.state.read().await;
        let mut fields: Vec<FieldPermission> = state
            .fields
            .iter()
            .filter(|f| f.is_active && f.entity_table == entity_table)
            .cloned()
            .collect();
        fields.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.field_name.cmp(&b.field_name)));
        Ok(fields)
    }

    async fn role_field_overrides(
        &self,
        role_ids: &[RoleId],
        entity_table: &str,
    ) -> Result<Vec<RoleFieldPermission>> {
        let state = self.state.read().await;
        Ok(state
            .field_overrides
            .iter()
            .filter(|o| o.entity_table == entity_table && role_ids.contains(&o.role_id))
            .cloned()
            .collect())
    }

    async fn upsert_role_field_override(&self, entry: RoleFieldPermission) -> Result<()> {
        let mut state = self.state.write().await;
        match state.field_overrides.iter_mut().find(|o| {
            o.tenant_id == entry.tenant_id
                && o.role_id == entry.role_id
                && o.entity_table == entry.entity_table
                && o.field_name == entry.field_name
        }) {
            Some(existing) => existing.permission_type = entry.permission_type,
            None => state.field_overrides.push(entry),
        }
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for InMemoryStore {
    async fn tenant_by_uuid(&self, uuid: Uuid) -> Result<TenantId> {
        let state = self.state.read().await;
        state
            .tenants
            .get(&uuid)
            .copied()
            .ok_or_else(|| AuthzError::not_found("tenant", uuid))
    }
}
