//! Entity records read by the engine and the trees it renders

use crate::types::{
    FieldVisibility, PermissionId, PermissionScope, PermissionType, RoleId, RoleType, TenantId,
    UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known role code granting platform-wide administration
pub const SYSTEM_ADMIN_ROLE: &str = "system_admin";

/// Well-known role code granting administration of one tenant
pub const TENANT_ADMIN_ROLE: &str = "tenant_admin";

/// Menu presentation attributes, only meaningful for `type = menu`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuAttrs {
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub component: String,
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MenuAttrs {
    fn default() -> Self {
        Self {
            icon: String::new(),
            path: String::new(),
            component: String::new(),
            visible: true,
        }
    }
}

/// Catalog permission. Identity is `code`; `parent_code` links form a forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub permission_type: PermissionType,
    pub scope: PermissionScope,
    /// Empty for roots
    #[serde(default)]
    pub parent_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub sort_order: i32,
    pub is_active: bool,
    #[serde(default)]
    pub is_builtin: bool,
    #[serde(default)]
    pub menu: MenuAttrs,
}

impl Permission {
    /// Minimal active permission, mostly useful for seeding and tests
    pub fn new(
        id: PermissionId,
        code: impl Into<String>,
        permission_type: PermissionType,
        scope: PermissionScope,
    ) -> Self {
        let code = code.into();
        Self {
            id,
            name: code.clone(),
            code,
            description: String::new(),
            permission_type,
            scope,
            parent_code: String::new(),
            resource_path: None,
            method: None,
            module: String::new(),
            sort_order: 0,
            is_active: true,
            is_builtin: false,
            menu: MenuAttrs::default(),
        }
    }

    pub fn with_parent(mut self, parent_code: impl Into<String>) -> Self {
        self.parent_code = parent_code.into();
        self
    }

    pub fn with_endpoint(mut self, resource_path: impl Into<String>, method: impl Into<String>) -> Self {
        self.resource_path = Some(resource_path.into());
        self.method = Some(method.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn builtin(mut self) -> Self {
        self.is_builtin = true;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_code.is_empty()
    }
}

/// Input for creating a permission through the admin path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPermission {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub permission_type: PermissionType,
    pub scope: PermissionScope,
    #[serde(default)]
    pub parent_code: String,
    #[serde(default)]
    pub resource_path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub is_builtin: bool,
    #[serde(default)]
    pub menu: MenuAttrs,
}

impl NewPermission {
    pub(crate) fn into_permission(self, id: PermissionId) -> Permission {
        Permission {
            id,
            code: self.code,
            name: self.name,
            description: self.description,
            permission_type: self.permission_type,
            scope: self.scope,
            parent_code: self.parent_code,
            resource_path: self.resource_path,
            method: self.method,
            module: self.module,
            sort_order: self.sort_order,
            is_active: true,
            is_builtin: self.is_builtin,
            menu: self.menu,
        }
    }
}

/// Partial update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_code: Option<String>,
    pub resource_path: Option<String>,
    pub method: Option<String>,
    pub module: Option<String>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
    pub menu: Option<MenuAttrs>,
}

impl PermissionUpdate {
    pub(crate) fn apply(self, permission: &mut Permission) {
        if let Some(name) = self.name {
            permission.name = name;
        }
        if let Some(description) = self.description {
            permission.description = description;
        }
        if let Some(parent_code) = self.parent_code {
            permission.parent_code = parent_code;
        }
        if let Some(resource_path) = self.resource_path {
            permission.resource_path = Some(resource_path);
        }
        if let Some(method) = self.method {
            permission.method = Some(method);
        }
        if let Some(module) = self.module {
            permission.module = module;
        }
        if let Some(sort_order) = self.sort_order {
            permission.sort_order = sort_order;
        }
        if let Some(is_active) = self.is_active {
            permission.is_active = is_active;
        }
        if let Some(menu) = self.menu {
            permission.menu = menu;
        }
    }
}

/// Listing filter for the catalog
#[derive(Debug, Clone, Default)]
pub struct PermissionFilter {
    pub scope: Option<PermissionScope>,
    pub permission_type: Option<PermissionType>,
    pub module: Option<String>,
    pub active_only: bool,
}

impl PermissionFilter {
    pub fn matches(&self, permission: &Permission) -> bool {
        self.scope.map_or(true, |s| permission.scope == s)
            && self.permission_type.map_or(true, |t| permission.permission_type == t)
            && self.module.as_deref().map_or(true, |m| permission.module == m)
            && (!self.active_only || permission.is_active)
    }
}

/// Tenant-scoped role. Tenant `0` holds the system roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub tenant_id: TenantId,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub role_type: RoleType,
    pub is_active: bool,
}

impl Role {
    pub fn new(id: RoleId, tenant_id: TenantId, code: impl Into<String>, role_type: RoleType) -> Self {
        let code = code.into();
        Self {
            id,
            tenant_id,
            name: code.clone(),
            code,
            role_type,
            is_active: true,
        }
    }
}

/// Grant of a role to a user within a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub granted_by: Option<UserId>,
    pub granted_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl UserRole {
    pub fn new(user_id: UserId, role_id: RoleId, tenant_id: TenantId) -> Self {
        Self {
            user_id,
            role_id,
            tenant_id,
            granted_by: None,
            granted_at: Utc::now(),
            expires_at: None,
            is_active: true,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Active and not past its expiry
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |at| at > now)
    }
}

/// A user's grant joined with the role it refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub grant: UserRole,
    pub role: Role,
}

/// Role to permission link; the pair is unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
}

/// Catalog default visibility for one field of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPermission {
    pub entity_table: String,
    pub field_name: String,
    pub default_value: FieldVisibility,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sort_order: i32,
    pub is_active: bool,
}

impl FieldPermission {
    pub fn new(
        entity_table: impl Into<String>,
        field_name: impl Into<String>,
        default_value: FieldVisibility,
    ) -> Self {
        Self {
            entity_table: entity_table.into(),
            field_name: field_name.into(),
            default_value,
            label: String::new(),
            description: String::new(),
            sort_order: 0,
            is_active: true,
        }
    }
}

/// Role-specific override of a field's visibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleFieldPermission {
    pub tenant_id: TenantId,
    pub role_id: RoleId,
    pub entity_table: String,
    pub field_name: String,
    pub permission_type: FieldVisibility,
}

/// Node of the rendered permission forest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionNode {
    #[serde(flatten)]
    pub permission: Permission,
    pub children: Vec<PermissionNode>,
}

/// Node of a rendered navigation menu
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuNode {
    pub code: String,
    pub name: String,
    pub icon: String,
    pub path: String,
    pub component: String,
    pub visible: bool,
    pub sort_order: i32,
    pub children: Vec<MenuNode>,
}
