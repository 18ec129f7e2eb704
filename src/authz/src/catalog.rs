//! Permission catalog validation
//!
//! Runs when a catalog is seeded and before every admin mutation, so that the
//! stores only ever hold a well-formed forest.

use crate::error::{AuthzError, Result};
use crate::models::Permission;
use crate::types::PermissionType;
use std::collections::{HashMap, HashSet};

/// Check a single permission's own fields.
///
/// API permissions must carry a non-empty `resource_path` and `method`.
pub fn validate_permission(permission: &Permission) -> Result<()> {
    if permission.code.trim().is_empty() {
        return Err(AuthzError::InvalidInput("permission code cannot be empty".to_string()));
    }

    if permission.code == permission.parent_code {
        return Err(AuthzError::InvalidInput(format!(
            "permission '{}' cannot be its own parent",
            permission.code
        )));
    }

    if permission.permission_type == PermissionType::Api {
        let has_path = permission.resource_path.as_deref().is_some_and(|p| !p.trim().is_empty());
        let has_method = permission.method.as_deref().is_some_and(|m| !m.trim().is_empty());
        if !has_path || !has_method {
            return Err(AuthzError::InvalidInput(format!(
                "api permission '{}' requires resource_path and method",
                permission.code
            )));
        }
    }

    Ok(())
}

/// Validate a complete catalog: unique codes, resolvable parents, no cycles.
pub fn validate_catalog(permissions: &[Permission]) -> Result<()> {
    let mut by_code: HashMap<&str, &Permission> = HashMap::with_capacity(permissions.len());

    for permission in permissions {
        validate_permission(permission)?;
        if by_code.insert(permission.code.as_str(), permission).is_some() {
            return Err(AuthzError::InvalidInput(format!(
                "duplicate permission code '{}'",
                permission.code
            )));
        }
    }

    for permission in permissions {
        if !permission.is_root() && !by_code.contains_key(permission.parent_code.as_str()) {
            return Err(AuthzError::InvalidInput(format!(
                "permission '{}' references unknown parent '{}'",
                permission.code, permission.parent_code
            )));
        }
    }

    for permission in permissions {
        let mut seen = HashSet::new();
        let mut current = permission;
        while !current.is_root() {
            if !seen.insert(current.code.as_str()) {
                return Err(AuthzError::InvalidInput(format!(
                    "permission '{}' is part of a parent cycle",
                    permission.code
                )));
            }
            match by_code.get(current.parent_code.as_str()) {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    Ok(())
}
