//! Field visibility resolution
//!
//! A user's visibility of a field is the least restrictive override among
//! the roles they hold (`default` > `readonly` > `hidden`). Fields no role
//! overrides fall back to the catalog default. Fields unknown to both are
//! treated as `default`.

use crate::error::Result;
use crate::models::{FieldPermission, RoleFieldPermission};
use crate::store::FieldPermissionStore;
use crate::types::{FieldVisibility, RoleId, TenantId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Resolved visibility of every known field of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldPermissionMap {
    fields: BTreeMap<String, FieldVisibility>,
}

impl FieldPermissionMap {
    /// Merge role overrides with the catalog defaults
    pub fn resolve(catalog: &[FieldPermission], overrides: &[RoleFieldPermission]) -> Self {
        let mut merged: BTreeMap<String, FieldVisibility> = BTreeMap::new();
        for entry in overrides {
            merged
                .entry(entry.field_name.clone())
                .and_modify(|current| *current = current.least_restrictive(entry.permission_type))
                .or_insert(entry.permission_type);
        }

        for field in catalog.iter().filter(|f| f.is_active) {
            merged.entry(field.field_name.clone()).or_insert(field.default_value);
        }

        Self { fields: merged }
    }

    /// Resolved visibility; fields absent from the map are `default`
    pub fn get(&self, field: &str) -> FieldVisibility {
        self.fields.get(field).copied().unwrap_or(FieldVisibility::Default)
    }

    /// Whether `requested` access to `field` is allowed
    pub fn permits(&self, field: &str, requested: FieldVisibility) -> bool {
        self.get(field).permits(requested)
    }

    /// Fields resolved to `hidden`
    pub fn hidden_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, v)| **v == FieldVisibility::Hidden)
            .map(|(k, _)| k.as_str())
    }

    /// Remove hidden fields from a JSON object, or from every object of an
    /// array. Other values are left untouched.
    pub fn redact(&self, value: &mut Value) {
        match value {
            Value::Object(object) => {
                for field in self.hidden_fields() {
                    object.remove(field);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::Object(object) = item {
                        for field in self.hidden_fields() {
                            object.remove(field);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldVisibility)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Loads overrides and catalog defaults for a set of roles
pub struct FieldVisibilityResolver {
    store: Arc<dyn FieldPermissionStore>,
}

impl FieldVisibilityResolver {
    pub fn new(store: Arc<dyn FieldPermissionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn FieldPermissionStore> {
        &self.store
    }

    /// Resolve a table's field map for the given roles. Only overrides set in
    /// `tenant` or the system tenant are considered.
    pub async fn resolve(
        &self,
        tenant: TenantId,
        role_ids: &[RoleId],
        entity_table: &str,
    ) -> Result<FieldPermissionMap> {
        let overrides: Vec<RoleFieldPermission> = if role_ids.is_empty() {
            Vec::new()
        } else {
            self.store
                .role_field_overrides(role_ids, entity_table)
                .await?
                .into_iter()
                .filter(|o| o.tenant_id == tenant || o.tenant_id.is_system())
                .collect()
        };
        let catalog = self.store.field_catalog(entity_table).await?;

        debug!(
            "Resolving fields of {} from {} overrides and {} defaults",
            entity_table,
            overrides.len(),
            catalog.len()
        );
        Ok(FieldPermissionMap::resolve(&catalog, &overrides))
    }
}
