//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Invalid input (duplicate code, unknown parent, bad enum value, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Attempt to delete a builtin permission
    #[error("Builtin permission cannot be deleted: {0}")]
    BuiltinPermission(String),

    /// External tenant identifier could not be translated
    #[error("Invalid tenant identifier: {0}")]
    InvalidTenant(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthzError {
    /// Shorthand for a [`AuthzError::NotFound`]
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Whether this is a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
