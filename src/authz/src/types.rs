//! Core identifier and enumeration types

use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Role primary key
pub type RoleId = i64;

/// Permission primary key
pub type PermissionId = i64;

/// Canonical tenant identifier. Tenant `0` is the platform ("system") tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    /// The platform-wide tenant that owns system roles
    pub const SYSTEM: TenantId = TenantId(0);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Canonical user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Tenant identifier as it arrives from outside the engine (path params,
/// JWT claims, admin payloads).
///
/// Translation to [`TenantId`] happens once, at the boundary, through
/// [`crate::AuthzEngine::resolve_tenant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalTenantId {
    /// Decimal string form, e.g. `"0"` or `"42"`
    Text(String),
    /// Numeric key
    Numeric(i64),
    /// Public tenant UUID, looked up through the tenant directory
    Uuid(Uuid),
}

impl ExternalTenantId {
    /// Classify a raw identifier string: UUIDs become [`ExternalTenantId::Uuid`],
    /// everything else is kept as text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match Uuid::parse_str(raw) {
            Ok(uuid) => Self::Uuid(uuid),
            Err(_) => Self::Text(raw.to_string()),
        }
    }
}

impl From<i64> for ExternalTenantId {
    fn from(id: i64) -> Self {
        Self::Numeric(id)
    }
}

impl From<Uuid> for ExternalTenantId {
    fn from(id: Uuid) -> Self {
        Self::Uuid(id)
    }
}

/// Parse a numeric tenant key. Negative values are rejected.
pub(crate) fn parse_numeric_tenant(raw: &str) -> Result<TenantId> {
    let id: i64 = raw
        .trim()
        .parse()
        .map_err(|_| AuthzError::InvalidTenant(raw.to_string()))?;
    numeric_tenant(id)
}

pub(crate) fn numeric_tenant(id: i64) -> Result<TenantId> {
    if id < 0 {
        return Err(AuthzError::InvalidTenant(id.to_string()));
    }
    Ok(TenantId(id))
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AuthzError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(AuthzError::InvalidInput(format!(
                        concat!("invalid ", $what, " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// Kind of permission node
    PermissionType, "permission type", {
        Menu => "menu",
        Button => "button",
        Api => "api",
    }
);

string_enum!(
    /// Whether a permission applies platform-wide or within one tenant
    PermissionScope, "permission scope", {
        System => "system",
        Tenant => "tenant",
    }
);

string_enum!(
    /// Role origin
    RoleType, "role type", {
        System => "system",
        Custom => "custom",
    }
);

string_enum!(
    /// Per-field visibility level
    FieldVisibility, "field visibility", {
        Default => "default",
        Readonly => "readonly",
        Hidden => "hidden",
    }
);

impl FieldVisibility {
    /// Merge precedence; when roles disagree the higher value wins.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Default => 3,
            Self::Readonly => 2,
            Self::Hidden => 1,
        }
    }

    /// The less restrictive of two visibilities
    pub fn least_restrictive(self, other: Self) -> Self {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }

    /// Whether a caller asking for `requested` access may proceed when the
    /// field resolved to `self`.
    pub fn permits(self, requested: FieldVisibility) -> bool {
        match requested {
            Self::Default => self == Self::Default,
            Self::Readonly => matches!(self, Self::Default | Self::Readonly),
            Self::Hidden => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_tenant_classification() {
        assert_eq!(ExternalTenantId::parse(" 42 "), ExternalTenantId::Text("42".to_string()));

        let uuid = Uuid::new_v4();
        assert_eq!(ExternalTenantId::parse(&uuid.to_string()), ExternalTenantId::Uuid(uuid));
    }

    #[test]
    fn test_parse_numeric_tenant() {
        assert_eq!(parse_numeric_tenant("0").unwrap(), TenantId::SYSTEM);
        assert_eq!(parse_numeric_tenant("17").unwrap(), TenantId(17));
        assert!(parse_numeric_tenant("-3").is_err());
        assert!(parse_numeric_tenant("acme").is_err());
    }

    #[test]
    fn test_enum_round_trip_and_rejection() {
        assert_eq!("api".parse::<PermissionType>().unwrap(), PermissionType::Api);
        assert_eq!("tenant".parse::<PermissionScope>().unwrap(), PermissionScope::Tenant);
        assert_eq!(RoleType::System.to_string(), "system");

        let err = "writeonly".parse::<FieldVisibility>().unwrap_err();
        assert!(matches!(err, AuthzError::InvalidInput(_)));
        assert!(err.to_string().contains("field visibility"));
    }

    #[test]
    fn test_visibility_precedence() {
        use FieldVisibility::*;

        assert_eq!(Hidden.least_restrictive(Readonly), Readonly);
        assert_eq!(Readonly.least_restrictive(Default), Default);
        assert_eq!(Default.least_restrictive(Hidden), Default);
        assert_eq!(Hidden.least_restrictive(Hidden), Hidden);
    }

    #[test]
    fn test_visibility_permits() {
        use FieldVisibility::*;

        assert!(Default.permits(Default));
        assert!(!Readonly.permits(Default));
        assert!(Readonly.permits(Readonly));
        assert!(!Hidden.permits(Readonly));
        assert!(Hidden.permits(Hidden));
    }
}
