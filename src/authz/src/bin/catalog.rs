//! # Permission catalog inspector
//!
//! Loads the permission catalog from PostgreSQL, validates it and prints the
//! permission forest as JSON.
//!
//! ```text
//! authz-catalog [system|tenant]
//! ```
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL` - PostgreSQL connection URL (required)
//! - `RUST_LOG` - Log level (default: info)

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_authz::catalog::validate_catalog;
use warden_authz::engine::build_permission_tree;
use warden_authz::{PermissionFilter, PermissionScope, PermissionStore, PostgresStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting permission catalog inspector v{}", warden_authz::VERSION);

    let scope: Option<PermissionScope> = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()
        .context("scope must be 'system' or 'tenant'")?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let store = PostgresStore::connect(&database_url)
        .await
        .context("failed to connect to the permission store")?;

    let catalog = store
        .list_permissions(&PermissionFilter::default())
        .await
        .context("failed to load the permission catalog")?;
    validate_catalog(&catalog).context("permission catalog is inconsistent")?;

    let inactive = catalog.iter().filter(|p| !p.is_active).count();
    if inactive > 0 {
        warn!("{} inactive permissions are left out of the tree", inactive);
    }

    let active: Vec<_> = catalog
        .into_iter()
        .filter(|p| p.is_active && scope.map_or(true, |s| p.scope == s))
        .collect();
    info!("Loaded {} active permissions", active.len());

    let tree = build_permission_tree(&active);
    println!("{}", serde_json::to_string_pretty(&tree)?);

    Ok(())
}
