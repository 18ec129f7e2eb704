//! Resolver tests: permission resolution, admin checks and trees

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use warden_authz::{
    AuthzEngine, AuthzError, EngineConfig, ExternalTenantId, InMemoryStore, MemoryCache, Permission,
    PermissionScope, PermissionType, Role, RoleType, TenantId, UserId, UserRole,
};

const SYSTEM_ADMIN: UserId = UserId(1);
const NOBODY: UserId = UserId(2);
const OUTSIDER: UserId = UserId(3);
const TENANT_ADMIN: UserId = UserId(4);
const STAFF: UserId = UserId(5);

const ACME: TenantId = TenantId(5);
const GLOBEX: TenantId = TenantId(6);

fn engine_over(store: InMemoryStore) -> AuthzEngine {
    let store = Arc::new(store);
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(60), Duration::from_secs(60)));
    AuthzEngine::with_cache(EngineConfig::default(), store.clone(), store.clone(), store, cache).unwrap()
}

fn catalog() -> Vec<Permission> {
    vec![
        Permission::new(0, "tenant_menu", PermissionType::Menu, PermissionScope::System).with_module("tenant"),
        Permission::new(0, "tenant_list_btn", PermissionType::Button, PermissionScope::System)
            .with_parent("tenant_menu"),
        Permission::new(0, "tenant_list_api", PermissionType::Api, PermissionScope::System)
            .with_parent("tenant_list_btn")
            .with_endpoint("/api/v1/tenants", "GET"),
        Permission::new(0, "user_menu", PermissionType::Menu, PermissionScope::Tenant)
            .with_module("user")
            .with_sort_order(2),
        Permission::new(0, "user_list_api", PermissionType::Api, PermissionScope::Tenant)
            .with_parent("user_menu")
            .with_endpoint("/api/v1/users", "GET"),
        Permission::new(0, "user_create_api", PermissionType::Api, PermissionScope::Tenant)
            .with_parent("user_menu")
            .with_endpoint("/api/v1/users", "POST"),
    ]
}

fn seeded() -> InMemoryStore {
    InMemoryStore::builder()
        .permissions(catalog())
        .user(SYSTEM_ADMIN, TenantId::SYSTEM)
        .user(NOBODY, TenantId::SYSTEM)
        .user(OUTSIDER, ACME)
        .user(TENANT_ADMIN, ACME)
        .user(STAFF, ACME)
        .role(Role::new(1, TenantId::SYSTEM, "system_admin", RoleType::System))
        .role(Role::new(2, ACME, "tenant_admin", RoleType::System))
        .role(Role::new(3, ACME, "staff", RoleType::Custom))
        .role(Role::new(4, ACME, "archived", RoleType::Custom))
        .grant(UserRole::new(SYSTEM_ADMIN, 1, TenantId::SYSTEM))
        // A system role held by a user whose home tenant is not the system tenant
        .grant(UserRole::new(OUTSIDER, 1, TenantId::SYSTEM))
        .grant(UserRole::new(TENANT_ADMIN, 2, ACME))
        .grant(UserRole::new(STAFF, 3, ACME))
        .role_permission(1, "tenant_menu")
        .role_permission(1, "tenant_list_btn")
        .role_permission(1, "tenant_list_api")
        .role_permission(2, "user_menu")
        .role_permission(2, "user_list_api")
        .role_permission(2, "user_create_api")
        .role_permission(3, "user_list_api")
        .build()
        .unwrap()
}

// ============================================================================
// PERMISSION RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_system_admin_can_list_tenants() {
    let engine = engine_over(seeded());
    let tenant = engine.resolve_tenant(&ExternalTenantId::parse("0")).await.unwrap();

    assert!(engine.check_user_permission(SYSTEM_ADMIN, tenant, "tenant_list_api").await.unwrap());
}

#[tokio::test]
async fn test_user_without_grants_is_denied_without_error() {
    let engine = engine_over(seeded());

    let result = engine.check_user_permission(NOBODY, TenantId::SYSTEM, "tenant_list_api").await;
    assert!(!result.unwrap());

    // Holding nothing is a successful answer
    assert!(engine.get_user_permissions(NOBODY, ACME).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_user_is_not_found() {
    let engine = engine_over(seeded());

    let err = engine.check_user_permission(UserId(999), ACME, "user_list_api").await.unwrap_err();
    assert!(matches!(err, AuthzError::NotFound { ref entity, .. } if entity == "user"));
    assert!(engine.get_user_permissions(UserId(999), ACME).await.unwrap_err().is_not_found());
    assert!(engine.get_user_roles(UserId(999), ACME).await.unwrap_err().is_not_found());
    assert!(engine.get_user_menu_tree(UserId(999), ACME).await.unwrap_err().is_not_found());

    // Nothing was cached for the unknown user
    assert_eq!(engine.cache_stats().await.entries, 0);
}

#[tokio::test]
async fn test_system_roles_apply_in_every_tenant() {
    let engine = engine_over(seeded());

    for tenant in [TenantId::SYSTEM, ACME, GLOBEX] {
        assert!(engine.check_user_permission(SYSTEM_ADMIN, tenant, "tenant_list_api").await.unwrap());
    }
}

#[tokio::test]
async fn test_tenant_roles_stay_in_their_tenant() {
    let engine = engine_over(seeded());

    assert!(engine.check_user_permission(STAFF, ACME, "user_list_api").await.unwrap());
    assert!(!engine.check_user_permission(STAFF, ACME, "user_create_api").await.unwrap());
    assert!(!engine.check_user_permission(STAFF, GLOBEX, "user_list_api").await.unwrap());
}

#[tokio::test]
async fn test_permission_union_has_no_duplicates() {
    let store = InMemoryStore::builder()
        .permissions(catalog())
        .user(STAFF, ACME)
        .role(Role::new(3, ACME, "staff", RoleType::Custom))
        .role(Role::new(4, ACME, "auditor", RoleType::Custom))
        .grant(UserRole::new(STAFF, 3, ACME))
        .grant(UserRole::new(STAFF, 4, ACME))
        .role_permission(3, "user_list_api")
        .role_permission(4, "user_list_api")
        .role_permission(4, "user_menu")
        .build()
        .unwrap();
    let engine = engine_over(store);

    let mut codes: Vec<String> = engine
        .get_user_permissions(STAFF, ACME)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.code)
        .collect();
    codes.sort();
    assert_eq!(codes, vec!["user_list_api", "user_menu"]);
}

#[tokio::test]
async fn test_expired_and_inactive_grants_are_ignored() {
    let mut inactive_role = Role::new(4, ACME, "archived", RoleType::Custom);
    inactive_role.is_active = false;

    let store = InMemoryStore::builder()
        .permissions(catalog())
        .user(STAFF, ACME)
        .user(OUTSIDER, ACME)
        .role(Role::new(3, ACME, "staff", RoleType::Custom))
        .role(inactive_role)
        .grant(UserRole::new(STAFF, 3, ACME).expiring_at(chrono::Utc::now() - chrono::Duration::minutes(5)))
        .grant(UserRole::new(OUTSIDER, 4, ACME))
        .role_permission(3, "user_list_api")
        .role_permission(4, "user_list_api")
        .build()
        .unwrap();
    let engine = engine_over(store);

    assert!(engine.get_user_roles(STAFF, ACME).await.unwrap().is_empty());
    assert!(!engine.check_user_permission(STAFF, ACME, "user_list_api").await.unwrap());
    assert!(!engine.check_user_permission(OUTSIDER, ACME, "user_list_api").await.unwrap());
}

#[tokio::test]
async fn test_future_expiry_still_grants() {
    let store = InMemoryStore::builder()
        .permissions(catalog())
        .user(STAFF, ACME)
        .role(Role::new(3, ACME, "staff", RoleType::Custom))
        .grant(UserRole::new(STAFF, 3, ACME).expiring_at(chrono::Utc::now() + chrono::Duration::hours(1)))
        .role_permission(3, "user_list_api")
        .build()
        .unwrap();
    let engine = engine_over(store);

    assert!(engine.check_user_permission(STAFF, ACME, "user_list_api").await.unwrap());
}

#[tokio::test]
async fn test_cached_resolution_stops_at_grant_expiry() {
    let store = InMemoryStore::builder()
        .permissions(catalog())
        .user(STAFF, ACME)
        .role(Role::new(3, ACME, "staff", RoleType::Custom))
        .role(Role::new(4, ACME, "reader", RoleType::Custom))
        .grant(
            UserRole::new(STAFF, 3, ACME)
                .expiring_at(chrono::Utc::now() + chrono::Duration::milliseconds(150)),
        )
        .grant(UserRole::new(STAFF, 4, ACME))
        .role_permission(3, "user_create_api")
        .role_permission(4, "user_list_api")
        .build()
        .unwrap();
    let engine = engine_over(store);

    assert!(engine.check_user_permission(STAFF, ACME, "user_create_api").await.unwrap());
    assert_eq!(engine.get_user_roles(STAFF, ACME).await.unwrap().len(), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;

    // Both cached entries outlive the grant only until it expires
    assert!(!engine.check_user_permission(STAFF, ACME, "user_create_api").await.unwrap());
    assert!(engine.check_user_permission(STAFF, ACME, "user_list_api").await.unwrap());
    let roles = engine.get_user_roles(STAFF, ACME).await.unwrap();
    assert_eq!(roles.iter().map(|r| r.code.as_str()).collect::<Vec<_>>(), vec!["reader"]);
}

#[tokio::test]
async fn test_inactive_permissions_are_not_resolved() {
    let mut retired = Permission::new(0, "user_export_api", PermissionType::Api, PermissionScope::Tenant)
        .with_endpoint("/api/v1/users/export", "GET");
    retired.is_active = false;

    let store = InMemoryStore::builder()
        .permissions(vec![retired])
        .user(STAFF, ACME)
        .role(Role::new(3, ACME, "staff", RoleType::Custom))
        .grant(UserRole::new(STAFF, 3, ACME))
        .role_permission(3, "user_export_api")
        .build()
        .unwrap();
    let engine = engine_over(store);

    assert!(!engine.check_user_permission(STAFF, ACME, "user_export_api").await.unwrap());
}

// ============================================================================
// ADMIN CHECKS
// ============================================================================

#[tokio::test]
async fn test_is_system_admin() {
    let engine = engine_over(seeded());

    assert!(engine.is_system_admin(SYSTEM_ADMIN).await.unwrap());
    assert!(!engine.is_system_admin(NOBODY).await.unwrap());
    assert!(!engine.is_system_admin(TENANT_ADMIN).await.unwrap());
    assert!(engine.is_system_admin(UserId(999)).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_system_admin_requires_system_home_tenant() {
    let engine = engine_over(seeded());

    // Holds system_admin, but lives in a regular tenant
    assert!(!engine.is_system_admin(OUTSIDER).await.unwrap());
}

#[tokio::test]
async fn test_system_admin_requires_system_role_type() {
    let store = InMemoryStore::builder()
        .user(NOBODY, TenantId::SYSTEM)
        .role(Role::new(9, TenantId::SYSTEM, "system_admin", RoleType::Custom))
        .grant(UserRole::new(NOBODY, 9, TenantId::SYSTEM))
        .build()
        .unwrap();
    let engine = engine_over(store);

    assert!(!engine.is_system_admin(NOBODY).await.unwrap());
}

#[tokio::test]
async fn test_is_tenant_admin() {
    let engine = engine_over(seeded());

    assert!(engine.is_tenant_admin(TENANT_ADMIN, ACME).await.unwrap());
    assert!(!engine.is_tenant_admin(TENANT_ADMIN, GLOBEX).await.unwrap());
    assert!(!engine.is_tenant_admin(STAFF, ACME).await.unwrap());

    // System administrators administer every tenant
    assert!(engine.is_tenant_admin(SYSTEM_ADMIN, ACME).await.unwrap());
    assert!(engine.is_tenant_admin(SYSTEM_ADMIN, GLOBEX).await.unwrap());
}

// ============================================================================
// TREES
// ============================================================================

fn chain_store() -> InMemoryStore {
    InMemoryStore::builder()
        .permissions(vec![
            Permission::new(0, "C", PermissionType::Button, PermissionScope::Tenant).with_parent("B"),
            Permission::new(0, "A", PermissionType::Menu, PermissionScope::Tenant),
            Permission::new(0, "B", PermissionType::Menu, PermissionScope::Tenant).with_parent("A"),
            Permission::new(0, "X", PermissionType::Menu, PermissionScope::System),
        ])
        .user(SYSTEM_ADMIN, TenantId::SYSTEM)
        .user(STAFF, ACME)
        .role(Role::new(1, TenantId::SYSTEM, "system_admin", RoleType::System))
        .grant(UserRole::new(SYSTEM_ADMIN, 1, TenantId::SYSTEM))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_permission_tree_chain() {
    let engine = engine_over(chain_store());

    let tree = engine
        .get_permission_tree(SYSTEM_ADMIN, TenantId::SYSTEM, Some(PermissionScope::Tenant))
        .await
        .unwrap();

    assert_eq!(tree.len(), 1);
    let a = &tree[0];
    assert_eq!(a.permission.code, "A");
    assert_eq!(a.children.len(), 1);
    assert_eq!(a.children[0].permission.code, "B");
    assert_eq!(a.children[0].children.len(), 1);
    assert_eq!(a.children[0].children[0].permission.code, "C");
}

#[tokio::test]
async fn test_permission_tree_scope_narrowing() {
    let engine = engine_over(chain_store());

    let all = engine.get_permission_tree(SYSTEM_ADMIN, TenantId::SYSTEM, None).await.unwrap();
    let roots: Vec<&str> = all.iter().map(|n| n.permission.code.as_str()).collect();
    assert_eq!(roots, vec!["A", "X"]);

    // Non-admins only ever see tenant scope, whatever they ask for
    let narrowed = engine
        .get_permission_tree(STAFF, ACME, Some(PermissionScope::System))
        .await
        .unwrap();
    assert_eq!(narrowed.len(), 1);
    assert_eq!(narrowed[0].permission.code, "A");

    // Admins acting inside a regular tenant are narrowed as well
    let in_tenant = engine.get_permission_tree(SYSTEM_ADMIN, ACME, None).await.unwrap();
    assert_eq!(in_tenant.len(), 1);
}

#[tokio::test]
async fn test_tree_serializes_flat_permission_fields() {
    let engine = engine_over(chain_store());
    let tree = engine.get_permission_tree(STAFF, ACME, None).await.unwrap();

    let json = serde_json::to_value(&tree).unwrap();
    assert_eq!(json[0]["code"], "A");
    assert_eq!(json[0]["type"], "menu");
    assert_eq!(json[0]["children"][0]["code"], "B");
}

#[tokio::test]
async fn test_user_menu_tree() {
    let engine = engine_over(seeded());

    let menu = engine.get_user_menu_tree(SYSTEM_ADMIN, TenantId::SYSTEM).await.unwrap();
    assert_eq!(menu.len(), 1);
    assert_eq!(menu[0].code, "tenant_menu");
    assert_eq!(menu[0].icon, "apartment");
    // Buttons and APIs are not menu entries
    assert!(menu[0].children.is_empty());

    let menu = engine.get_user_menu_tree(TENANT_ADMIN, ACME).await.unwrap();
    assert_eq!(menu.len(), 1);
    assert_eq!(menu[0].path, "/system/user");

    assert!(engine.get_user_menu_tree(STAFF, ACME).await.unwrap().is_empty());
}

// ============================================================================
// CONSISTENCY
// ============================================================================

const CODES: [&str; 6] = [
    "tenant_menu",
    "tenant_list_btn",
    "tenant_list_api",
    "user_menu",
    "user_list_api",
    "user_create_api",
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_check_agrees_with_resolved_set(granted in proptest::collection::vec(any::<bool>(), CODES.len())) {
        tokio_test::block_on(async {
            let mut builder = InMemoryStore::builder()
                .permissions(catalog())
                .user(STAFF, ACME)
                .role(Role::new(3, ACME, "staff", RoleType::Custom))
                .grant(UserRole::new(STAFF, 3, ACME));
            for (code, _) in CODES.iter().zip(&granted).filter(|(_, g)| **g) {
                builder = builder.role_permission(3, *code);
            }
            let engine = engine_over(builder.build().unwrap());

            let resolved = engine.get_user_permissions(STAFF, ACME).await.unwrap();
            for (code, expected) in CODES.iter().zip(&granted) {
                let allowed = engine.check_user_permission(STAFF, ACME, code).await.unwrap();
                assert_eq!(allowed, resolved.iter().any(|p| p.code == *code));
                assert_eq!(allowed, *expected);
            }
            engine.shutdown().await;
        });
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[tokio::test]
async fn test_metrics_track_checks_and_cache() {
    let engine = engine_over(seeded());

    engine.check_user_permission(STAFF, ACME, "user_list_api").await.unwrap();
    engine.check_user_permission(STAFF, ACME, "user_create_api").await.unwrap();

    let metrics = engine.get_metrics().unwrap();
    assert_eq!(metrics.total_checks, 2);
    assert_eq!(metrics.allowed_checks, 1);
    assert_eq!(metrics.denied_checks, 1);
    // First check misses both permissions and roles, second hits permissions
    assert_eq!(metrics.cache_misses, 2);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.store_errors, 0);

    let stats = engine.cache_stats().await;
    assert_eq!(stats.entries, 2);
}
