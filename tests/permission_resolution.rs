use anyhow::Result;
use chrono::{Duration, Utc};

use fire_safety_auth::authz::{has_permission, resolve_permission_patterns, roles};
use fire_safety_auth::models::audit::Operator;
use fire_safety_auth::models::rbac::RoleCreateRequest;
use fire_safety_auth::services::{PermissionResolver, RbacService};

mod common;

fn reason(text: &str) -> Option<String> {
    Some(text.to_string())
}

#[tokio::test]
async fn inspector_resolves_to_exactly_its_role_set() -> Result<()> {
    let app = common::spawn_app().await?;
    let u1 = app.create_user("user1", roles::INSPECTOR, None).await?;

    let effective = PermissionResolver::new(app.db.clone())
        .resolve_effective_permissions(u1.id, None)
        .await?;

    assert_eq!(
        effective.all_permissions,
        vec![
            "equipment:read",
            "inspection:create",
            "inspection:read:own",
            "issue:create",
            "profile:read:own"
        ]
    );
    assert_eq!(effective.roles.len(), 1);
    assert_eq!(effective.roles[0].code, roles::INSPECTOR);

    Ok(())
}

#[tokio::test]
async fn global_pattern_covers_every_active_permission() -> Result<()> {
    let app = common::spawn_app().await?;
    let catalog = RbacService::new(app.db.clone()).list_permissions(None).await?;
    let active: Vec<_> = catalog.iter().filter(|p| p.is_active).map(|p| p.id).collect();
    assert!(!active.is_empty());

    let resolution = resolve_permission_patterns(&["*"], &catalog);
    assert_eq!(resolution.permission_ids.len(), active.len());
    assert!(active.iter().all(|id| resolution.permission_ids.contains(id)));
    assert!(resolution.unmatched.is_empty());

    // the seeded SUPER_ADMIN role holds the full expansion
    let super_admin = app.role_id(roles::SUPER_ADMIN).await?;
    let linked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM role_permissions WHERE role_id = ?")
        .bind(super_admin.to_string())
        .fetch_one(app.db.pool())
        .await?;
    assert_eq!(linked as usize, active.len());

    Ok(())
}

#[tokio::test]
async fn deny_override_beats_module_grant() -> Result<()> {
    let app = common::spawn_app().await?;
    let u2 = app.create_user("user2", roles::FACTORY_ADMIN, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let delete = app.permission_id("equipment:delete").await?;

    rbac.set_override(u2.id, delete, None, false, None, reason("no deletions"), &Operator::system())
        .await?;

    let effective = PermissionResolver::new(app.db.clone())
        .resolve_effective_permissions(u2.id, None)
        .await?;
    for code in ["equipment:create", "equipment:read", "equipment:update"] {
        assert!(effective.has_permission(code), "missing {code}");
    }
    assert!(!effective.all_permissions.contains(&"equipment:delete".to_string()));
    assert!(!has_permission(&effective.all_permissions, "equipment:delete"));
    assert_eq!(effective.primary_role().map(|r| r.code.as_str()), Some(roles::FACTORY_ADMIN));

    Ok(())
}

#[tokio::test]
async fn deny_also_removes_a_direct_grant() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("user3", roles::INSPECTOR, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let read = app.permission_id("equipment:read").await?;

    rbac.set_override(user.id, read, None, true, None, None, &Operator::system()).await?;
    rbac.set_override(user.id, read, None, false, None, reason("flip"), &Operator::system())
        .await?;

    let effective = PermissionResolver::new(app.db.clone())
        .resolve_effective_permissions(user.id, None)
        .await?;
    assert!(!effective.has_permission("equipment:read"));

    Ok(())
}

#[tokio::test]
async fn expired_overrides_are_ignored_either_way() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("user4", roles::INSPECTOR, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let resolver = PermissionResolver::new(app.db.clone());
    let expires = Utc::now() + Duration::hours(1);

    let export = app.permission_id("report:export").await?;
    let read = app.permission_id("equipment:read").await?;
    rbac.set_override(user.id, export, None, true, Some(expires), None, &Operator::system())
        .await?;
    rbac.set_override(user.id, read, None, false, Some(expires), None, &Operator::system())
        .await?;

    let now = resolver.resolve_at(user.id, None, None, Utc::now()).await?;
    assert!(now.has_permission("report:export"));
    assert!(!now.has_permission("equipment:read"));

    let later = resolver
        .resolve_at(user.id, None, None, expires + Duration::minutes(1))
        .await?;
    assert!(!later.has_permission("report:export"), "expired grant must not apply");
    assert!(later.has_permission("equipment:read"), "expired deny must not apply");

    // past expiries are refused up front
    let refused = rbac
        .set_override(user.id, export, None, true, Some(Utc::now() - Duration::hours(1)), None, &Operator::system())
        .await;
    assert!(refused.is_err());

    Ok(())
}

#[tokio::test]
async fn expire_override_ends_it_now() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("user5", roles::INSPECTOR, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let export = app.permission_id("report:export").await?;

    let grant = rbac
        .set_override(user.id, export, None, true, None, None, &Operator::system())
        .await?;
    let expired = rbac.expire_override(grant.id, reason("audit finding"), &Operator::system()).await?;
    assert!(expired.expires_at.is_some());

    let effective = PermissionResolver::new(app.db.clone())
        .resolve_effective_permissions(user.id, None)
        .await?;
    assert!(!effective.has_permission("report:export"));

    Ok(())
}

#[tokio::test]
async fn resolution_is_deterministic() -> Result<()> {
    let app = common::spawn_app().await?;
    let factory = app.create_factory("PLANT-D").await?;
    let user = app.create_user("user6", roles::SAFETY_MANAGER, Some(factory)).await?;
    let rbac = RbacService::new(app.db.clone());
    let close = app.permission_id("issue:close").await?;
    rbac.set_override(user.id, close, Some(factory), false, None, None, &Operator::system())
        .await?;

    let resolver = PermissionResolver::new(app.db.clone());
    let first = resolver.resolve_effective_permissions(user.id, Some(factory)).await?;
    let second = resolver.resolve_effective_permissions(user.id, Some(factory)).await?;
    assert_eq!(first, second);

    let mut sorted = first.all_permissions.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(first.all_permissions, sorted);
    assert!(!first.has_permission("issue:close"));

    Ok(())
}

#[tokio::test]
async fn primary_role_is_highest_level_then_earliest() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("user7", roles::INSPECTOR, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let operator = Operator::system();

    let lead = rbac
        .create_role(
            RoleCreateRequest {
                code: "SHIFT_LEAD".to_string(),
                name: "Shift lead".to_string(),
                description: None,
                level: 60,
                is_default: false,
                reason: None,
            },
            &operator,
        )
        .await?;
    let manager = app.role_id(roles::SAFETY_MANAGER).await?;

    rbac.assign_role(user.id, lead.id, None, None, &operator).await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    rbac.assign_role(user.id, manager, None, None, &operator).await?;

    let effective = PermissionResolver::new(app.db.clone())
        .resolve_effective_permissions(user.id, None)
        .await?;
    let order: Vec<&str> = effective.roles.iter().map(|r| r.code.as_str()).collect();
    assert_eq!(order, vec!["SHIFT_LEAD", roles::SAFETY_MANAGER, roles::INSPECTOR]);

    Ok(())
}

#[tokio::test]
async fn no_assignments_means_empty_set_unless_falling_back() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("user8", roles::INSPECTOR, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let inspector = app.role_id(roles::INSPECTOR).await?;
    rbac.revoke_role(user.id, inspector, None, None, &Operator::system()).await?;

    let resolver = PermissionResolver::new(app.db.clone());
    let bare = resolver.resolve_effective_permissions(user.id, None).await?;
    assert!(bare.roles.is_empty());
    assert!(bare.all_permissions.is_empty());

    let fallback = resolver
        .resolve_with_fallback(user.id, None, Some(roles::INSPECTOR))
        .await?;
    assert_eq!(fallback.primary_role().map(|r| r.code.as_str()), Some(roles::INSPECTOR));
    assert!(fallback.has_permission("equipment:read"));

    Ok(())
}

#[tokio::test]
async fn factory_scoped_grants_stay_out_of_unscoped_resolution() -> Result<()> {
    let app = common::spawn_app().await?;
    let plant = app.create_factory("PLANT-G").await?;
    let user = app.create_user("roaming", roles::INSPECTOR, None).await?;
    let rbac = RbacService::new(app.db.clone());
    let operator = Operator::system();

    let factory_admin = app.role_id(roles::FACTORY_ADMIN).await?;
    rbac.assign_role(user.id, factory_admin, Some(plant), None, &operator).await?;
    let export = app.permission_id("report:export").await?;
    rbac.set_override(user.id, export, Some(plant), true, None, None, &operator)
        .await?;

    let resolver = PermissionResolver::new(app.db.clone());
    let unscoped = resolver.resolve_effective_permissions(user.id, None).await?;
    assert_eq!(unscoped.primary_role().map(|r| r.code.as_str()), Some(roles::INSPECTOR));
    assert!(!unscoped.has_permission("equipment:delete"));
    assert!(!unscoped.has_permission("report:export"));

    let in_plant = resolver.resolve_effective_permissions(user.id, Some(plant)).await?;
    assert_eq!(in_plant.primary_role().map(|r| r.code.as_str()), Some(roles::FACTORY_ADMIN));
    assert!(in_plant.has_permission("equipment:delete"));
    assert!(in_plant.has_permission("report:export"));

    // the login token is resolved for the user's own (absent) factory
    let body = app.login("roaming", common::PASSWORD).await?;
    assert_eq!(body["user"]["role"], roles::INSPECTOR);
    let permissions = common::codes(&body["user"]["permissions"]);
    assert!(!permissions.contains(&"equipment:delete".to_string()));
    assert!(!permissions.contains(&"role:assign".to_string()));

    Ok(())
}
