use anyhow::Result;
use axum::http::StatusCode;
use serde_json::json;

use fire_safety_auth::authz::roles;
use fire_safety_auth::errors::AppError;
use fire_safety_auth::models::audit::Operator;
use fire_safety_auth::models::rbac::RoleCreateRequest;
use fire_safety_auth::models::user::CreateUserRequest;
use fire_safety_auth::services::RbacService;

mod common;
use common::{codes, PASSWORD};

#[tokio::test]
async fn every_violation_is_reported_at_once() -> Result<()> {
    let app = common::spawn_app().await?;
    let admin = app.admin_token().await?;

    let (status, body) = app
        .send(
            "POST",
            "/users",
            Some(&admin),
            Some(json!({
                "username": "ab",
                "password": "short",
                "displayName": " ",
                "role": roles::INSPECTOR,
                "factoryId": uuid::Uuid::new_v4(),
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let details = codes(&body["details"]);
    let has = |needle: &str| details.iter().any(|d| d.contains(needle));
    assert!(has("username must be at least"), "{:?}", details);
    assert!(has("display name"), "{:?}", details);
    assert!(has("factory does not exist"), "{:?}", details);
    assert!(has("uppercase"), "{:?}", details);
    assert!(has("digit"), "{:?}", details);

    // duplicate usernames are reported the same way
    app.create_user("inspector1", roles::INSPECTOR, None).await?;
    let err = app
        .users()
        .create_user(
            CreateUserRequest {
                username: "inspector1".to_string(),
                password: PASSWORD.to_string(),
                display_name: "Again".to_string(),
                role: roles::INSPECTOR.to_string(),
                factory_id: None,
            },
            &Operator::system(),
        )
        .await;
    match err {
        Err(AppError::Validation(violations)) => {
            assert!(violations.iter().any(|v| v.contains("username already exists")));
        }
        other => panic!("expected validation error, got {:?}", other.map(|u| u.username)),
    }

    Ok(())
}

#[tokio::test]
async fn new_users_get_their_base_role_and_the_default_roles() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("manager1", roles::SAFETY_MANAGER, None).await?;

    let assigned = RbacService::new(app.db.clone()).list_user_roles(user.id).await?;
    let manager = app.role_id(roles::SAFETY_MANAGER).await?;
    let inspector = app.role_id(roles::INSPECTOR).await?;

    assert_eq!(assigned.len(), 2);
    assert!(assigned.iter().any(|a| a.role_id == manager && a.is_active));
    assert!(assigned.iter().any(|a| a.role_id == inspector && a.is_active));

    let logged: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM permission_change_logs WHERE action = 'ASSIGN_ROLE' AND target_user_id = ?",
    )
    .bind(user.id.to_string())
    .fetch_one(app.db.pool())
    .await?;
    assert_eq!(logged, 2);

    Ok(())
}

#[tokio::test]
async fn default_roles_never_outrank_the_base_role() -> Result<()> {
    let app = common::spawn_app().await?;
    let rbac = RbacService::new(app.db.clone());
    let chief = rbac
        .create_role(
            RoleCreateRequest {
                code: "AREA_CHIEF".to_string(),
                name: "Area chief".to_string(),
                description: None,
                level: 90,
                is_default: true,
                reason: None,
            },
            &Operator::system(),
        )
        .await?;
    let inspector = app.role_id(roles::INSPECTOR).await?;

    let manager = app.create_user("manager1", roles::SAFETY_MANAGER, None).await?;
    let assigned = rbac.list_user_roles(manager.id).await?;
    assert_eq!(assigned.len(), 2);
    assert!(assigned.iter().all(|a| a.role_id != chief.id));
    assert!(assigned.iter().any(|a| a.role_id == inspector));

    let root = app.create_user("root1", roles::SUPER_ADMIN, None).await?;
    let assigned = rbac.list_user_roles(root.id).await?;
    assert_eq!(assigned.len(), 3);
    assert!(assigned.iter().any(|a| a.role_id == chief.id));

    // an inspector has nothing ranked at or below it to inherit
    let fresh = app.create_user("inspector1", roles::INSPECTOR, None).await?;
    assert_eq!(rbac.list_user_roles(fresh.id).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn racing_signups_for_one_username_yield_one_account() -> Result<()> {
    let app = common::spawn_app().await?;
    let users = app.users();
    let request = || CreateUserRequest {
        username: "twin".to_string(),
        password: PASSWORD.to_string(),
        display_name: "Twin".to_string(),
        role: roles::INSPECTOR.to_string(),
        factory_id: None,
    };
    let operator = Operator::system();

    let (first, second) = tokio::join!(
        users.create_user(request(), &operator),
        users.create_user(request(), &operator),
    );

    let (created, rejected): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(|r| r.is_ok());
    assert_eq!(created.len(), 1);
    match rejected.into_iter().next() {
        Some(Err(AppError::Validation(violations))) => {
            assert_eq!(violations, vec!["username already exists".to_string()]);
        }
        other => panic!("expected a validation error, got {:?}", other.map(|r| r.map(|u| u.username))),
    }

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = 'twin'")
        .fetch_one(app.db.pool())
        .await?;
    assert_eq!(count, 1);

    Ok(())
}

#[tokio::test]
async fn unknown_base_role_degrades_to_baseline_only() -> Result<()> {
    let app = common::spawn_app().await?;
    let user = app.create_user("contractor1", "CONTRACTOR", None).await?;
    assert_eq!(user.role, "CONTRACTOR");

    // the assignment step rolled back as a whole, default roles included
    let assigned = RbacService::new(app.db.clone()).list_user_roles(user.id).await?;
    assert!(assigned.is_empty());
    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM permission_change_logs WHERE target_user_id = ?")
        .bind(user.id.to_string())
        .fetch_one(app.db.pool())
        .await?;
    assert_eq!(logged, 0);

    // the account still works, with the baseline role and no permissions
    let login = app.login("contractor1", PASSWORD).await?;
    assert_eq!(login["user"]["role"], "CONTRACTOR");
    assert!(codes(&login["user"]["permissions"]).is_empty());

    Ok(())
}

#[tokio::test]
async fn users_can_read_themselves_but_not_others() -> Result<()> {
    let app = common::spawn_app().await?;
    let one = app.create_user("inspector1", roles::INSPECTOR, None).await?;
    let two = app.create_user("inspector2", roles::INSPECTOR, None).await?;
    let token = app.access_token("inspector1").await?;

    let (status, body) = app
        .send("GET", &format!("/users/{}", one.id), Some(&token), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "inspector1");
    assert!(body.get("passwordHash").is_none());

    let (status, _) = app
        .send("GET", &format!("/users/{}", two.id), Some(&token), None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    Ok(())
}
