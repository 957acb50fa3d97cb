//! Permission catalog and system role seed.
//!
//! Seeding is idempotent: catalog rows are inserted with `INSERT OR IGNORE`
//! and a system role only has its permission patterns applied the first
//! time it is created.

use chrono::Utc;
use uuid::Uuid;

use crate::authz::patterns::split_code;
use crate::authz::{permissions, roles};
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::audit::Operator;
use crate::models::rbac::RoleCreateRequest;
use crate::models::user::{CreateUserRequest, User};
use crate::services::{RbacService, UserService};

/// `(code, name, scope)`
pub const PERMISSION_CATALOG: &[(&str, &str, &str)] = &[
    ("equipment:read", "View equipment", "factory"),
    ("equipment:create", "Register equipment", "factory"),
    ("equipment:update", "Edit equipment", "factory"),
    ("equipment:delete", "Remove equipment", "factory"),
    ("equipment:import", "Bulk import equipment", "factory"),
    ("equipment:export", "Export equipment", "factory"),
    ("inspection:read", "View inspections", "factory"),
    ("inspection:read:own", "View own inspections", "own"),
    ("inspection:create", "Record inspections", "factory"),
    ("inspection:update", "Edit inspections", "factory"),
    ("inspection:review", "Review inspections", "factory"),
    ("issue:read", "View issues", "factory"),
    ("issue:create", "Report issues", "factory"),
    ("issue:update", "Edit issues", "factory"),
    ("issue:assign", "Assign issues", "factory"),
    ("issue:close", "Close issues", "factory"),
    ("user:read", "View users", "factory"),
    ("user:create", "Create users", "factory"),
    ("user:update", "Edit users", "factory"),
    ("user:delete", "Deactivate users", "factory"),
    ("role:read", "View roles", "global"),
    ("role:create", "Create roles", "global"),
    ("role:update", "Edit roles", "global"),
    ("role:delete", "Delete roles", "global"),
    ("role:assign", "Assign roles to users", "factory"),
    ("permission:read", "View permissions", "global"),
    ("permission:manage", "Manage the permission catalog", "global"),
    ("permission:grant", "Grant or deny user permissions", "factory"),
    ("factory:read", "View factories", "global"),
    ("factory:create", "Create factories", "global"),
    ("factory:update", "Edit factories", "global"),
    ("report:read", "View reports", "factory"),
    ("report:export", "Export reports", "factory"),
    ("profile:read:own", "View own profile", "own"),
    ("profile:update:own", "Edit own profile", "own"),
    ("audit:read", "View change logs", "global"),
    ("system:config", "Change system configuration", "global"),
    ("system:backup", "Run backups", "global"),
];

pub struct SystemRole {
    pub code: &'static str,
    pub name: &'static str,
    pub level: i64,
    pub is_default: bool,
    pub patterns: &'static [&'static str],
}

pub const SYSTEM_ROLES: &[SystemRole] = &[
    SystemRole {
        code: roles::SUPER_ADMIN,
        name: "Super administrator",
        level: 100,
        is_default: false,
        patterns: &["*"],
    },
    SystemRole {
        code: roles::FACTORY_ADMIN,
        name: "Factory administrator",
        level: 80,
        is_default: false,
        patterns: &[
            "equipment:*",
            "inspection:*",
            "issue:*",
            "user:*",
            "report:*",
            "profile:*",
            "role:read",
            "role:assign",
            "permission:read",
            "permission:grant",
            "factory:read",
            "audit:read",
        ],
    },
    SystemRole {
        code: roles::SAFETY_MANAGER,
        name: "Safety manager",
        level: 60,
        is_default: false,
        patterns: &[
            "equipment:read",
            "equipment:update",
            "inspection:*",
            "issue:*",
            "report:*",
            "profile:*",
            "user:read",
        ],
    },
    SystemRole {
        code: roles::INSPECTOR,
        name: "Inspector",
        level: 10,
        is_default: true,
        patterns: &[
            permissions::EQUIPMENT_READ,
            permissions::INSPECTION_CREATE,
            permissions::INSPECTION_READ_OWN,
            permissions::ISSUE_CREATE,
            permissions::PROFILE_READ_OWN,
        ],
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub permissions_added: u64,
    pub roles_created: Vec<String>,
    /// `ROLE_CODE:pattern` for every pattern that matched nothing
    pub unmatched: Vec<String>,
}

pub async fn seed(db: &Database) -> AppResult<SeedReport> {
    let mut report = SeedReport {
        permissions_added: seed_permissions(db).await?,
        ..SeedReport::default()
    };

    let rbac = RbacService::new(db.clone());
    let operator = Operator::system();

    for system in SYSTEM_ROLES {
        if rbac.find_role_by_code(system.code).await?.is_some() {
            tracing::debug!(role = system.code, "system role present, leaving its permissions alone");
            continue;
        }

        let role = rbac
            .create_system_role(
                RoleCreateRequest {
                    code: system.code.to_string(),
                    name: system.name.to_string(),
                    description: None,
                    level: system.level,
                    is_default: system.is_default,
                    reason: Some("seed".to_string()),
                },
                &operator,
            )
            .await?;

        let outcome = rbac
            .set_role_permissions(role.id, system.patterns, Some("seed".to_string()), &operator)
            .await?;
        tracing::info!(role = system.code, assigned = outcome.assigned, "system role seeded");

        report
            .unmatched
            .extend(outcome.unmatched.into_iter().map(|pattern| format!("{}:{}", system.code, pattern)));
        report.roles_created.push(system.code.to_string());
    }

    if !report.unmatched.is_empty() {
        tracing::warn!(unmatched = ?report.unmatched, "seed patterns matched no permission");
    }

    Ok(report)
}

async fn seed_permissions(db: &Database) -> AppResult<u64> {
    let now = Utc::now();
    let mut added = 0;

    for &(code, name, scope) in PERMISSION_CATALOG {
        let Some((module, action)) = split_code(code) else {
            tracing::warn!(code = %code, "skipping malformed catalog code");
            continue;
        };

        let result = sqlx::query(
            "INSERT OR IGNORE INTO permissions (id, code, name, description, module, action, scope, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, NULL, ?, ?, ?, 1, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(code)
        .bind(name)
        .bind(module)
        .bind(action)
        .bind(scope)
        .bind(now)
        .bind(now)
        .execute(db.pool())
        .await?;
        added += result.rows_affected();
    }

    tracing::info!(added, total = PERMISSION_CATALOG.len(), "permission catalog seeded");
    Ok(added)
}

/// Creates the initial SUPER_ADMIN account unless the username is taken.
pub async fn create_admin(db: &Database, bcrypt_cost: u32, username: &str, password: &str) -> AppResult<User> {
    let users = UserService::new(db.clone(), bcrypt_cost);
    if let Some(existing) = users.find_by_username(username).await? {
        tracing::info!(username = %username, "admin user already exists");
        return Ok(existing);
    }

    users
        .create_user(
            CreateUserRequest {
                username: username.to_string(),
                password: password.to_string(),
                display_name: "Administrator".to_string(),
                role: roles::SUPER_ADMIN.to_string(),
                factory_id: None,
            },
            &Operator::system(),
        )
        .await
}
