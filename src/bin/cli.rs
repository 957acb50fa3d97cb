use sqlx::Row;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlx::SqlitePool;

use fire_safety_auth::config::DEFAULT_BCRYPT_COST;
use fire_safety_auth::services::{AuditTrail, RevocationStore};
use fire_safety_auth::{events, seed, Database};

#[derive(Parser, Debug)]
#[command(author, version, about = "fire-safety auth operations tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new reversible migration pair with the provided name
    MakeMigration { name: String },
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Roll back the last applied migration
    MigrateRollback,
    /// Seed the permission catalog and system roles, optionally an admin user
    Seed {
        #[arg(long)]
        admin_username: Option<String>,
        #[arg(long, requires = "admin_username")]
        admin_password: Option<String>,
    },
    /// Delete revoked-token rows whose original token has expired
    PruneRevoked,
    /// Delete permission change logs older than the given number of days
    PruneChangeLogs {
        #[arg(long, default_value_t = 365)]
        days: i64,
    },
    /// Apply severity-based retention to authentication events
    PruneEvents,
    /// Walk the authentication event hash chain
    VerifyEvents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenv().is_err() {
        let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::MakeMigration { name } => {
            let (up, down) = make_migration_files(&name)?;
            println!("Created migration: {}", up.display());
            println!("Created migration: {}", down.display());
        }
        Commands::MigrateRun => {
            let db = Database::connect_from_env().await?;
            let migrator = get_migrator().await?;
            migrator.run(db.pool()).await?;
            println!("Migrations applied");
            db.close().await;
        }
        Commands::MigrateStatus => {
            let db = Database::connect_from_env().await?;
            let migrator = get_migrator().await?;
            print_status(db.pool(), &migrator).await?;
            db.close().await;
        }
        Commands::MigrateRollback => {
            let db = Database::connect_from_env().await?;
            let migrator = get_migrator().await?;
            let applied = applied_versions(db.pool()).await?;
            let last = applied
                .iter()
                .max()
                .copied()
                .context("no migrations were rolled back")?;
            migrator.undo(db.pool(), last - 1).await?;
            println!("Rolled back migration {}", last);
            db.close().await;
        }
        Commands::Seed {
            admin_username,
            admin_password,
        } => {
            let db = Database::connect_from_env().await?;
            let report = seed::seed(&db).await?;
            println!(
                "Seeded {} permissions, created roles: {:?}",
                report.permissions_added, report.roles_created
            );
            for pattern in &report.unmatched {
                println!("unmatched pattern: {}", pattern);
            }

            if let (Some(username), Some(password)) = (admin_username, admin_password) {
                let cost = bcrypt_cost()?;
                let admin = seed::create_admin(&db, cost, &username, &password).await?;
                println!("Admin user: {} ({})", admin.username, admin.id);
            }
            db.close().await;
        }
        Commands::PruneRevoked => {
            let db = Database::connect_from_env().await?;
            let removed = RevocationStore::new(db.clone()).purge_expired(Utc::now()).await?;
            println!("Removed {} expired revocation entries", removed);
            db.close().await;
        }
        Commands::PruneChangeLogs { days } => {
            if days < 1 {
                anyhow::bail!("--days must be at least 1");
            }
            let db = Database::connect_from_env().await?;
            let cutoff = Utc::now() - Duration::days(days);
            let removed = AuditTrail::new(db.clone()).prune_older_than(cutoff).await?;
            println!("Removed {} change log rows older than {}", removed, cutoff);
            db.close().await;
        }
        Commands::PruneEvents => {
            let db = Database::connect_from_env().await?;
            let removed = events::prune_events(db.pool(), Utc::now()).await?;
            println!("Removed {} authentication events", removed);
            db.close().await;
        }
        Commands::VerifyEvents => {
            let db = Database::connect_from_env().await?;
            let report = events::verify_chain(db.pool()).await?;
            db.close().await;
            match report.broken_at {
                None => println!(
                    "Hash chain intact ({} events, {} retention gaps)",
                    report.checked, report.gaps
                ),
                Some(seq) => anyhow::bail!("hash chain broken at seq {} after {} events", seq, report.checked),
            }
        }
    }

    Ok(())
}

fn bcrypt_cost() -> anyhow::Result<u32> {
    match std::env::var("BCRYPT_COST") {
        Ok(value) => value.parse::<u32>().context("BCRYPT_COST must be a valid integer"),
        Err(_) => Ok(DEFAULT_BCRYPT_COST),
    }
}

fn make_migration_files(name: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let sanitized = sanitize_name(name);
    let up = Path::new("migrations").join(format!("{}_{}.up.sql", timestamp, sanitized));
    let down = Path::new("migrations").join(format!("{}_{}.down.sql", timestamp, sanitized));

    if up.exists() || down.exists() {
        anyhow::bail!("migration already exists: {}", up.display());
    }

    fs::write(&up, "-- Write your migration SQL here\n")
        .with_context(|| format!("failed to create migration at {}", up.display()))?;
    fs::write(&down, "-- Revert the matching up migration here\n")
        .with_context(|| format!("failed to create migration at {}", down.display()))?;

    Ok((up, down))
}

async fn applied_versions(pool: &SqlitePool) -> anyhow::Result<HashSet<i64>> {
    let table = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'")
        .fetch_optional(pool)
        .await?;
    if table.is_none() {
        return Ok(HashSet::new());
    }

    let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().filter_map(|row| row.try_get::<i64, _>("version").ok()).collect())
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    let applied = applied_versions(pool).await?;

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter().filter(|m| m.migration_type.is_up_migration()) {
        let version = migration.version;
        let status = if applied.contains(&version) { "applied" } else { "pending" };
        let desc = migration.description.as_ref().trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, version, name);
    }

    Ok(())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    let local = Path::new("./migrations");
    let migrator_path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let migrator_path_display = migrator_path.display().to_string();
    sqlx::migrate::Migrator::new(migrator_path)
        .await
        .with_context(|| format!("failed to load migrations from {}", migrator_path_display))
}
