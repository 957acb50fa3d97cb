use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::errors::AppResult;

pub mod severity;
pub use severity::Severity;

/// Authentication event names.
pub mod names {
    pub const LOGIN_SUCCEEDED: &str = "auth.login";
    pub const LOGIN_FAILED: &str = "auth.login_failed";
    pub const LOGOUT: &str = "auth.logout";
    pub const TOKEN_REFRESHED: &str = "auth.refresh";
    pub const PASSWORD_CHANGED: &str = "auth.password_changed";
    pub const TOKEN_REVOKED: &str = "auth.token_revoked";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<T> {
    pub id: Uuid,
    pub name: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub subject_id: Option<Uuid>,
    pub payload: T,
}

impl<T> DomainEvent<T> {
    pub fn new(name: &'static str, actor_id: Option<Uuid>, subject_id: Option<Uuid>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            occurred_at: Utc::now(),
            actor_id,
            subject_id,
            payload,
        }
    }
}

pub type EventBus = broadcast::Sender<Value>;

pub fn init_event_bus() -> (EventBus, broadcast::Receiver<Value>) {
    broadcast::channel(1024)
}

/// Requester metadata (IP, User-Agent) attached to events and change logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Extract context from Axum request headers
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self { ip, user_agent }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEventPayload {
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    pub severity: Severity,
}

/// Fire-and-forget publish; a bus without listeners only logs.
pub fn publish_auth_event(
    event_bus: &EventBus,
    name: &'static str,
    actor_id: Option<Uuid>,
    subject_id: Option<Uuid>,
    details: Value,
    context: Option<RequestContext>,
    severity: Severity,
) {
    let event = DomainEvent::new(
        name,
        actor_id,
        subject_id,
        AuthEventPayload {
            details,
            context,
            severity,
        },
    );

    match serde_json::to_value(&event) {
        Ok(value) => {
            if event_bus.send(value).is_err() {
                tracing::debug!(event = name, "no event listener attached");
            }
        }
        Err(err) => tracing::error!(event = name, error = %err, "failed to serialize event"),
    }
}

pub async fn start_event_listener(mut rx: broadcast::Receiver<Value>, pool: SqlitePool) {
    tracing::info!("auth event listener started");
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(err) = persist_event(&pool, &event).await {
                    tracing::error!(error = %err, "failed to persist auth event");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "auth event listener lagged, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::info!("auth event listener stopped");
}

/// Appends one event to `auth_events`, chaining `hash = SHA256(prev_hash || properties)`.
pub async fn persist_event(pool: &SqlitePool, event: &Value) -> Result<(), sqlx::Error> {
    let name = event.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
    let actor_id = event
        .get("actor_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());
    let subject_id = event
        .get("subject_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());
    let occurred_at = event
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let severity = event
        .get("payload")
        .and_then(|p| p.get("severity"))
        .and_then(|s| s.as_str())
        .unwrap_or(Severity::Important.as_str());
    let properties = event.to_string();

    let mut tx = crate::db::begin_write(pool).await?;

    let last: Option<(i64, String)> = sqlx::query_as("SELECT seq, hash FROM auth_events ORDER BY seq DESC LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;
    let (seq, prev_hash) = match last {
        Some((seq, hash)) => (seq + 1, Some(hash)),
        None => (1, None),
    };
    let hash = chain_hash(prev_hash.as_deref(), &properties);

    sqlx::query(
        "INSERT INTO auth_events (id, seq, event_name, actor_id, subject_id, occurred_at, properties, severity, prev_hash, hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(seq)
    .bind(name)
    .bind(actor_id.map(|u| u.to_string()))
    .bind(subject_id.map(|u| u.to_string()))
    .bind(occurred_at)
    .bind(&properties)
    .bind(severity)
    .bind(&prev_hash)
    .bind(&hash)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub fn chain_hash(prev_hash: Option<&str>, properties: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(properties.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub checked: u64,
    /// Places where retention removed rows; the row after a gap starts a new segment
    pub gaps: u64,
    /// `seq` of the first row whose hash or link does not match
    pub broken_at: Option<i64>,
}

/// Recomputes the chain over the retained rows. Retention deletes rows by
/// severity, so the first row after a gap in `seq` has its `prev_hash`
/// trusted rather than linked to the row before the gap.
pub async fn verify_chain(pool: &SqlitePool) -> AppResult<ChainReport> {
    let rows: Vec<(i64, String, Option<String>, String)> =
        sqlx::query_as("SELECT seq, properties, prev_hash, hash FROM auth_events ORDER BY seq")
            .fetch_all(pool)
            .await?;

    let mut report = ChainReport {
        checked: 0,
        gaps: 0,
        broken_at: None,
    };
    let mut previous: Option<(i64, String)> = None;

    for (seq, properties, prev_hash, hash) in rows {
        let linked = match &previous {
            None => true,
            Some((prev_seq, _)) if seq != prev_seq + 1 => {
                report.gaps += 1;
                true
            }
            Some((_, prev)) => prev_hash.as_deref() == Some(prev.as_str()),
        };
        if !linked || chain_hash(prev_hash.as_deref(), &properties) != hash {
            report.broken_at = Some(seq);
            return Ok(report);
        }
        previous = Some((seq, hash));
        report.checked += 1;
    }

    Ok(report)
}

/// Age-based retention by severity. Critical events are never removed.
pub async fn prune_events(pool: &SqlitePool, now: DateTime<Utc>) -> AppResult<u64> {
    let mut removed = 0;
    for severity in [Severity::Noise, Severity::Important] {
        let Some(days) = severity.retention_days() else {
            continue;
        };
        let cutoff = now - Duration::days(days);
        let result =
            sqlx::query("DELETE FROM auth_events WHERE severity = ? AND julianday(occurred_at) < julianday(?)")
                .bind(severity.as_str())
                .bind(cutoff)
                .execute(pool)
                .await?;
        removed += result.rows_affected();
    }

    tracing::info!(removed, "pruned auth events");
    Ok(removed)
}
