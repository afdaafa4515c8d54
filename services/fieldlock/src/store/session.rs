//! Session persistence and the hourly expiry sweeper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: uuid::Uuid,
    pub user_id: i64,
    pub role: String,
    pub expires_at: DateTime<Utc>,
    pub user_agent: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub session_id: uuid::Uuid,
    pub user_id: i64,
    pub role: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Session persistence capability. Implementations must provide an atomic
/// `create`, idempotent deletes, and a `find_by_id` that never returns an
/// expired row, even inside the sweeper's race window.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &NewSession) -> Result<()>;
    async fn find_by_id(&self, session_id: uuid::Uuid) -> Result<Option<SessionRow>>;
    async fn delete_by_id(&self, session_id: uuid::Uuid) -> Result<()>;
    async fn delete_by_user(&self, user_id: i64) -> Result<u64>;
    async fn clean_expired(&self) -> Result<u64>;
    async fn count_active(&self) -> Result<i64>;
}

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: &NewSession) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (session_id, user_id, role, expires_at, user_agent, ip_address)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.role)
        .bind(session.expires_at)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .execute(&self.pool)
        .await
        .context("failed to insert session")?;
        Ok(())
    }

    async fn find_by_id(&self, session_id: uuid::Uuid) -> Result<Option<SessionRow>> {
        // Expiry is enforced here, not by the sweeper.
        let row = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT session_id, user_id, role, expires_at, created_at
            FROM sessions
            WHERE session_id = $1 AND expires_at > NOW()
            ",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to lookup session")?;
        Ok(row)
    }

    async fn delete_by_id(&self, session_id: uuid::Uuid) -> Result<()> {
        // Idempotent; deleting an absent session is fine.
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to delete session")?;
        Ok(())
    }

    async fn delete_by_user(&self, user_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to delete user sessions")?;
        Ok(result.rows_affected())
    }

    async fn clean_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .context("failed to clean expired sessions")?;
        Ok(result.rows_affected())
    }

    async fn count_active(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE expires_at > NOW()")
                .fetch_one(&self.pool)
                .await
                .context("failed to count active sessions")?;
        Ok(count.0)
    }
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn the hourly sweep of expired session rows.
pub fn spawn_expiry_sweeper(store: Arc<dyn SessionStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick fires immediately; skip it so the sweep runs hourly.
        tick.tick().await;
        loop {
            tick.tick().await;
            match store.clean_expired().await {
                Ok(0) => {}
                Ok(count) => info!(count, "cleaned expired sessions"),
                Err(err) => error!("session cleanup failed: {err:#}"),
            }
            match store.count_active().await {
                Ok(active) => info!(active, "session sweep complete"),
                Err(err) => error!("session count failed: {err:#}"),
            }
        }
    })
}
