//! Database helpers for the login flow.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::Instrument;

use crate::domain::models::User;

/// Look up a login candidate by phone among non-deleted rows.
pub(super) async fn find_login_user(pool: &PgPool, phone: &str) -> Result<Option<User>> {
    let query = r"
        SELECT id, uuid, phone, password_hash, name, department, role, status,
               created_at, updated_at
        FROM users
        WHERE phone = $1 AND deleted_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, User>(query)
        .bind(phone)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by phone")
}
