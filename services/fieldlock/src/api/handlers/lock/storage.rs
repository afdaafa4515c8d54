//! Database helpers for the unlock flow.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::{warn, Instrument};

use crate::domain::models::{Device, ALERT_TYPE_CONSECUTIVE_FAIL, DEVICE_TYPE_LOCK};

/// Just enough of the device row to answer a challenge.
#[derive(Debug, sqlx::FromRow)]
pub(super) struct ChallengeDevice {
    pub(super) status: i16,
    pub(super) key_encrypted: Vec<u8>,
}

pub(super) async fn find_device_for_challenge(
    pool: &PgPool,
    device_id: &str,
) -> Result<Option<ChallengeDevice>> {
    let query = r"
        SELECT status, key_encrypted
        FROM devices
        WHERE device_id = $1 AND deleted_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, ChallengeDevice>(query)
        .bind(device_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup device")
}

/// Whether the user holds an effective permission for this lock right now:
/// active, started, and not yet ended.
pub(super) async fn has_effective_permission(
    pool: &PgPool,
    user_id: i64,
    device_id: &str,
) -> Result<bool> {
    let query = r"
        SELECT COUNT(*)
        FROM permissions
        WHERE user_id = $1
          AND device_type = $2
          AND device_id = $3
          AND status = 1
          AND valid_from <= NOW()
          AND (valid_until IS NULL OR valid_until > NOW())
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(DEVICE_TYPE_LOCK)
        .bind(device_id)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to check permission")?;
    let count: i64 = row.get(0);
    Ok(count > 0)
}

/// Non-deleted, non-disabled devices the user currently holds an effective
/// permission for. Pure read.
pub(super) async fn authorized_devices(pool: &PgPool, user_id: i64) -> Result<Vec<Device>> {
    let query = r"
        SELECT d.id, d.device_id, d.name, d.location_text, d.longitude, d.latitude,
               d.pipeline_tag, d.risk_level, d.key_version, d.status,
               d.last_active_at, d.created_at, d.updated_at
        FROM devices d
        JOIN permissions p
          ON p.device_type = $1
         AND p.device_id = d.device_id
         AND p.user_id = $2
         AND p.status = 1
         AND p.valid_from <= NOW()
         AND (p.valid_until IS NULL OR p.valid_until > NOW())
        WHERE d.deleted_at IS NULL AND d.status != 0
        ORDER BY d.device_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Device>(query)
        .bind(DEVICE_TYPE_LOCK)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list authorized devices")
}

/// Best-effort `last_active_at` bump; errors are swallowed and logged.
pub(super) fn spawn_touch_last_active(pool: PgPool, device_id: String) {
    tokio::spawn(async move {
        let result = sqlx::query(
            r"
            UPDATE devices
            SET last_active_at = NOW()
            WHERE device_id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(&device_id)
        .execute(&pool)
        .await;
        if let Err(err) = result {
            warn!(device_id = %device_id, "failed to update last_active_at: {err}");
        }
    });
}

/// Quarantine + alert + counter reset as one transaction. A deleted device
/// makes the status update a no-op; the alert row is still written.
pub(super) async fn quarantine_with_alert(
    pool: &PgPool,
    device_id: &str,
    user_id: i64,
    fail_count: i32,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin alert transaction")?;

    // Disabled devices stay disabled; everything else moves to quarantined.
    sqlx::query(
        r"
        UPDATE devices
        SET status = 2, updated_at = NOW()
        WHERE device_id = $1 AND deleted_at IS NULL AND status != 0
        ",
    )
    .bind(device_id)
    .execute(&mut *tx)
    .await
    .context("failed to quarantine device")?;

    sqlx::query(
        r"
        INSERT INTO alerts (alert_type, device_type, device_id, user_id, severity, status, extra)
        VALUES ($1, $2, $3, $4, 3, 0, $5)
        ",
    )
    .bind(ALERT_TYPE_CONSECUTIVE_FAIL)
    .bind(DEVICE_TYPE_LOCK)
    .bind(device_id)
    .bind(user_id)
    .bind(serde_json::json!({ "fail_count": fail_count }))
    .execute(&mut *tx)
    .await
    .context("failed to insert alert")?;

    // Start clean if an operator re-activates the device later.
    sqlx::query(
        r"
        UPDATE device_fail_counts
        SET count = 0, updated_at = NOW()
        WHERE device_type = $1 AND device_id = $2
        ",
    )
    .bind(DEVICE_TYPE_LOCK)
    .bind(device_id)
    .execute(&mut *tx)
    .await
    .context("failed to reset fail count")?;

    tx.commit().await.context("commit alert transaction")
}
