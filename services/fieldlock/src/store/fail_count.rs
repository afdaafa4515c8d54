//! Per-device consecutive-failure counters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

/// Failure-count capability keyed by `(device_type, device_id)`.
///
/// `increment` must be an atomic upsert: the first failure writes count = 1,
/// later ones add to it, with a monotone `last_fail_at`. There is no natural
/// expiry; only `reset` (success report, alert handling) clears a counter.
#[async_trait]
pub trait DeviceFailStore: Send + Sync {
    async fn increment(&self, device_type: &str, device_id: &str) -> Result<i32>;
    async fn reset(&self, device_type: &str, device_id: &str) -> Result<()>;
    async fn get(&self, device_type: &str, device_id: &str) -> Result<i32>;
}

pub struct PgDeviceFailStore {
    pool: PgPool,
}

impl PgDeviceFailStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceFailStore for PgDeviceFailStore {
    async fn increment(&self, device_type: &str, device_id: &str) -> Result<i32> {
        let row = sqlx::query(
            r"
            INSERT INTO device_fail_counts (device_type, device_id, count, last_fail_at, updated_at)
            VALUES ($1, $2, 1, NOW(), NOW())
            ON CONFLICT (device_type, device_id) DO UPDATE SET
                count = device_fail_counts.count + 1,
                last_fail_at = NOW(),
                updated_at = NOW()
            RETURNING count
            ",
        )
        .bind(device_type)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to increment device fail count")?;
        Ok(row.get("count"))
    }

    async fn reset(&self, device_type: &str, device_id: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE device_fail_counts
            SET count = 0, updated_at = NOW()
            WHERE device_type = $1 AND device_id = $2
            ",
        )
        .bind(device_type)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("failed to reset device fail count")?;
        Ok(())
    }

    async fn get(&self, device_type: &str, device_id: &str) -> Result<i32> {
        let row = sqlx::query(
            "SELECT count FROM device_fail_counts WHERE device_type = $1 AND device_id = $2",
        )
        .bind(device_type)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read device fail count")?;
        Ok(row.map_or(0, |row| row.get("count")))
    }
}
