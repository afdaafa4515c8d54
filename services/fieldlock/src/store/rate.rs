//! Sliding-window request counters and the IP block table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Pre-bound gates. Keys are `<prefix><suffix>` where the suffix is an IP or
/// a device id.
#[derive(Debug, Clone, Copy)]
pub struct Gate {
    pub prefix: &'static str,
    pub limit: i32,
    pub window_secs: i64,
}

pub const GLOBAL_IP_GATE: Gate = Gate {
    prefix: "global:ip:",
    limit: 100,
    window_secs: 60,
};

pub const LOGIN_IP_GATE: Gate = Gate {
    prefix: "login:ip:",
    limit: 10,
    window_secs: 60,
};

pub const CHALLENGE_DEVICE_GATE: Gate = Gate {
    prefix: "challenge:lock:",
    limit: 5,
    window_secs: 60,
};

impl Gate {
    #[must_use]
    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Deny { retry_after_secs: i64 },
}

/// Counter capability. `increment_and_check` must be atomic: a row absent or
/// older than the window restarts at count 1, anything else increments, and
/// the request is allowed iff the resulting count is within the limit.
#[async_trait]
pub trait RateStore: Send + Sync {
    async fn increment_and_check(
        &self,
        key: &str,
        window_secs: i64,
        limit: i32,
    ) -> Result<RateDecision>;

    /// Whether an unexpired block row exists for this ip. Consulted before
    /// any counter is touched.
    async fn ip_blocked(&self, ip: &str) -> Result<bool>;
}

pub struct PgRateStore {
    pool: PgPool,
}

impl PgRateStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateStore for PgRateStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window_secs: i64,
        limit: i32,
    ) -> Result<RateDecision> {
        // Single-statement conditional upsert; the window reset and the
        // increment ride on the row's own atomicity.
        let row = sqlx::query(
            r"
            INSERT INTO rate_limits (key, count, window_start, updated_at)
            VALUES ($1, 1, NOW(), NOW())
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN rate_limits.window_start <= NOW() - ($2 * INTERVAL '1 second')
                    THEN 1
                    ELSE rate_limits.count + 1
                END,
                window_start = CASE
                    WHEN rate_limits.window_start <= NOW() - ($2 * INTERVAL '1 second')
                    THEN NOW()
                    ELSE rate_limits.window_start
                END,
                updated_at = NOW()
            RETURNING count, window_start
            ",
        )
        .bind(key)
        .bind(window_secs)
        .fetch_one(&self.pool)
        .await
        .context("failed to increment rate counter")?;

        let count: i32 = row.get("count");
        let window_start: DateTime<Utc> = row.get("window_start");
        Ok(decide(count, limit, window_start, Utc::now(), window_secs))
    }

    async fn ip_blocked(&self, ip: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ip_blocks WHERE ip = $1 AND expires_at > NOW()",
        )
        .bind(ip)
        .fetch_one(&self.pool)
        .await
        .context("failed to check ip block")?;
        Ok(count.0 > 0)
    }
}

fn decide(
    count: i32,
    limit: i32,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
    window_secs: i64,
) -> RateDecision {
    if count <= limit {
        return RateDecision::Allow;
    }
    let elapsed = (now - window_start).num_seconds();
    RateDecision::Deny {
        retry_after_secs: (window_secs - elapsed).clamp(1, window_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn gate_keys_compose() {
        assert_eq!(GLOBAL_IP_GATE.key("1.2.3.4"), "global:ip:1.2.3.4");
        assert_eq!(LOGIN_IP_GATE.key("1.2.3.4"), "login:ip:1.2.3.4");
        assert_eq!(CHALLENGE_DEVICE_GATE.key("D1"), "challenge:lock:D1");
    }

    #[test]
    fn allows_up_to_the_limit() {
        let now = Utc::now();
        for count in 1..=10 {
            assert_eq!(decide(count, 10, now, now, 60), RateDecision::Allow);
        }
    }

    #[test]
    fn denies_past_the_limit_with_remaining_window() {
        let now = Utc::now();
        let started = now - Duration::seconds(20);
        assert_eq!(
            decide(11, 10, started, now, 60),
            RateDecision::Deny {
                retry_after_secs: 40
            }
        );
    }

    #[test]
    fn retry_after_is_clamped() {
        let now = Utc::now();
        // Stale window row: never advertise less than one second...
        let stale = now - Duration::seconds(600);
        assert_eq!(
            decide(11, 10, stale, now, 60),
            RateDecision::Deny {
                retry_after_secs: 1
            }
        );
        // ...or more than the window itself.
        let future = now + Duration::seconds(600);
        assert_eq!(
            decide(11, 10, future, now, 60),
            RateDecision::Deny {
                retry_after_secs: 60
            }
        );
    }
}
