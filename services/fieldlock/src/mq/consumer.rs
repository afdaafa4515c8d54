//! Audit consumer: worker pool draining `audit.queue` into batched inserts.
//!
//! Messages are acknowledged once they land in the in-memory batch; the flush
//! itself is best-effort. A consumer crash loses at most one unflushed batch,
//! which the at-least-once contract accepts because the broker had already
//! redelivered those messages before the ack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Connection, ConnectionProperties, Consumer,
};
use sqlx::{PgPool, QueryBuilder};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{AuditMessage, AUDIT_QUEUE};
use crate::domain::models::DEVICE_TYPE_LOCK;

const WORKER_COUNT: usize = 3;
const PREFETCH: u16 = 10;
const BATCH_MAX: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct AuditRow {
    user_id: i64,
    device_id: String,
    device_type: String,
    action: String,
    result_code: i16,
    client_ip: String,
    device_model: String,
    extra: Option<serde_json::Value>,
    occurred_at: DateTime<Utc>,
}

impl From<AuditMessage> for AuditRow {
    fn from(msg: AuditMessage) -> Self {
        let device_type = if msg.device_type.is_empty() {
            DEVICE_TYPE_LOCK.to_string()
        } else {
            msg.device_type
        };
        let occurred_at = Utc
            .timestamp_millis_opt(msg.occurred_at)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            user_id: msg.user_id,
            device_id: msg.device_id,
            device_type,
            action: msg.action,
            result_code: msg.result_code,
            client_ip: msg.client_ip,
            device_model: msg.device_model,
            extra: msg.extra,
            occurred_at,
        }
    }
}

type Batch = Arc<Mutex<Vec<AuditRow>>>;

pub struct AuditConsumer {
    conn: Arc<Connection>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl AuditConsumer {
    /// Connect and start the worker pool plus the 1 Hz batch flusher.
    ///
    /// # Errors
    /// Returns an error if the broker connection or the consumers cannot be
    /// set up; the server keeps running without a consumer in that case.
    pub async fn start(url: &str, pool: PgPool) -> Result<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect audit consumer")?;
        let channel = conn
            .create_channel()
            .await
            .context("failed to open consumer channel")?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .context("failed to set consumer qos")?;

        let batch: Batch = Arc::new(Mutex::new(Vec::with_capacity(BATCH_MAX)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(WORKER_COUNT + 1);

        for worker in 0..WORKER_COUNT {
            let consumer = channel
                .basic_consume(
                    AUDIT_QUEUE,
                    &format!("audit-worker-{worker}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .context("failed to start audit consumer")?;
            handles.push(tokio::spawn(run_worker(
                consumer,
                batch.clone(),
                pool.clone(),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(run_flusher(batch, pool, shutdown_rx)));

        Ok(Self {
            conn: Arc::new(conn),
            shutdown,
            handles,
        })
    }

    /// Stop the workers, flush the remaining batch, and close the connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        if let Err(err) = self.conn.close(200, "shutdown").await {
            warn!("consumer connection close failed: {err}");
        }
    }
}

async fn run_worker(
    mut consumer: Consumer,
    batch: Batch,
    pool: PgPool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => return,
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = delivery else {
            // Channel closed under us; the flusher still drains the batch.
            return;
        };
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!("audit delivery failed: {err}");
                return;
            }
        };

        let msg: AuditMessage = match serde_json::from_slice(&delivery.data) {
            Ok(msg) => msg,
            Err(err) => {
                error!("failed to decode audit message: {err}");
                let nack = BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                };
                if let Err(err) = delivery.nack(nack).await {
                    warn!("failed to nack undecodable message: {err}");
                }
                continue;
            }
        };

        let should_flush = {
            let mut buf = batch.lock().await;
            buf.push(AuditRow::from(msg));
            buf.len() >= BATCH_MAX
        };
        if should_flush {
            flush(&batch, &pool).await;
        }

        // Ack after the row is in the batch; flush durability is best-effort.
        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            warn!("failed to ack audit message: {err}");
        }
    }
}

async fn run_flusher(batch: Batch, pool: PgPool, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                flush(&batch, &pool).await;
                return;
            }
            _ = tick.tick() => flush(&batch, &pool).await,
        }
    }
}

async fn flush(batch: &Batch, pool: &PgPool) {
    let rows = {
        let mut buf = batch.lock().await;
        if buf.is_empty() {
            return;
        }
        std::mem::take(&mut *buf)
    };

    let mut builder = QueryBuilder::new(
        "INSERT INTO audit_logs \
         (user_id, device_id, device_type, action, result_code, client_ip, device_model, extra, occurred_at) ",
    );
    builder.push_values(&rows, |mut b, row| {
        b.push_bind(row.user_id)
            .push_bind(&row.device_id)
            .push_bind(&row.device_type)
            .push_bind(&row.action)
            .push_bind(row.result_code)
            .push_bind(&row.client_ip)
            .push_bind(&row.device_model)
            .push_bind(&row.extra)
            .push_bind(row.occurred_at);
    });

    match builder.build().execute(pool).await {
        Ok(_) => debug!(count = rows.len(), "flushed audit logs"),
        Err(err) => error!(count = rows.len(), "failed to batch insert audit logs: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_row_defaults_device_type() {
        let msg = AuditMessage {
            user_id: 1,
            device_id: "D1".to_string(),
            action: "challenge_request".to_string(),
            client_ip: "10.0.0.1".to_string(),
            occurred_at: 1_700_000_000_123,
            ..AuditMessage::default()
        };
        let row = AuditRow::from(msg);
        assert_eq!(row.device_type, DEVICE_TYPE_LOCK);
        assert_eq!(row.occurred_at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn audit_row_falls_back_to_now_on_bad_timestamp() {
        let msg = AuditMessage {
            user_id: 1,
            device_id: "D1".to_string(),
            action: "challenge_request".to_string(),
            client_ip: "10.0.0.1".to_string(),
            occurred_at: i64::MAX,
            ..AuditMessage::default()
        };
        let before = Utc::now();
        let row = AuditRow::from(msg);
        assert!(row.occurred_at >= before);
    }
}
