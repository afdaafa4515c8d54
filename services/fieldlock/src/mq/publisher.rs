//! Fire-and-forget publisher for audit and notify messages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::warn;
use uuid::Uuid;

use super::{
    AuditMessage, NotifyMessage, AUDIT_DLQ, AUDIT_QUEUE, MESSAGE_SOURCE, MESSAGE_VERSION,
    NOTIFY_DLQ, NOTIFY_QUEUE,
};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// AMQP delivery mode 2: persist the message to disk on the broker.
const DELIVERY_PERSISTENT: u8 = 2;

#[derive(Clone)]
pub struct Publisher {
    conn: Arc<Connection>,
    channel: Channel,
}

impl Publisher {
    /// Connect to the broker and declare the working and dead-letter queues.
    ///
    /// # Errors
    /// Returns an error if the connection or channel cannot be established;
    /// the caller is expected to keep serving without audit publishing.
    pub async fn connect(url: &str) -> Result<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect to message broker")?;
        let channel = conn
            .create_channel()
            .await
            .context("failed to open broker channel")?;

        for queue in [AUDIT_QUEUE, NOTIFY_QUEUE, AUDIT_DLQ, NOTIFY_DLQ] {
            let declare = channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await;
            if let Err(err) = declare {
                warn!(queue, "failed to declare queue: {err}");
            }
        }

        Ok(Self {
            conn: Arc::new(conn),
            channel,
        })
    }

    /// # Errors
    /// Returns an error if serialization or the publish itself fails; callers
    /// log and continue.
    pub async fn publish_audit(&self, mut msg: AuditMessage) -> Result<()> {
        msg.message_id = Uuid::new_v4().to_string();
        msg.version = MESSAGE_VERSION.to_string();
        msg.source = MESSAGE_SOURCE.to_string();
        msg.occurred_at = Utc::now().timestamp_millis();
        let body = serde_json::to_vec(&msg).context("failed to serialize audit message")?;
        self.publish(AUDIT_QUEUE, &body).await
    }

    /// # Errors
    /// Returns an error if serialization or the publish itself fails.
    pub async fn publish_notify(&self, mut msg: NotifyMessage) -> Result<()> {
        msg.message_id = Uuid::new_v4().to_string();
        msg.version = MESSAGE_VERSION.to_string();
        msg.source = MESSAGE_SOURCE.to_string();
        msg.occurred_at = Utc::now().timestamp_millis();
        let body = serde_json::to_vec(&msg).context("failed to serialize notify message")?;
        self.publish(NOTIFY_QUEUE, &body).await
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".to_string().into())
            .with_delivery_mode(DELIVERY_PERSISTENT);

        let publish = async {
            self.channel
                .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
                .await?
                .await?;
            Ok::<_, lapin::Error>(())
        };

        tokio::time::timeout(PUBLISH_TIMEOUT, publish)
            .await
            .map_err(|_| anyhow!("publish to {queue} timed out"))?
            .with_context(|| format!("failed to publish to {queue}"))?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(err) = self.conn.close(200, "shutdown").await {
            warn!("broker connection close failed: {err}");
        }
    }
}
