//! Asynchronous audit and alert delivery over AMQP 0.9.1.
//!
//! Two logical queues, each with a sibling dead-letter queue: `audit.queue`
//! carries every authenticated action, `notify.queue` carries quarantine-class
//! alerts for operator tooling. Delivery is at-least-once end to end; the
//! audit trail is a compliance record, never a correctness dependency, so
//! publish failures are logged and swallowed.

mod consumer;
mod publisher;

pub use consumer::AuditConsumer;
pub use publisher::Publisher;

use serde::{Deserialize, Serialize};

pub const AUDIT_QUEUE: &str = "audit.queue";
pub const NOTIFY_QUEUE: &str = "notify.queue";
pub const AUDIT_DLQ: &str = "audit.dlq";
pub const NOTIFY_DLQ: &str = "notify.dlq";

pub(crate) const MESSAGE_VERSION: &str = "1.0";
pub(crate) const MESSAGE_SOURCE: &str = "fieldlock";

/// One authenticated action. Envelope fields (`message_id`, `version`,
/// `source`, `occurred_at` in epoch millis) are stamped by the publisher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditMessage {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub occurred_at: i64,
    pub user_id: i64,
    pub device_id: String,
    #[serde(default)]
    pub device_type: String,
    pub action: String,
    #[serde(default)]
    pub result_code: i16,
    pub client_ip: String,
    #[serde(default)]
    pub device_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Operator-facing alert notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyMessage {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub occurred_at: i64,
    pub alert_type: String,
    pub device_id: String,
    pub severity: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_message_round_trips_as_json() {
        let msg = AuditMessage {
            user_id: 7,
            device_id: "D1".to_string(),
            device_type: "lock".to_string(),
            action: "unlock_fail".to_string(),
            result_code: 1,
            client_ip: "10.0.0.1".to_string(),
            extra: Some(serde_json::json!({"fail_reason": "bad mac"})),
            ..AuditMessage::default()
        };
        let bytes = serde_json::to_vec(&msg).expect("serialize");
        let back: AuditMessage = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back.user_id, 7);
        assert_eq!(back.action, "unlock_fail");
        assert_eq!(back.result_code, 1);
        assert!(back.extra.is_some());
    }

    #[test]
    fn messages_without_envelope_fields_still_parse() {
        // Producers on older builds may omit the envelope; defaults cover it.
        let raw = r#"{"user_id":1,"device_id":"D1","action":"challenge_request","client_ip":"10.0.0.1"}"#;
        let msg: AuditMessage = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(msg.message_id, "");
        assert_eq!(msg.occurred_at, 0);
        assert_eq!(msg.device_model, "");
    }
}
