pub mod admin;
pub mod auth;
pub mod health;
pub mod lock;

use tracing::warn;

use super::AppState;
use crate::mq::{AuditMessage, NotifyMessage};

/// Fire-and-forget audit publish. Losing an audit record is logged, never
/// surfaced to the caller.
pub(crate) fn publish_audit(state: &AppState, msg: AuditMessage) {
    let Some(publisher) = state.publisher.clone() else {
        return;
    };
    tokio::spawn(async move {
        if let Err(err) = publisher.publish_audit(msg).await {
            warn!("audit publish failed: {err:#}");
        }
    });
}

/// Fire-and-forget alert notification for operator tooling.
pub(crate) fn publish_notify(state: &AppState, msg: NotifyMessage) {
    let Some(publisher) = state.publisher.clone() else {
        return;
    };
    tokio::spawn(async move {
        if let Err(err) = publisher.publish_notify(msg).await {
            warn!("notify publish failed: {err:#}");
        }
    });
}
