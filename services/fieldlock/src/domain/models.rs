//! Row types shared across handlers and stores.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Only locks exist today; other device classes register their own tag later.
pub const DEVICE_TYPE_LOCK: &str = "lock";

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

pub const STATUS_DISABLED: i16 = 0;
pub const STATUS_ACTIVE: i16 = 1;
pub const STATUS_QUARANTINED: i16 = 2;

pub const ALERT_TYPE_CONSECUTIVE_FAIL: &str = "consecutive_fail";

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub phone: String,
    pub password_hash: String,
    pub name: String,
    pub department: Option<String>,
    pub role: String,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// JSON shape for user rows. The clear phone never leaves the server.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub uuid: Uuid,
    pub phone: String,
    pub name: String,
    pub department: Option<String>,
    pub role: String,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            uuid: user.uuid,
            phone: mask_phone(&user.phone),
            name: user.name,
            department: user.department,
            role: user.role,
            status: user.status,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub location_text: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub pipeline_tag: Option<String>,
    pub risk_level: i16,
    pub key_version: i16,
    pub status: i16,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// JSON shape for device rows. The wrapped key stays out of every response.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub name: String,
    pub location_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    pub pipeline_tag: Option<String>,
    pub risk_level: i16,
    pub key_version: i16,
    pub status: i16,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.device_id,
            name: device.name,
            location_text: device.location_text,
            longitude: device.longitude,
            latitude: device.latitude,
            pipeline_tag: device.pipeline_tag,
            risk_level: device.risk_level,
            key_version: device.key_version,
            status: device.status,
            last_active_at: device.last_active_at,
            created_at: device.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Permission {
    pub id: i64,
    pub user_id: i64,
    pub device_type: String,
    pub device_id: String,
    pub granted_by: i64,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: i16,
    pub revoked_by: Option<i64>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Alert {
    pub id: i64,
    pub alert_type: String,
    pub device_type: String,
    pub device_id: String,
    pub user_id: Option<i64>,
    pub severity: i16,
    pub status: i16,
    pub handled_by: Option<i64>,
    pub handle_note: Option<String>,
    pub extra: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub handled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub user_id: i64,
    pub device_id: String,
    pub device_type: String,
    pub action: String,
    pub result_code: i16,
    pub client_ip: String,
    pub device_model: String,
    pub extra: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Mask a phone number for display: `138****1111`.
///
/// Anything too short to keep first-3 + last-4 distinct collapses to `****`.
pub fn mask_phone(phone: &str) -> String {
    if !phone.is_ascii() || phone.len() < 7 {
        return "****".to_string();
    }
    format!("{}****{}", &phone[..3], &phone[phone.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_phone_keeps_prefix_and_suffix() {
        assert_eq!(mask_phone("13800001111"), "138****1111");
        assert_eq!(mask_phone("8613900004444"), "861****4444");
    }

    #[test]
    fn mask_phone_collapses_short_or_odd_input() {
        assert_eq!(mask_phone("12345"), "****");
        assert_eq!(mask_phone(""), "****");
        assert_eq!(mask_phone("电话电话电话电话"), "****");
    }

    #[test]
    fn user_view_masks_phone() {
        let user = User {
            id: 1,
            uuid: Uuid::nil(),
            phone: "13800001111".to_string(),
            password_hash: "$argon2id$...".to_string(),
            name: "Mei".to_string(),
            department: None,
            role: ROLE_USER.to_string(),
            status: STATUS_ACTIVE,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let view = UserView::from(user);
        assert_eq!(view.phone, "138****1111");
    }
}
