//! Uniform response envelope and the business error codes behind it.
//!
//! Every response is `{code, message, data, request_id, timestamp}` with
//! `code = 0` on success. Business codes map onto HTTP statuses
//! deterministically: the 1xxx auth family answers 401 (403 for a disabled
//! account outside the gateway), 2xxx answers 403, too-many-requests answers
//! 429, the 3xxx and 4xxx validation families answer 400, and 5xxx answers
//! 500.

use axum::{
    extract::FromRequestParts,
    http::{header::RETRY_AFTER, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::kms::KmsError;

pub const CODE_OK: i32 = 0;
// 1xxx - authentication
pub const CODE_AUTH_FAILED: i32 = 1001;
pub const CODE_ACCOUNT_DISABLED: i32 = 1002;
pub const CODE_SESSION_EXPIRED: i32 = 1003;
// 2xxx - authorization
pub const CODE_NO_PERMISSION: i32 = 2001;
pub const CODE_FORBIDDEN: i32 = 2002;
// 3xxx - lock operations
pub const CODE_DEVICE_NOT_FOUND: i32 = 3001;
pub const CODE_DEVICE_UNAVAILABLE: i32 = 3002;
pub const CODE_TOO_MANY_REQUESTS: i32 = 3003;
// 4xxx - validation
pub const CODE_PARAM_ERROR: i32 = 4001;
pub const CODE_REQUEST_EXPIRED: i32 = 4002;
pub const CODE_INVALID_DEVICE_KEY: i32 = 4003;
// 5xxx - internal
pub const CODE_INTERNAL: i32 = 5001;
pub const CODE_KEY_CORRUPTED: i32 = 5002;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Param(String),
    #[error("invalid credentials")]
    AuthFailed,
    #[error("account has been disabled")]
    AccountDisabled,
    #[error("session expired, please login again")]
    SessionExpired,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("no permission for this device")]
    NoPermission,
    #[error("device not found")]
    DeviceNotFound,
    #[error("{0}")]
    DeviceUnavailable(String),
    #[error("too many requests")]
    TooManyRequests { retry_after_secs: i64 },
    #[error("request expired")]
    RequestExpired,
    #[error("stored device key is corrupted")]
    KeyCorrupted,
    #[error("device key must be 32 lowercase hex characters")]
    InvalidDeviceKey,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Param(_) => CODE_PARAM_ERROR,
            Self::AuthFailed => CODE_AUTH_FAILED,
            Self::AccountDisabled => CODE_ACCOUNT_DISABLED,
            Self::SessionExpired => CODE_SESSION_EXPIRED,
            Self::Forbidden => CODE_FORBIDDEN,
            Self::NoPermission => CODE_NO_PERMISSION,
            Self::DeviceNotFound => CODE_DEVICE_NOT_FOUND,
            Self::DeviceUnavailable(_) => CODE_DEVICE_UNAVAILABLE,
            Self::TooManyRequests { .. } => CODE_TOO_MANY_REQUESTS,
            Self::RequestExpired => CODE_REQUEST_EXPIRED,
            Self::KeyCorrupted => CODE_KEY_CORRUPTED,
            Self::InvalidDeviceKey => CODE_INVALID_DEVICE_KEY,
            Self::Internal(_) => CODE_INTERNAL,
        }
    }

    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AuthFailed | Self::SessionExpired => StatusCode::UNAUTHORIZED,
            Self::AccountDisabled => StatusCode::FORBIDDEN,
            Self::Forbidden | Self::NoPermission => StatusCode::FORBIDDEN,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Param(_)
            | Self::RequestExpired
            | Self::InvalidDeviceKey
            | Self::DeviceNotFound
            | Self::DeviceUnavailable(_) => StatusCode::BAD_REQUEST,
            Self::KeyCorrupted | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<KmsError> for ApiError {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::KeyCorrupted => Self::KeyCorrupted,
            KmsError::InvalidDeviceKey => Self::InvalidDeviceKey,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub code: i32,
    pub message: String,
    pub data: Value,
    pub request_id: String,
    pub timestamp: i64,
}

/// Per-request metadata available to every handler: the propagated request
/// id, the matched path for error logs, and the caller's ip.
#[derive(Debug, Clone)]
pub struct ReqMeta {
    pub request_id: String,
    pub path: String,
    pub client_ip: String,
}

impl<S> FromRequestParts<S> for ReqMeta
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self {
            request_id: parts
                .headers
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            path: parts.uri.path().to_string(),
            client_ip: super::middleware::client_ip(&parts.headers, &parts.extensions),
        })
    }
}

pub fn ok<T: Serialize>(request_id: &str, data: T) -> Response {
    let envelope = Envelope {
        code: CODE_OK,
        message: "success".to_string(),
        data: serde_json::to_value(data).unwrap_or(Value::Null),
        request_id: request_id.to_string(),
        timestamp: Utc::now().timestamp_millis(),
    };
    (StatusCode::OK, Json(envelope)).into_response()
}

pub fn fail(meta: &ReqMeta, err: &ApiError) -> Response {
    let status = err.http_status();
    if status.is_server_error() {
        // The envelope message stays generic; the cause goes to the log.
        error!(
            request_id = %meta.request_id,
            path = %meta.path,
            http_status = status.as_u16(),
            "request failed: {err:?}"
        );
    }
    let envelope = Envelope {
        code: err.code(),
        message: err.to_string(),
        data: Value::Null,
        request_id: meta.request_id.clone(),
        timestamp: Utc::now().timestamp_millis(),
    };
    let mut response = (status, Json(envelope)).into_response();
    if let ApiError::TooManyRequests { retry_after_secs } = err {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_to_status_mapping_is_deterministic() {
        assert_eq!(ApiError::AuthFailed.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::SessionExpired.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::AccountDisabled.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::NoPermission.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::TooManyRequests { retry_after_secs: 1 }.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::DeviceNotFound.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::RequestExpired.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom")).http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::KeyCorrupted.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_follow_their_families() {
        assert_eq!(ApiError::AuthFailed.code(), 1001);
        assert_eq!(ApiError::NoPermission.code(), 2001);
        assert_eq!(
            ApiError::TooManyRequests { retry_after_secs: 1 }.code(),
            3003
        );
        assert_eq!(ApiError::Param("x".into()).code(), 4001);
        assert_eq!(ApiError::Internal(anyhow::anyhow!("boom")).code(), 5001);
    }

    #[test]
    fn kms_errors_map_to_their_kinds() {
        assert_eq!(ApiError::from(KmsError::KeyCorrupted).code(), 5002);
        assert_eq!(ApiError::from(KmsError::InvalidDeviceKey).code(), 4003);
    }

    #[test]
    fn internal_message_is_redacted() {
        let err = ApiError::Internal(anyhow::anyhow!("dsn=postgres://secret"));
        assert_eq!(err.to_string(), "internal error");
    }
}
