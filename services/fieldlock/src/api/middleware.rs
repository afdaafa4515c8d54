//! Gateway layers: bearer-session validation, role and rate gates, security
//! headers, and panic recovery.

use std::any::Any;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Extension, Request},
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
        Extensions, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::response::{fail, ApiError, Envelope, ReqMeta, CODE_INTERNAL};
use super::AppState;
use crate::domain::models::{ROLE_ADMIN, STATUS_DISABLED};
use crate::store::rate::{Gate, RateDecision, GLOBAL_IP_GATE, LOGIN_IP_GATE};

/// Authenticated caller, resolved by [`require_session`] and read by handlers
/// via `Extension<Identity>`.
///
/// The role is the live user row's role, not the login-time snapshot, so a
/// demotion takes effect on the next request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub user_uuid: Uuid,
    pub role: String,
    pub session_id: Uuid,
}

/// Resolve the caller's ip: proxy headers first, then the socket peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return ip.to_string();
    }
    extensions
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// Bearer-token and session validation for every protected route.
///
/// Parse the token, check session expiry in the store, then re-fetch the user.
/// A soft-deleted or disabled user gets all their sessions purged on this path
/// so the invariant converges, and the gateway answers 401 regardless of the
/// business code.
pub async fn require_session(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return fail(&meta, &ApiError::SessionExpired);
    };
    // An unverifiable token never reaches the session store.
    let Ok(claims) = state.tokens.parse(token) else {
        return fail(&meta, &ApiError::SessionExpired);
    };

    let session = match state.sessions.find_by_id(claims.session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return fail(&meta, &ApiError::SessionExpired),
        Err(err) => return fail(&meta, &ApiError::Internal(err)),
    };

    let user = match fetch_live_user(&state.pool, session.user_id).await {
        Ok(user) => user,
        Err(err) => return fail(&meta, &ApiError::Internal(err)),
    };
    let Some(user) = user else {
        return reject_disabled(&state, &meta, session.user_id).await;
    };
    if user.status == STATUS_DISABLED {
        return reject_disabled(&state, &meta, session.user_id).await;
    }

    req.extensions_mut().insert(Identity {
        user_id: user.id,
        user_uuid: user.uuid,
        role: user.role,
        session_id: claims.session_id,
    });
    next.run(req).await
}

struct LiveUser {
    id: i64,
    uuid: Uuid,
    role: String,
    status: i16,
}

async fn fetch_live_user(pool: &PgPool, user_id: i64) -> anyhow::Result<Option<LiveUser>> {
    use anyhow::Context;
    let row: Option<(i64, Uuid, String, i16)> = sqlx::query_as(
        "SELECT id, uuid, role, status FROM users WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch user for session validation")?;
    Ok(row.map(|(id, uuid, role, status)| LiveUser {
        id,
        uuid,
        role,
        status,
    }))
}

async fn reject_disabled(state: &AppState, meta: &ReqMeta, user_id: i64) -> Response {
    match state.sessions.delete_by_user(user_id).await {
        Ok(count) if count > 0 => {
            info!(user_id, count, "purged sessions of disabled user");
        }
        Ok(_) => {}
        Err(err) => warn!(user_id, "failed to purge sessions of disabled user: {err:#}"),
    }
    // The gateway path answers 401, not the 403 the login flow uses.
    let mut response = fail(meta, &ApiError::AccountDisabled);
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Admin-only gate; expects [`require_session`] to have run first.
pub async fn require_admin(meta: ReqMeta, req: Request, next: Next) -> Response {
    match req.extensions().get::<Identity>() {
        Some(identity) if identity.role == ROLE_ADMIN => next.run(req).await,
        Some(_) => fail(&meta, &ApiError::Forbidden),
        None => fail(&meta, &ApiError::SessionExpired),
    }
}

/// Global per-ip gate: 100 requests / 60 s, behind the ip-block table.
pub async fn global_rate_gate(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    req: Request,
    next: Next,
) -> Response {
    match enforce_ip_gate(&state, &meta, GLOBAL_IP_GATE).await {
        Ok(()) => next.run(req).await,
        Err(err) => fail(&meta, &err),
    }
}

/// Login-specific per-ip gate: 10 attempts / 60 s.
pub async fn login_rate_gate(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    req: Request,
    next: Next,
) -> Response {
    match enforce_ip_gate(&state, &meta, LOGIN_IP_GATE).await {
        Ok(()) => next.run(req).await,
        Err(err) => fail(&meta, &err),
    }
}

async fn enforce_ip_gate(state: &AppState, meta: &ReqMeta, gate: Gate) -> Result<(), ApiError> {
    // The block table wins before any counter is touched.
    match state.rates.ip_blocked(&meta.client_ip).await {
        Ok(true) => {
            info!(ip = %meta.client_ip, "request denied, ip is blocked");
            return Err(ApiError::TooManyRequests {
                retry_after_secs: gate.window_secs,
            });
        }
        Ok(false) => {}
        // Fail open: a broken limiter must not take the whole service down.
        Err(err) => {
            warn!("ip block check failed, allowing request: {err:#}");
            return Ok(());
        }
    }

    match state
        .rates
        .increment_and_check(&gate.key(&meta.client_ip), gate.window_secs, gate.limit)
        .await
    {
        Ok(RateDecision::Allow) => Ok(()),
        Ok(RateDecision::Deny { retry_after_secs }) => {
            info!(ip = %meta.client_ip, prefix = gate.prefix, "rate limit exceeded");
            Err(ApiError::TooManyRequests { retry_after_secs })
        }
        Err(err) => {
            warn!("rate counter failed, allowing request: {err:#}");
            Ok(())
        }
    }
}

/// Baseline security response headers on every reply.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("0"),
    );
    response
}

/// Outermost recovery: a panicking handler becomes an `Internal` envelope
/// instead of a closed connection.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("opaque panic payload");
    error!("handler panicked: {detail}");

    let envelope = Envelope {
        code: CODE_INTERNAL,
        message: "internal error".to_string(),
        data: Value::Null,
        request_id: String::new(),
        timestamp: Utc::now().timestamp_millis(),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, &Extensions::new()), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, &Extensions::new()), "9.9.9.9");

        let headers = HeaderMap::new();
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(std::net::SocketAddr::from((
            [127, 0, 0, 1],
            4000,
        ))));
        assert_eq!(client_ip(&headers, &extensions), "127.0.0.1");

        assert_eq!(client_ip(&headers, &Extensions::new()), "");
    }
}
