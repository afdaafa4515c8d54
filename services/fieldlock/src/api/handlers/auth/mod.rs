//! Login and logout.
//!
//! The login flow is timing-equalized: an unknown phone burns a full dummy
//! hash so it is indistinguishable from a wrong password to an outside
//! observer. Neither the password nor its hash ever reaches a log line.

mod storage;

use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::{header::USER_AGENT, HeaderMap},
    response::Response,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::middleware::Identity;
use crate::api::response::{fail, ok, ApiError, ReqMeta};
use crate::api::AppState;
use crate::domain::models::{mask_phone, STATUS_DISABLED};
use crate::store::session::NewSession;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_USER_AGENT_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    phone: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
    user_uuid: Uuid,
    role: String,
    name: String,
}

pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match login_inner(&state, &meta, &headers, request).await {
        Ok(response) => ok(&meta.request_id, response),
        Err(err) => fail(&meta, &err),
    }
}

async fn login_inner(
    state: &AppState,
    meta: &ReqMeta,
    headers: &HeaderMap,
    request: LoginRequest,
) -> Result<LoginResponse, ApiError> {
    if request.phone.trim().is_empty() {
        return Err(ApiError::Param("phone is required".to_string()));
    }
    if request.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Param(
            "password must be at least 8 characters".to_string(),
        ));
    }

    info!(phone = %mask_phone(&request.phone), ip = %meta.client_ip, "login: attempt");

    let user = storage::find_login_user(&state.pool, &request.phone)
        .await
        .map_err(ApiError::Internal)?;

    let Some(user) = user else {
        // Equalize wall time with the wrong-password branch.
        let hasher = state.hasher.clone();
        let _ = tokio::task::spawn_blocking(move || hasher.dummy_verify()).await;
        info!(
            phone = %mask_phone(&request.phone),
            "login: failed, user not found (dummy verify executed)"
        );
        return Err(ApiError::AuthFailed);
    };

    let verified = {
        let hasher = state.hasher.clone();
        let password = request.password;
        let encoded = user.password_hash.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &encoded))
            .await
            .map_err(|err| ApiError::Internal(anyhow!("verify task failed: {err}")))?
    };
    match verified {
        Ok(true) => {}
        Ok(false) => {
            info!(
                phone = %mask_phone(&request.phone),
                user_id = user.id,
                "login: failed, invalid password"
            );
            return Err(ApiError::AuthFailed);
        }
        Err(err) => return Err(ApiError::Internal(err)),
    }

    if user.status == STATUS_DISABLED {
        info!(user_id = user.id, "login: rejected, account disabled");
        return Err(ApiError::AccountDisabled);
    }

    let session_id = Uuid::new_v4();
    let expires_at = Utc::now() + Duration::seconds(state.session_ttl_seconds);
    let user_agent: String = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .chars()
        .take(MAX_USER_AGENT_CHARS)
        .collect();

    state
        .sessions
        .create(&NewSession {
            session_id,
            user_id: user.id,
            role: user.role.clone(),
            expires_at,
            user_agent,
            ip_address: meta.client_ip.clone(),
        })
        .await
        .map_err(ApiError::Internal)?;

    let token = state.tokens.make(user.uuid, session_id);

    info!(
        user_id = user.id,
        role = %user.role,
        ip = %meta.client_ip,
        expires_at = %expires_at,
        "login: success"
    );

    Ok(LoginResponse {
        token,
        expires_at,
        user_uuid: user.uuid,
        role: user.role,
        name: user.name,
    })
}

pub async fn logout(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    meta: ReqMeta,
) -> Response {
    match state.sessions.delete_by_id(identity.session_id).await {
        Ok(()) => {
            info!(session_id = %identity.session_id, "logout: session invalidated");
            ok(&meta.request_id, ())
        }
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}
