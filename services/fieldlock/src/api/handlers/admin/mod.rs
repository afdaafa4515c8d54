//! Administrative surface: credentialing, device onboarding, permission
//! grants, and alert handling. Every route here sits behind the admin role
//! gate.

mod storage;

use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    response::Response,
    Json,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::middleware::Identity;
use crate::api::response::{fail, ok, ApiError, ReqMeta};
use crate::api::AppState;
use crate::domain::models::{
    Alert, AuditLog, DeviceView, Permission, UserView, DEVICE_TYPE_LOCK, ROLE_ADMIN, ROLE_USER,
    STATUS_DISABLED,
};
use crate::kms;
use crate::password::generate_random_password;

const GENERATED_PASSWORD_LEN: usize = 16;
const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

fn page_bounds(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, page_size)
}

fn valid_role(role: &str) -> bool {
    role == ROLE_USER || role == ROLE_ADMIN
}

fn valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (6..=19).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

// ==================== users ====================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    phone: String,
    name: String,
    role: String,
    #[serde(default)]
    department: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    user: UserView,
    /// Returned exactly once; never persisted in the clear.
    initial_password: String,
}

pub async fn create_user(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match create_user_inner(&state, &operator, request).await {
        Ok(response) => ok(&meta.request_id, response),
        Err(err) => fail(&meta, &err),
    }
}

async fn create_user_inner(
    state: &AppState,
    operator: &Identity,
    request: CreateUserRequest,
) -> Result<CreateUserResponse, ApiError> {
    if !valid_phone(&request.phone) {
        return Err(ApiError::Param("phone must be 6-19 digits".to_string()));
    }
    if request.name.trim().is_empty() || request.name.len() > 50 {
        return Err(ApiError::Param("name must be 1..=50 characters".to_string()));
    }
    if !valid_role(&request.role) {
        return Err(ApiError::Param(
            "role must be \"user\" or \"admin\"".to_string(),
        ));
    }

    let initial_password = generate_random_password(GENERATED_PASSWORD_LEN);
    let password_hash = {
        let hasher = state.hasher.clone();
        let password = initial_password.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|err| ApiError::Internal(anyhow!("hash task failed: {err}")))?
            .map_err(ApiError::Internal)?
    };

    let user = storage::insert_user(&state.pool, &request, &password_hash)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Param("phone is already registered".to_string()))?;

    info!(
        user_id = user.id,
        user_uuid = %user.uuid,
        role = %user.role,
        operator_id = operator.user_id,
        "create_user: success"
    );

    Ok(CreateUserResponse {
        user: UserView::from(user),
        initial_password,
    })
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    status: Option<i16>,
}

pub async fn update_user(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    Path(user_uuid): Path<Uuid>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match update_user_inner(&state, &operator, user_uuid, request).await {
        Ok(()) => ok(&meta.request_id, ()),
        Err(err) => fail(&meta, &err),
    }
}

async fn update_user_inner(
    state: &AppState,
    operator: &Identity,
    user_uuid: Uuid,
    request: UpdateUserRequest,
) -> Result<(), ApiError> {
    if let Some(role) = request.role.as_deref() {
        if !valid_role(role) {
            return Err(ApiError::Param(
                "role must be \"user\" or \"admin\"".to_string(),
            ));
        }
    }
    if let Some(status) = request.status {
        if !(0..=1).contains(&status) {
            return Err(ApiError::Param("status must be 0 or 1".to_string()));
        }
    }

    let user_id = storage::update_user(&state.pool, user_uuid, &request)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Param("user not found".to_string()))?;

    if request.status == Some(STATUS_DISABLED) {
        // Disabling revokes every live session so the invariant converges
        // without waiting for the gateway path.
        state
            .sessions
            .delete_by_user(user_id)
            .await
            .map_err(ApiError::Internal)?;
        info!(user_id, user_uuid = %user_uuid, "update_user: user disabled, sessions cleared");
    }

    info!(
        user_id,
        user_uuid = %user_uuid,
        operator_id = operator.user_id,
        "update_user: success"
    );
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordResponse {
    initial_password: String,
}

pub async fn reset_password(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    Path(user_uuid): Path<Uuid>,
) -> Response {
    match reset_password_inner(&state, &operator, user_uuid).await {
        Ok(response) => ok(&meta.request_id, response),
        Err(err) => fail(&meta, &err),
    }
}

async fn reset_password_inner(
    state: &AppState,
    operator: &Identity,
    user_uuid: Uuid,
) -> Result<ResetPasswordResponse, ApiError> {
    let initial_password = generate_random_password(GENERATED_PASSWORD_LEN);
    let password_hash = {
        let hasher = state.hasher.clone();
        let password = initial_password.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|err| ApiError::Internal(anyhow!("hash task failed: {err}")))?
            .map_err(ApiError::Internal)?
    };

    let user_id = storage::update_password(&state.pool, user_uuid, &password_hash)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Param("user not found".to_string()))?;

    // A reset invalidates every outstanding session.
    state
        .sessions
        .delete_by_user(user_id)
        .await
        .map_err(ApiError::Internal)?;

    info!(
        user_id,
        user_uuid = %user_uuid,
        operator_id = operator.user_id,
        "reset_password: success"
    );
    Ok(ResetPasswordResponse { initial_password })
}

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    role: Option<String>,
    status: Option<i16>,
    search: Option<String>,
}

pub async fn list_users(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    Query(query): Query<UserListQuery>,
) -> Response {
    let (page, page_size) = page_bounds(query.page, query.page_size);
    match storage::list_users(&state.pool, page, page_size, &query).await {
        Ok((users, total)) => {
            let items: Vec<UserView> = users.into_iter().map(UserView::from).collect();
            ok(
                &meta.request_id,
                Paged {
                    items,
                    total,
                    page,
                    page_size,
                },
            )
        }
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}

// ==================== devices ====================

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    device_id: String,
    name: String,
    #[serde(default)]
    location_text: Option<String>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    pipeline_tag: Option<String>,
    #[serde(default)]
    risk_level: Option<i16>,
    /// 32 lowercase hex characters (AES-128).
    device_key: String,
}

pub async fn create_device(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    payload: Result<Json<CreateDeviceRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match create_device_inner(&state, &operator, request).await {
        Ok(device) => ok(&meta.request_id, device),
        Err(err) => fail(&meta, &err),
    }
}

async fn create_device_inner(
    state: &AppState,
    operator: &Identity,
    request: CreateDeviceRequest,
) -> Result<DeviceView, ApiError> {
    if request.device_id.is_empty() || request.device_id.len() > 32 {
        return Err(ApiError::Param(
            "device_id must be 1..=32 characters".to_string(),
        ));
    }
    if request.name.trim().is_empty() || request.name.len() > 100 {
        return Err(ApiError::Param("name must be 1..=100 characters".to_string()));
    }
    if let Some(risk_level) = request.risk_level {
        if !(1..=3).contains(&risk_level) {
            return Err(ApiError::Param("risk_level must be 1, 2 or 3".to_string()));
        }
    }

    // Parse, wrap, forget: the plaintext key is zeroed when this scope ends.
    let key = kms::parse_device_key(request.device_key.trim())?;
    let key_encrypted = state.kms.wrap(&key[..]).map_err(ApiError::Internal)?;

    let device = storage::insert_device(&state.pool, &request, &key_encrypted)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Param("device_id already exists".to_string()))?;

    info!(
        device_id = %device.device_id,
        operator_id = operator.user_id,
        "create_device: success"
    );
    Ok(DeviceView::from(device))
}

#[derive(Debug, Deserialize)]
pub struct DeviceListQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    status: Option<i16>,
    pipeline_tag: Option<String>,
    search: Option<String>,
}

pub async fn list_devices(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    Query(query): Query<DeviceListQuery>,
) -> Response {
    let (page, page_size) = page_bounds(query.page, query.page_size);
    match storage::list_devices(&state.pool, page, page_size, &query).await {
        Ok((devices, total)) => {
            let items: Vec<DeviceView> = devices.into_iter().map(DeviceView::from).collect();
            ok(
                &meta.request_id,
                Paged {
                    items,
                    total,
                    page,
                    page_size,
                },
            )
        }
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}

// ==================== permissions ====================

#[derive(Debug, Deserialize)]
pub struct GrantPermissionRequest {
    user_id: i64,
    #[serde(default)]
    device_type: Option<String>,
    device_id: String,
    #[serde(default)]
    valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

pub async fn grant_permission(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    payload: Result<Json<GrantPermissionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match grant_permission_inner(&state, &operator, request).await {
        Ok(()) => ok(&meta.request_id, ()),
        Err(err) => fail(&meta, &err),
    }
}

async fn grant_permission_inner(
    state: &AppState,
    operator: &Identity,
    request: GrantPermissionRequest,
) -> Result<(), ApiError> {
    let device_type = request
        .device_type
        .as_deref()
        .unwrap_or(DEVICE_TYPE_LOCK)
        .to_string();
    if device_type != DEVICE_TYPE_LOCK {
        return Err(ApiError::Param("unknown device_type".to_string()));
    }
    if request.device_id.is_empty() || request.device_id.len() > 32 {
        return Err(ApiError::Param(
            "device_id must be 1..=32 characters".to_string(),
        ));
    }
    let valid_from = request.valid_from.unwrap_or_else(Utc::now);
    if let Some(valid_until) = request.valid_until {
        if valid_until <= valid_from {
            return Err(ApiError::Param(
                "valid_until must be after valid_from".to_string(),
            ));
        }
    }

    storage::grant_permission(
        &state.pool,
        &request,
        &device_type,
        valid_from,
        operator.user_id,
    )
    .await?;

    info!(
        user_id = request.user_id,
        device_id = %request.device_id,
        operator_id = operator.user_id,
        "grant_permission: success"
    );
    Ok(())
}

pub async fn revoke_permission(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    Path(permission_id): Path<i64>,
) -> Response {
    match storage::revoke_permission(&state.pool, permission_id, operator.user_id).await {
        Ok(true) => {
            info!(
                permission_id,
                operator_id = operator.user_id,
                "revoke_permission: success"
            );
            ok(&meta.request_id, ())
        }
        Ok(false) => fail(
            &meta,
            &ApiError::Param("permission not found or already revoked".to_string()),
        ),
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct PermissionListQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    user_id: Option<i64>,
    device_id: Option<String>,
    status: Option<i16>,
}

pub async fn list_permissions(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    Query(query): Query<PermissionListQuery>,
) -> Response {
    let (page, page_size) = page_bounds(query.page, query.page_size);
    match storage::list_permissions(&state.pool, page, page_size, &query).await {
        Ok((items, total)) => ok(
            &meta.request_id,
            Paged::<Permission> {
                items,
                total,
                page,
                page_size,
            },
        ),
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}

// ==================== alerts ====================

#[derive(Debug, Deserialize)]
pub struct HandleAlertRequest {
    handle_note: String,
    #[serde(default)]
    unlock_device: bool,
}

pub async fn handle_alert(
    Extension(state): Extension<Arc<AppState>>,
    Extension(operator): Extension<Identity>,
    meta: ReqMeta,
    Path(alert_id): Path<i64>,
    payload: Result<Json<HandleAlertRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match handle_alert_inner(&state, &operator, alert_id, request).await {
        Ok(()) => ok(&meta.request_id, ()),
        Err(err) => fail(&meta, &err),
    }
}

async fn handle_alert_inner(
    state: &AppState,
    operator: &Identity,
    alert_id: i64,
    request: HandleAlertRequest,
) -> Result<(), ApiError> {
    if request.handle_note.trim().is_empty() {
        return Err(ApiError::Param("handle_note is required".to_string()));
    }

    let handled = storage::handle_alert(
        &state.pool,
        alert_id,
        &request.handle_note,
        request.unlock_device,
        operator.user_id,
    )
    .await
    .map_err(ApiError::Internal)?;
    if !handled {
        return Err(ApiError::Param(
            "alert not found or already handled".to_string(),
        ));
    }

    info!(
        alert_id,
        unlock_device = request.unlock_device,
        operator_id = operator.user_id,
        "handle_alert: success"
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct AlertListQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    status: Option<i16>,
    severity: Option<i16>,
    device_id: Option<String>,
}

pub async fn list_alerts(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    Query(query): Query<AlertListQuery>,
) -> Response {
    let (page, page_size) = page_bounds(query.page, query.page_size);
    match storage::list_alerts(&state.pool, page, page_size, &query).await {
        Ok((items, total)) => ok(
            &meta.request_id,
            Paged::<Alert> {
                items,
                total,
                page,
                page_size,
            },
        ),
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}

// ==================== audit logs ====================

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    user_id: Option<i64>,
    device_id: Option<String>,
    action: Option<String>,
    /// Epoch millis, inclusive lower bound.
    start_ms: Option<i64>,
    /// Epoch millis, exclusive upper bound.
    end_ms: Option<i64>,
    /// Opaque cursor from a previous page (epoch millis).
    cursor: Option<String>,
    limit: Option<i64>,
}

pub async fn list_audit_logs(
    Extension(state): Extension<Arc<AppState>>,
    meta: ReqMeta,
    Query(query): Query<AuditLogQuery>,
) -> Response {
    match list_audit_logs_inner(&state, query).await {
        Ok(page) => ok(&meta.request_id, page),
        Err(err) => fail(&meta, &err),
    }
}

async fn list_audit_logs_inner(
    state: &AppState,
    query: AuditLogQuery,
) -> Result<CursorPage<AuditLog>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let cursor = match query.cursor.as_deref() {
        None => None,
        Some(raw) => {
            let millis: i64 = raw
                .parse()
                .map_err(|_| ApiError::Param("invalid cursor".to_string()))?;
            Some(
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| ApiError::Param("invalid cursor".to_string()))?,
            )
        }
    };

    let mut items = storage::list_audit_logs(&state.pool, &query, cursor, limit + 1)
        .await
        .map_err(ApiError::Internal)?;

    let has_more = items.len() as i64 > limit;
    if has_more {
        items.truncate(limit as usize);
    }
    let next_cursor = has_more
        .then(|| items.last().map(|log| log.occurred_at.timestamp_millis().to_string()))
        .flatten();

    Ok(CursorPage {
        items,
        next_cursor,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_clamp() {
        assert_eq!(page_bounds(None, None), (1, 20));
        assert_eq!(page_bounds(Some(0), Some(0)), (1, 1));
        assert_eq!(page_bounds(Some(-3), Some(1000)), (1, 100));
        assert_eq!(page_bounds(Some(5), Some(50)), (5, 50));
    }

    #[test]
    fn role_validation() {
        assert!(valid_role("user"));
        assert!(valid_role("admin"));
        assert!(!valid_role("root"));
        assert!(!valid_role(""));
    }

    #[test]
    fn phone_validation() {
        assert!(valid_phone("13800001111"));
        assert!(valid_phone("+8613800001111"));
        assert!(!valid_phone("138-0000-1111"));
        assert!(!valid_phone("123"));
        assert!(!valid_phone(""));
    }
}
