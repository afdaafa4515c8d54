//! Database helpers for the administrative surface.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::Instrument;

use super::{
    AlertListQuery, AuditLogQuery, CreateDeviceRequest, CreateUserRequest, DeviceListQuery,
    GrantPermissionRequest, PermissionListQuery, UpdateUserRequest, UserListQuery,
};
use crate::api::response::ApiError;
use crate::domain::models::{
    Alert, AuditLog, Device, Permission, User, ALERT_TYPE_CONSECUTIVE_FAIL, DEVICE_TYPE_LOCK,
};

const USER_COLUMNS: &str =
    "id, uuid, phone, password_hash, name, department, role, status, created_at, updated_at";
const DEVICE_COLUMNS: &str = "id, device_id, name, location_text, longitude, latitude, \
     pipeline_tag, risk_level, key_version, status, last_active_at, created_at, updated_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

// ==================== users ====================

/// Insert a new user. Returns `None` when the phone is already registered
/// among non-deleted rows.
pub(super) async fn insert_user(
    pool: &PgPool,
    request: &CreateUserRequest,
    password_hash: &str,
) -> Result<Option<User>> {
    let query = format!(
        r"
        INSERT INTO users (phone, password_hash, name, department, role)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {USER_COLUMNS}
        "
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = "INSERT INTO users"
    );
    let result = sqlx::query_as::<_, User>(&query)
        .bind(&request.phone)
        .bind(password_hash)
        .bind(&request.name)
        .bind(&request.department)
        .bind(&request.role)
        .fetch_one(pool)
        .instrument(span)
        .await;

    match result {
        Ok(user) => Ok(Some(user)),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err).context("failed to insert user"),
    }
}

/// Patch a user in place. Returns the internal id, or `None` if no live row
/// matched.
pub(super) async fn update_user(
    pool: &PgPool,
    user_uuid: uuid::Uuid,
    request: &UpdateUserRequest,
) -> Result<Option<i64>> {
    let query = r"
        UPDATE users
        SET name = COALESCE($2, name),
            department = COALESCE($3, department),
            role = COALESCE($4, role),
            status = COALESCE($5, status),
            updated_at = NOW()
        WHERE uuid = $1 AND deleted_at IS NULL
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_uuid)
        .bind(&request.name)
        .bind(&request.department)
        .bind(&request.role)
        .bind(request.status)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to update user")?;
    Ok(row.map(|row| row.get("id")))
}

pub(super) async fn update_password(
    pool: &PgPool,
    user_uuid: uuid::Uuid,
    password_hash: &str,
) -> Result<Option<i64>> {
    let query = r"
        UPDATE users
        SET password_hash = $2, updated_at = NOW()
        WHERE uuid = $1 AND deleted_at IS NULL
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_uuid)
        .bind(password_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to update password")?;
    Ok(row.map(|row| row.get("id")))
}

pub(super) async fn list_users(
    pool: &PgPool,
    page: i64,
    page_size: i64,
    query: &UserListQuery,
) -> Result<(Vec<User>, i64)> {
    fn push_filters<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, query: &'a UserListQuery) {
        if let Some(role) = &query.role {
            builder.push(" AND role = ").push_bind(role);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(search) = &query.search {
            let pattern = format!("%{search}%");
            builder
                .push(" AND (name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR phone LIKE ")
                .push_bind(pattern)
                .push(")");
        }
    }

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM users WHERE deleted_at IS NULL");
    push_filters(&mut count, query);
    let total: i64 = count
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .context("failed to count users")?;

    let mut list = QueryBuilder::new(format!(
        "SELECT {USER_COLUMNS} FROM users WHERE deleted_at IS NULL"
    ));
    push_filters(&mut list, query);
    list.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind((page - 1) * page_size);
    let items = list
        .build_query_as::<User>()
        .fetch_all(pool)
        .await
        .context("failed to list users")?;

    Ok((items, total))
}

// ==================== devices ====================

/// Insert a device with its wrapped key. Returns `None` when the device id is
/// already taken among non-deleted rows.
pub(super) async fn insert_device(
    pool: &PgPool,
    request: &CreateDeviceRequest,
    key_encrypted: &[u8],
) -> Result<Option<Device>> {
    let query = format!(
        r"
        INSERT INTO devices
            (device_id, name, location_text, longitude, latitude, pipeline_tag,
             risk_level, key_encrypted, key_version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
        RETURNING {DEVICE_COLUMNS}
        "
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = "INSERT INTO devices"
    );
    let result = sqlx::query_as::<_, Device>(&query)
        .bind(&request.device_id)
        .bind(&request.name)
        .bind(request.location_text.as_deref().unwrap_or_default())
        .bind(request.longitude)
        .bind(request.latitude)
        .bind(&request.pipeline_tag)
        .bind(request.risk_level.unwrap_or(1))
        .bind(key_encrypted)
        .fetch_one(pool)
        .instrument(span)
        .await;

    match result {
        Ok(device) => Ok(Some(device)),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err).context("failed to insert device"),
    }
}

pub(super) async fn list_devices(
    pool: &PgPool,
    page: i64,
    page_size: i64,
    query: &DeviceListQuery,
) -> Result<(Vec<Device>, i64)> {
    fn push_filters<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, query: &'a DeviceListQuery) {
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(tag) = &query.pipeline_tag {
            builder.push(" AND pipeline_tag = ").push_bind(tag);
        }
        if let Some(search) = &query.search {
            let pattern = format!("%{search}%");
            builder
                .push(" AND (device_id ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR name ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
    }

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM devices WHERE deleted_at IS NULL");
    push_filters(&mut count, query);
    let total: i64 = count
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .context("failed to count devices")?;

    let mut list = QueryBuilder::new(format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE deleted_at IS NULL"
    ));
    push_filters(&mut list, query);
    list.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind((page - 1) * page_size);
    let items = list
        .build_query_as::<Device>()
        .fetch_all(pool)
        .await
        .context("failed to list devices")?;

    Ok((items, total))
}

// ==================== permissions ====================

/// Grant or extend a permission. Re-granting an active permission updates
/// `valid_until` in place; the partial unique index makes a duplicate insert
/// impossible either way.
pub(super) async fn grant_permission(
    pool: &PgPool,
    request: &GrantPermissionRequest,
    device_type: &str,
    valid_from: DateTime<Utc>,
    operator_id: i64,
) -> Result<(), ApiError> {
    let existing = sqlx::query(
        r"
        SELECT id FROM permissions
        WHERE user_id = $1 AND device_type = $2 AND device_id = $3 AND status = 1
        ",
    )
    .bind(request.user_id)
    .bind(device_type)
    .bind(&request.device_id)
    .fetch_optional(pool)
    .await
    .context("failed to lookup existing permission")
    .map_err(ApiError::Internal)?;

    if let Some(row) = existing {
        let permission_id: i64 = row.get("id");
        sqlx::query("UPDATE permissions SET valid_until = $2 WHERE id = $1")
            .bind(permission_id)
            .bind(request.valid_until)
            .execute(pool)
            .await
            .context("failed to extend permission")
            .map_err(ApiError::Internal)?;
        return Ok(());
    }

    let user_exists: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = $1 AND deleted_at IS NULL")
            .bind(request.user_id)
            .fetch_one(pool)
            .await
            .context("failed to check user existence")
            .map_err(ApiError::Internal)?;
    if user_exists == 0 {
        return Err(ApiError::Param("user not found".to_string()));
    }

    let device_exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM devices WHERE device_id = $1 AND deleted_at IS NULL",
    )
    .bind(&request.device_id)
    .fetch_one(pool)
    .await
    .context("failed to check device existence")
    .map_err(ApiError::Internal)?;
    if device_exists == 0 {
        return Err(ApiError::Param("device not found".to_string()));
    }

    sqlx::query(
        r"
        INSERT INTO permissions
            (user_id, device_type, device_id, granted_by, valid_from, valid_until, status)
        VALUES ($1, $2, $3, $4, $5, $6, 1)
        ",
    )
    .bind(request.user_id)
    .bind(device_type)
    .bind(&request.device_id)
    .bind(operator_id)
    .bind(valid_from)
    .bind(request.valid_until)
    .execute(pool)
    .await
    .context("failed to insert permission")
    .map_err(ApiError::Internal)?;

    Ok(())
}

/// Revoke an active permission. Returns false when no active row matched.
pub(super) async fn revoke_permission(
    pool: &PgPool,
    permission_id: i64,
    operator_id: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE permissions
        SET status = 0, revoked_by = $2, revoked_at = NOW()
        WHERE id = $1 AND status = 1
        ",
    )
    .bind(permission_id)
    .bind(operator_id)
    .execute(pool)
    .await
    .context("failed to revoke permission")?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn list_permissions(
    pool: &PgPool,
    page: i64,
    page_size: i64,
    query: &PermissionListQuery,
) -> Result<(Vec<Permission>, i64)> {
    fn push_filters<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, query: &'a PermissionListQuery) {
        if let Some(user_id) = query.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(device_id) = &query.device_id {
            builder.push(" AND device_id = ").push_bind(device_id);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
    }

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM permissions WHERE TRUE");
    push_filters(&mut count, query);
    let total: i64 = count
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .context("failed to count permissions")?;

    let mut list = QueryBuilder::new(
        "SELECT id, user_id, device_type, device_id, granted_by, valid_from, valid_until, \
         status, revoked_by, revoked_at, created_at FROM permissions WHERE TRUE",
    );
    push_filters(&mut list, query);
    list.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind((page - 1) * page_size);
    let items = list
        .build_query_as::<Permission>()
        .fetch_all(pool)
        .await
        .context("failed to list permissions")?;

    Ok((items, total))
}

// ==================== alerts ====================

/// Handle an open alert and, when asked, release the quarantined device in
/// the same transaction. Returns false when the alert is absent or already
/// handled.
pub(super) async fn handle_alert(
    pool: &PgPool,
    alert_id: i64,
    handle_note: &str,
    unlock_device: bool,
    operator_id: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("begin alert-handle transaction")?;

    let row = sqlx::query(
        r"
        UPDATE alerts
        SET status = 1, handled_by = $2, handle_note = $3, handled_at = NOW()
        WHERE id = $1 AND status = 0
        RETURNING alert_type, device_type, device_id
        ",
    )
    .bind(alert_id)
    .bind(operator_id)
    .bind(handle_note)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to mark alert handled")?;

    let Some(row) = row else {
        tx.rollback().await.ok();
        return Ok(false);
    };

    let alert_type: String = row.get("alert_type");
    let device_type: String = row.get("device_type");
    let device_id: String = row.get("device_id");

    // Only the alert-handling path releases a quarantined device.
    if unlock_device && alert_type == ALERT_TYPE_CONSECUTIVE_FAIL && device_type == DEVICE_TYPE_LOCK {
        sqlx::query(
            r"
            UPDATE devices
            SET status = 1, updated_at = NOW()
            WHERE device_id = $1 AND status = 2 AND deleted_at IS NULL
            ",
        )
        .bind(&device_id)
        .execute(&mut *tx)
        .await
        .context("failed to reactivate device")?;
    }

    tx.commit().await.context("commit alert-handle transaction")?;
    Ok(true)
}

pub(super) async fn list_alerts(
    pool: &PgPool,
    page: i64,
    page_size: i64,
    query: &AlertListQuery,
) -> Result<(Vec<Alert>, i64)> {
    fn push_filters<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, query: &'a AlertListQuery) {
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(severity) = query.severity {
            builder.push(" AND severity = ").push_bind(severity);
        }
        if let Some(device_id) = &query.device_id {
            builder.push(" AND device_id = ").push_bind(device_id);
        }
    }

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM alerts WHERE TRUE");
    push_filters(&mut count, query);
    let total: i64 = count
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .context("failed to count alerts")?;

    let mut list = QueryBuilder::new(
        "SELECT id, alert_type, device_type, device_id, user_id, severity, status, \
         handled_by, handle_note, extra, created_at, handled_at FROM alerts WHERE TRUE",
    );
    push_filters(&mut list, query);
    list.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind((page - 1) * page_size);
    let items = list
        .build_query_as::<Alert>()
        .fetch_all(pool)
        .await
        .context("failed to list alerts")?;

    Ok((items, total))
}

// ==================== audit logs ====================

pub(super) async fn list_audit_logs(
    pool: &PgPool,
    query: &AuditLogQuery,
    cursor: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<AuditLog>> {
    let mut list = QueryBuilder::new(
        "SELECT id, user_id, device_id, device_type, action, result_code, client_ip, \
         device_model, extra, occurred_at FROM audit_logs WHERE TRUE",
    );
    if let Some(user_id) = query.user_id {
        list.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(device_id) = &query.device_id {
        list.push(" AND device_id = ").push_bind(device_id);
    }
    if let Some(action) = &query.action {
        list.push(" AND action = ").push_bind(action);
    }
    if let Some(start_ms) = query.start_ms {
        if let Some(start) = Utc.timestamp_millis_opt(start_ms).single() {
            list.push(" AND occurred_at >= ").push_bind(start);
        }
    }
    if let Some(end_ms) = query.end_ms {
        if let Some(end) = Utc.timestamp_millis_opt(end_ms).single() {
            list.push(" AND occurred_at < ").push_bind(end);
        }
    }
    if let Some(cursor) = cursor {
        list.push(" AND occurred_at < ").push_bind(cursor);
    }
    list.push(" ORDER BY occurred_at DESC LIMIT ").push_bind(limit);

    list.build_query_as::<AuditLog>()
        .fetch_all(pool)
        .await
        .context("failed to list audit logs")
}
