//! The unlock trust path: device listing, challenge derivation, and outcome
//! reporting with quarantine on repeated failure.

mod storage;

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::handlers::{publish_audit, publish_notify};
use crate::api::middleware::Identity;
use crate::api::response::{fail, ok, ApiError, ReqMeta};
use crate::api::AppState;
use crate::domain::models::{
    DeviceView, ALERT_TYPE_CONSECUTIVE_FAIL, DEVICE_TYPE_LOCK, STATUS_ACTIVE, STATUS_QUARANTINED,
};
use crate::kms;
use crate::mq::{AuditMessage, NotifyMessage};
use crate::store::rate::{RateDecision, CHALLENGE_DEVICE_GATE};

const MAX_DEVICE_ID_LEN: usize = 32;
const CHALLENGE_HEX_LEN: usize = 16;
/// Maximum accepted clock drift between handset and server. Matches the
/// freshness horizon the lock firmware enforces on its side.
const FRESHNESS_WINDOW_SECS: i64 = 30;
/// Consecutive failures before a device is quarantined.
const QUARANTINE_THRESHOLD: i32 = 3;

#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    device_id: String,
    challenge_c: String,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    device_id: String,
    result: String,
    #[serde(default)]
    fail_reason: Option<String>,
    occurred_at: i64,
    #[serde(default)]
    device_model: Option<String>,
}

/// Devices the caller currently holds an effective permission for.
pub async fn devices(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    meta: ReqMeta,
) -> Response {
    match storage::authorized_devices(&state.pool, identity.user_id).await {
        Ok(devices) => {
            let views: Vec<DeviceView> = devices.into_iter().map(DeviceView::from).collect();
            ok(&meta.request_id, views)
        }
        Err(err) => fail(&meta, &ApiError::Internal(err)),
    }
}

pub async fn challenge(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    meta: ReqMeta,
    payload: Result<Json<ChallengeRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match challenge_inner(&state, &identity, &meta, request).await {
        Ok(response) => ok(&meta.request_id, response),
        Err(err) => fail(&meta, &err),
    }
}

async fn challenge_inner(
    state: &AppState,
    identity: &Identity,
    meta: &ReqMeta,
    request: ChallengeRequest,
) -> Result<ChallengeResponse, ApiError> {
    info!(
        user_id = identity.user_id,
        device_id = %request.device_id,
        client_ip = %meta.client_ip,
        "challenge: start"
    );

    if request.device_id.is_empty() || request.device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ApiError::Param(
            "device_id must be 1..=32 characters".to_string(),
        ));
    }

    // Per-device gate: 5 challenges per device per minute, keyed on the
    // parsed body rather than any transport detail.
    match state
        .rates
        .increment_and_check(
            &CHALLENGE_DEVICE_GATE.key(&request.device_id),
            CHALLENGE_DEVICE_GATE.window_secs,
            CHALLENGE_DEVICE_GATE.limit,
        )
        .await
    {
        Ok(RateDecision::Allow) => {}
        Ok(RateDecision::Deny { retry_after_secs }) => {
            info!(device_id = %request.device_id, "challenge: rejected, device rate limited");
            return Err(ApiError::TooManyRequests { retry_after_secs });
        }
        Err(err) => warn!("challenge rate counter failed, allowing request: {err:#}"),
    }

    let challenge = decode_challenge(&request.challenge_c).ok_or_else(|| {
        info!(
            user_id = identity.user_id,
            device_id = %request.device_id,
            "challenge: rejected, invalid challenge_c"
        );
        ApiError::Param("challenge_c must be 16 hex characters (8 bytes)".to_string())
    })?;

    // Freshness before any device row is read.
    let server_now = Utc::now().timestamp();
    if (server_now - request.timestamp).abs() > FRESHNESS_WINDOW_SECS {
        info!(
            user_id = identity.user_id,
            device_id = %request.device_id,
            client_ts = request.timestamp,
            server_ts = server_now,
            "challenge: rejected, timestamp drift"
        );
        return Err(ApiError::RequestExpired);
    }

    let device = storage::find_device_for_challenge(&state.pool, &request.device_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| {
            info!(
                user_id = identity.user_id,
                device_id = %request.device_id,
                "challenge: rejected, device not found"
            );
            ApiError::DeviceNotFound
        })?;

    if device.status != STATUS_ACTIVE {
        info!(
            device_id = %request.device_id,
            device_status = device.status,
            "challenge: rejected, device unavailable"
        );
        let message = if device.status == STATUS_QUARANTINED {
            "device locked due to security alert"
        } else {
            "device unavailable"
        };
        return Err(ApiError::DeviceUnavailable(message.to_string()));
    }

    let permitted =
        storage::has_effective_permission(&state.pool, identity.user_id, &request.device_id)
            .await
            .map_err(ApiError::Internal)?;
    if !permitted {
        info!(
            user_id = identity.user_id,
            device_id = %request.device_id,
            "challenge: rejected, no permission"
        );
        return Err(ApiError::NoPermission);
    }

    // Plaintext device key lives only for the rest of this call; the
    // Zeroizing buffer wipes it on every exit path.
    let device_key = state.kms.unwrap(&device.key_encrypted)?;

    let data = mac_input(
        &challenge,
        &request.device_id,
        identity.user_id,
        request.timestamp,
    );
    let mac = kms::device_mac(&device_key, &data).map_err(ApiError::Internal)?;

    info!(
        user_id = identity.user_id,
        device_id = %request.device_id,
        "challenge: success, response computed"
    );

    storage::spawn_touch_last_active(state.pool.clone(), request.device_id.clone());
    publish_audit(
        state,
        AuditMessage {
            user_id: identity.user_id,
            device_id: request.device_id,
            device_type: DEVICE_TYPE_LOCK.to_string(),
            action: "challenge_request".to_string(),
            client_ip: meta.client_ip.clone(),
            ..AuditMessage::default()
        },
    );

    Ok(ChallengeResponse {
        response: hex::encode(mac),
    })
}

pub async fn report(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    meta: ReqMeta,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return fail(&meta, &ApiError::Param(rejection.body_text())),
    };
    match report_inner(&state, &identity, &meta, request).await {
        Ok(()) => ok(&meta.request_id, ()),
        Err(err) => fail(&meta, &err),
    }
}

async fn report_inner(
    state: &AppState,
    identity: &Identity,
    meta: &ReqMeta,
    request: ReportRequest,
) -> Result<(), ApiError> {
    if request.device_id.is_empty() || request.device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ApiError::Param(
            "device_id must be 1..=32 characters".to_string(),
        ));
    }
    if request.result != "success" && request.result != "fail" {
        return Err(ApiError::Param(
            "result must be \"success\" or \"fail\"".to_string(),
        ));
    }

    info!(
        user_id = identity.user_id,
        device_id = %request.device_id,
        result = %request.result,
        occurred_at = request.occurred_at,
        client_ip = %meta.client_ip,
        "report: received"
    );

    let failed = request.result == "fail";
    if failed {
        let count = match state
            .fail_counts
            .increment(DEVICE_TYPE_LOCK, &request.device_id)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                error!("report: fail count increment error: {err:#}");
                0
            }
        };
        info!(
            device_id = %request.device_id,
            fail_count = count,
            fail_reason = request.fail_reason.as_deref().unwrap_or(""),
            "report: unlock failed, fail_count incremented"
        );
        if count >= QUARANTINE_THRESHOLD {
            warn!(
                device_id = %request.device_id,
                fail_count = count,
                "report: consecutive fail threshold reached, triggering alert"
            );
            alert_lock(state, &request.device_id, identity.user_id, count).await;
        }
    } else {
        if let Err(err) = state
            .fail_counts
            .reset(DEVICE_TYPE_LOCK, &request.device_id)
            .await
        {
            error!("report: fail count reset error: {err:#}");
        }
        storage::spawn_touch_last_active(state.pool.clone(), request.device_id.clone());
        info!(
            device_id = %request.device_id,
            user_id = identity.user_id,
            "report: unlock success, fail_count reset"
        );
    }

    let extra = request
        .fail_reason
        .as_ref()
        .map(|reason| json!({ "fail_reason": reason }));
    publish_audit(
        state,
        AuditMessage {
            user_id: identity.user_id,
            device_id: request.device_id,
            device_type: DEVICE_TYPE_LOCK.to_string(),
            action: if failed { "unlock_fail" } else { "unlock_success" }.to_string(),
            result_code: i16::from(failed),
            client_ip: meta.client_ip.clone(),
            device_model: request.device_model.unwrap_or_default(),
            extra,
            ..AuditMessage::default()
        },
    );

    Ok(())
}

/// Quarantine the device, open an alert, and reset the counter in one
/// transaction, then notify operator tooling. Failures are logged and
/// swallowed: the counter re-trips on the next failure.
async fn alert_lock(state: &AppState, device_id: &str, user_id: i64, fail_count: i32) {
    info!(
        device_id = %device_id,
        user_id,
        fail_count,
        "alert_lock: quarantining device and creating alert"
    );

    if let Err(err) =
        storage::quarantine_with_alert(&state.pool, device_id, user_id, fail_count).await
    {
        error!(device_id = %device_id, "alert_lock: transaction failed: {err:#}");
        return;
    }

    warn!(
        device_id = %device_id,
        fail_count,
        "alert_lock: device quarantined, alert created"
    );

    publish_notify(
        state,
        NotifyMessage {
            alert_type: ALERT_TYPE_CONSECUTIVE_FAIL.to_string(),
            device_id: device_id.to_string(),
            severity: 3,
            extra: Some(json!({ "fail_count": fail_count })),
            ..NotifyMessage::default()
        },
    );
}

fn decode_challenge(challenge_c: &str) -> Option<[u8; 8]> {
    if challenge_c.len() != CHALLENGE_HEX_LEN {
        return None;
    }
    let bytes = hex::decode(challenge_c).ok()?;
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes);
    Some(out)
}

/// The bit-exact MAC input the lock firmware reconstructs:
/// `challenge(8) || device_id_utf8 || user_id_be64 || timestamp_be64`,
/// both integers as big-endian two's complement.
fn mac_input(challenge: &[u8; 8], device_id: &str, user_id: i64, timestamp: i64) -> Vec<u8> {
    let id_bytes = device_id.as_bytes();
    let mut data = Vec::with_capacity(8 + id_bytes.len() + 8 + 8);
    data.extend_from_slice(challenge);
    data.extend_from_slice(id_bytes);
    data.extend_from_slice(&user_id.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    #[test]
    fn decode_challenge_requires_exactly_eight_bytes() {
        assert_eq!(
            decode_challenge("0011223344556677"),
            Some([0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77])
        );
        // 20 hex characters: too long.
        assert_eq!(decode_challenge("00112233445566778899"), None);
        assert_eq!(decode_challenge("00112233445566"), None);
        assert_eq!(decode_challenge("001122334455667z"), None);
        assert_eq!(decode_challenge(""), None);
    }

    #[test]
    fn mac_input_layout_is_bit_exact() {
        let challenge = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
        let data = mac_input(&challenge, "D1", 42, 1_700_000_000);

        assert_eq!(&data[..8], &challenge);
        assert_eq!(&data[8..10], b"D1");
        assert_eq!(&data[10..18], &42_u64.to_be_bytes());
        assert_eq!(&data[18..26], &1_700_000_000_u64.to_be_bytes());
        assert_eq!(data.len(), 26);
    }

    #[test]
    fn mac_input_encodes_negative_timestamps_as_twos_complement() {
        let data = mac_input(&[0u8; 8], "D1", -1, -2);
        assert_eq!(&data[10..18], &[0xff; 8]);
        assert_eq!(
            &data[18..26],
            &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]
        );
    }

    #[test]
    fn challenge_response_matches_reference_vector() {
        // Mirrors what the lock computes for the documented example device key.
        let key = crate::kms::parse_device_key("0123456789abcdef0123456789abcdef")
            .expect("valid key");
        let challenge = decode_challenge("0011223344556677").expect("valid challenge");
        let data = mac_input(&challenge, "D1", 1, 1_700_000_000);

        let mac = crate::kms::device_mac(&key[..], &data).expect("mac");

        let mut reference = <Hmac<Sha256> as Mac>::new_from_slice(&key[..]).expect("hmac");
        reference.update(&data);
        let reference = reference.finalize().into_bytes();

        assert_eq!(hex::encode(mac), hex::encode(&reference[..16]));
        assert_eq!(hex::encode(mac).len(), 32);
    }
}
