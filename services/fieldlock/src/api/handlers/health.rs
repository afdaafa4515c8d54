//! Liveness probe.

use axum::response::Response;
use serde_json::json;

use crate::api::response::{ok, ReqMeta};

pub async fn health(meta: ReqMeta) -> Response {
    ok(&meta.request_id, json!({ "status": "ok" }))
}
