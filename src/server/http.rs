//! HTTP surface: device bootstrap and vision analysis
//!
//! The bootstrap endpoint mirrors the firmware's OTA handshake: POST yields
//! the server time, an echo of the firmware version, and the channel URL;
//! GET is a plain-text health line. Errors keep the legacy contract of a
//! 200 status with `{"success":false,...}`. CORS headers go on every
//! response via the router layer.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{auth, ServerContext};

/// Upper bound for vision payloads (base64 image), 5 MiB.
const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// `POST /<prefix>/ota/` — bootstrap handshake.
pub async fn ota_post(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let config = ctx.config();

    let device_id = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if device_id.is_empty() {
        warn!("Bootstrap request without device id");
        return Json(json!({"success": false, "message": "request error."}));
    }
    info!("Bootstrap request from device {}", device_id);

    let parsed: Result<serde_json::Value, _> = serde_json::from_str(&body);
    let Ok(request) = parsed else {
        return Json(json!({"success": false, "message": "request error."}));
    };

    let version = request["application"]["version"]
        .as_str()
        .unwrap_or("1.0.0");

    Json(json!({
        "server_time": {
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "timezone_offset": config.server.timezone_offset * 60,
        },
        "firmware": {
            "version": version,
            "url": "",
        },
        "websocket": {
            "url": config.advertised_ws_url(),
        },
    }))
}

/// `GET /<prefix>/ota/` — health line with the advertised channel URL.
pub async fn ota_get(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    let config = ctx.config();
    format!(
        "Bootstrap endpoint is running; the channel address sent to devices is {}",
        config.advertised_ws_url()
    )
}

#[derive(Debug, Deserialize)]
pub struct VisionRequest {
    pub question: String,
    /// Base64 image data.
    pub image: String,
}

/// `POST /mcp/vision/explain` — analyze an image for a device. Requires a
/// bearer token signed with the server auth key.
pub async fn vision_explain(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(request): Json<VisionRequest>,
) -> impl IntoResponse {
    let config = ctx.config();

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let claims = match token {
        Some(token) => match auth::verify_vision_token(&config.server.auth_key, token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Vision auth failed: {}", e);
                return Json(json!({"success": false, "message": "invalid token"}));
            }
        },
        None => {
            return Json(json!({"success": false, "message": "missing token"}));
        }
    };
    debug!("Vision request from device {}", claims.device_id);

    if request.image.len() > MAX_IMAGE_BYTES {
        return Json(json!({"success": false, "message": "image too large"}));
    }

    let Some(vision) = ctx.providers.vision.clone() else {
        return Json(json!({"success": false, "message": "vision model not configured"}));
    };

    match vision.explain(&request.question, &request.image).await {
        Ok(result) => Json(json!({"success": true, "result": result})),
        Err(e) => {
            warn!("Vision analysis failed: {}", e);
            Json(json!({"success": false, "message": "analysis failed"}))
        }
    }
}
