//! # REST API Endpoints
//!
//! Server-side half of the device activation flow, plus discovery and
//! liveness endpoints. The browser-facing sign-in that drives the claim
//! endpoint lives elsewhere; this is the seam it calls.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::auth::SessionClaims;
use crate::db::{self, ClaimOutcome, PollOutcome};
use crate::error::DeviceCodeError;
use crate::ids;
use crate::ingress;
use crate::state::AppState;

/// Device codes stay claimable this long.
pub const DEVICE_CODE_TTL_MINUTES: i64 = 10;

/// Claim payloads are tiny; anything bigger is rejected outright.
const CLAIM_BODY_LIMIT: usize = 16 * 1024;

// ── Discovery / liveness ────────────────────────────────────────

/// One connected agent, as reported by `GET /api/agents`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListItem {
    pub tunnel_id: String,
    pub subdomain: String,
    pub connected_at: DateTime<Utc>,
}

/// `GET /api/agents` — currently connected tunnels, for dashboards and
/// debugging.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentListItem>> {
    let agents: Vec<AgentListItem> = state
        .agents
        .iter()
        .map(|entry| AgentListItem {
            tunnel_id: entry.value().tunnel_id.clone(),
            subdomain: entry.value().subdomain.clone(),
            connected_at: entry.value().connected_at,
        })
        .collect();
    Json(agents)
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Device activation ───────────────────────────────────────────

/// `POST /api/device/code` — allocate a short-lived activation code.
pub async fn create_device_code(State(state): State<AppState>, request: Request) -> Response {
    let ip = request_ip(&request);
    if !state.device_limits.create.check(&ip) {
        return too_many_requests();
    }

    match db::allocate_device_code(&state.db, Duration::minutes(DEVICE_CODE_TTL_MINUTES)).await {
        Ok(row) => Json(json!({
            "code": row.code,
            "expiresAt": row.expires_at,
        }))
        .into_response(),
        Err(DeviceCodeError::Exhausted) => {
            warn!("device code space exhausted after retries");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not allocate a code",
            )
        }
        Err(DeviceCodeError::Storage(err)) => {
            error!("device code allocation failed: {err}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// `GET /api/device/poll/{code}` — agent-side poll for the bound token.
/// The token is handed out exactly once.
pub async fn poll_device_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
    request: Request,
) -> Response {
    let ip = request_ip(&request);
    if !state.device_limits.poll.check(&ip) {
        return too_many_requests();
    }

    match db::take_device_token(&state.db, &code).await {
        Ok(PollOutcome::NotFound) => json_error(StatusCode::NOT_FOUND, "unknown or expired code"),
        Ok(PollOutcome::Pending) => Json(json!({ "status": "pending" })).into_response(),
        Ok(PollOutcome::Ready(token)) => Json(json!({
            "status": "ready",
            "token": token,
        }))
        .into_response(),
        Err(err) => {
            error!(%code, "device code poll failed: {err}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Payload the browser-side activation flow posts after sign-in.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub code: String,
    pub user_id: String,
    pub email: String,
}

/// `POST /api/device/claim` — bind a signed session token to a live
/// code so the polling agent can collect it.
pub async fn claim_device_code(State(state): State<AppState>, request: Request) -> Response {
    let ip = request_ip(&request);
    if !state.device_limits.claim.check(&ip) {
        return too_many_requests();
    }

    let body = match axum::body::to_bytes(request.into_body(), CLAIM_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "unreadable body"),
    };
    let claim: ClaimRequest = match serde_json::from_slice(&body) {
        Ok(claim) => claim,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid payload: {err}"));
        }
    };

    if let Err(err) = db::ensure_user(&state.db, &claim.user_id, &claim.email).await {
        error!("user upsert failed: {err}");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }

    let claims = SessionClaims::new(
        claim.user_id.clone(),
        claim.email.clone(),
        ids::generate_device_id(),
    );
    let token = match state.signer.sign(&claims) {
        Ok(token) => token,
        Err(err) => {
            error!("token signing failed: {err}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    match db::claim_device_code(&state.db, &claim.code, &claim.user_id, &token).await {
        Ok(ClaimOutcome::Claimed) => Json(json!({ "status": "claimed" })).into_response(),
        Ok(ClaimOutcome::NotFound) => json_error(StatusCode::NOT_FOUND, "unknown code"),
        Ok(ClaimOutcome::Expired) => json_error(StatusCode::GONE, "code expired"),
        Ok(ClaimOutcome::AlreadyClaimed) => json_error(StatusCode::CONFLICT, "code already claimed"),
        Err(err) => {
            error!("device code claim failed: {err}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────

fn request_ip(request: &Request) -> String {
    ingress::client_ip(
        request.headers(),
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
    )
}

fn too_many_requests() -> Response {
    json_error(StatusCode::TOO_MANY_REQUESTS, "too many requests, slow down")
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
