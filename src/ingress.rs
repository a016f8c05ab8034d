//! # Public HTTP Front-End
//!
//! Parses `/{identifier}/{rest...}`, resolves the tunnel, and forwards
//! the request over the owning agent session via the multiplexer.
//!
//! Status codes issued here: 400 empty identifier, 404 unknown tunnel,
//! 413 body too large, 500 send failure, 502 not connected or agent
//! gone mid-flight, 503 inactive or shutting down, 504 agent deadline
//! exceeded. Anything else is the agent's own response played back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::db;
use crate::ids;
use crate::mux::{AgentResponse, Verdict, REQUEST_DEADLINE};
use crate::protocol::Frame;
use crate::state::AppState;

/// Server-wide cap on buffered request entities.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// `ANY /` — an empty identifier cannot address a tunnel.
pub async fn empty_identifier() -> Response {
    error_response(StatusCode::BAD_REQUEST, "missing tunnel identifier")
}

/// `ANY /{identifier}`
pub async fn forward_root(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    request: Request,
) -> Response {
    forward(state, identifier, String::new(), request).await
}

/// `ANY /{identifier}/{*rest}`
pub async fn forward_rest(
    State(state): State<AppState>,
    Path((identifier, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    forward(state, identifier, rest, request).await
}

async fn forward(state: AppState, identifier: String, rest: String, request: Request) -> Response {
    if state.shutting_down.load(Ordering::Relaxed) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down");
    }

    let method = request.method().clone();
    let headers = request.headers().clone();
    let client_ip = client_ip(
        &headers,
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
    );

    // Resolve the tunnel by subdomain, then by id.
    let tunnel = match db::get_tunnel_by_identifier(&state.db, &identifier).await {
        Ok(Some(tunnel)) => tunnel,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "tunnel not found"),
        Err(err) => {
            error!(%identifier, "tunnel lookup failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    if !tunnel.is_active {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "tunnel is not connected",
                "tunnel": {
                    "id": tunnel.id,
                    "lastConnected": tunnel.last_connected,
                    "lastDisconnected": tunnel.last_disconnected,
                },
            })),
        )
            .into_response();
    }

    let Some(session) = state.agents.get(&tunnel.id).map(|entry| entry.value().clone()) else {
        // Persisted active but no live session. Repair the row while
        // answering 502; the next registration will flip it back.
        warn!(tunnel_id = %tunnel.id, "active tunnel without a session, reconciling");
        if let Err(err) = db::mark_tunnel_disconnected(&state.db, &tunnel.id).await {
            warn!(tunnel_id = %tunnel.id, "reconcile failed: {err}");
        }
        return error_response(StatusCode::BAD_GATEWAY, "tunnel agent is not connected");
    };

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let target_path = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{rest}")
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let telemetry_id = state.metrics.capture(
        &tunnel.id,
        method.as_str(),
        &target_path,
        &client_ip,
        body.len() as i64,
        user_agent,
    );

    let request_id = ids::generate_request_id();
    let responder = state.mux.register(&request_id, &tunnel.id);

    let frame = Frame::Request {
        id: request_id.clone(),
        method: method.to_string(),
        path: target_path,
        headers: plain_headers(&headers),
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    if !session.send_frame(frame) {
        state.mux.discard(&request_id);
        state.metrics.finalize(&telemetry_id, 500, 0);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to reach agent");
    }

    let (status, response_size, response) =
        match tokio::time::timeout(REQUEST_DEADLINE, responder).await {
            Ok(Ok(Verdict::Response(agent_response))) => build_agent_response(agent_response),
            Ok(Ok(Verdict::Shutdown)) => (
                503,
                0,
                error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down"),
            ),
            // Sender dropped: the agent session closed mid-flight.
            Ok(Err(_)) => (
                502,
                0,
                error_response(StatusCode::BAD_GATEWAY, "tunnel agent disconnected"),
            ),
            Err(_) => {
                state.mux.discard(&request_id);
                (
                    504,
                    0,
                    error_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        "tunnel agent did not respond in time",
                    ),
                )
            }
        };

    state.metrics.finalize(&telemetry_id, status, response_size);
    response
}

// ── Helpers ─────────────────────────────────────────────────────

/// Replays an agent `response` frame as an HTTP response. Returns the
/// status and body size for telemetry alongside the response itself.
fn build_agent_response(agent: AgentResponse) -> (u16, i64, Response) {
    let status = agent.status_code.unwrap_or(200);

    let (bytes, structured) = match agent.body {
        Value::Null => (Vec::new(), false),
        Value::String(text) => (text.into_bytes(), false),
        other => (serde_json::to_vec(&other).unwrap_or_default(), true),
    };

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    let mut has_content_type = false;
    for (name, value) in &agent.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if header_name == header::CONTENT_LENGTH {
            continue;
        }
        let Ok(header_value) = HeaderValue::from_str(value) else {
            continue;
        };
        if header_name == header::CONTENT_TYPE {
            has_content_type = true;
        }
        builder = builder.header(header_name, header_value);
    }
    if structured && !has_content_type {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }

    let size = bytes.len() as i64;
    let response = builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    (status, size, response)
}

/// Hop-by-hop headers the HTTP layer forbids on a replayed response.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn plain_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Prefers the first `x-forwarded-for` hop, falling back to the socket
/// peer address.
pub fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            connect_info
                .map(|ci| ci.0.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_body_passes_through() {
        let (status, size, response) = build_agent_response(AgentResponse {
            status_code: Some(200),
            headers: HashMap::from([("x-custom".to_string(), "yes".to_string())]),
            body: Value::String("pong".to_string()),
        });

        assert_eq!(status, 200);
        assert_eq!(size, 4);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-custom").unwrap(), "yes");
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn structured_body_defaults_to_json() {
        let (status, _, response) = build_agent_response(AgentResponse {
            status_code: None,
            headers: HashMap::new(),
            body: json!({"ok": true}),
        });

        assert_eq!(status, 200);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn agent_content_type_wins_over_default() {
        let (_, _, response) = build_agent_response(AgentResponse {
            status_code: Some(201),
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/vnd.api+json".to_string(),
            )]),
            body: json!({"ok": true}),
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/vnd.api+json"
        );
    }

    #[tokio::test]
    async fn hop_by_hop_headers_are_dropped() {
        let (_, _, response) = build_agent_response(AgentResponse {
            status_code: Some(200),
            headers: HashMap::from([
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("connection".to_string(), "close".to_string()),
                ("x-kept".to_string(), "1".to_string()),
            ]),
            body: Value::Null,
        });

        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers().get("x-kept").unwrap(), "1");
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.9, 198.51.100.2".parse().unwrap(),
        );
        assert_eq!(client_ip(&headers, None), "203.0.113.9");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, None), "unknown");
    }
}
