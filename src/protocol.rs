//! # Agent Transport Frames
//!
//! Defines the messages exchanged between agents and the server over the
//! WebSocket transport. One message is one JSON text frame, serialized
//! with serde's internally-tagged representation (`"type": "..."` field).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Close codes ─────────────────────────────────────────────────

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_DUPLICATE: u16 = 4002;
pub const CLOSE_REGISTRATION_FAILED: u16 = 4003;

/// All frames in the tunnel protocol.
///
/// `Frame::Register` serializes to `{"type": "register", ...}` and so on.
/// Multi-word payload fields use camelCase on the wire.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // ── Registration ──────────────────────────────────────────────
    /// First frame an agent must send: binds the session to a tunnel id
    /// once the token checks out.
    #[serde(rename_all = "camelCase")]
    Register {
        agent_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// Sent by the server immediately after the transport opens.
    Welcome { timestamp: i64 },

    /// Acknowledges a successful registration with the canonical tunnel
    /// record and its public URL.
    Registered { tunnel: TunnelSummary, url: String },

    /// Error notification. `error` carries detail when available.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── Request forwarding ────────────────────────────────────────
    /// A public HTTP request forwarded to the agent. `body` is the raw
    /// request entity as a string.
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
    },

    /// The agent's answer to a `Request` frame with the same `id`.
    /// A structured `body` is re-serialized by the front-end with a
    /// `content-type` of `application/json` unless the agent set one.
    #[serde(rename_all = "camelCase")]
    Response {
        id: String,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: serde_json::Value,
    },

    // ── Heartbeat ─────────────────────────────────────────────────
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

/// The canonical tunnel record included in `registered` frames, wire
/// fields in camelCase to match the rest of the protocol.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSummary {
    pub id: String,
    pub subdomain: String,
    pub name: String,
    pub description: Option<String>,
    pub local_port: Option<i32>,
    pub protocol: String,
    pub is_active: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_wire_shape() {
        let json = r#"{
            "type": "register",
            "agentId": "t1",
            "token": "jwt",
            "tunnelName": "My App",
            "localPort": 3000
        }"#;

        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::Register {
                agent_id,
                token,
                tunnel_name,
                subdomain,
                local_port,
                description,
            } => {
                assert_eq!(agent_id, "t1");
                assert_eq!(token, "jwt");
                assert_eq!(tunnel_name.as_deref(), Some("My App"));
                assert_eq!(subdomain, None);
                assert_eq!(local_port, Some(3000));
                assert_eq!(description, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn request_frame_serializes_with_type_tag() {
        let frame = Frame::Request {
            id: "r-1".to_string(),
            method: "GET".to_string(),
            path: "/ping".to_string(),
            headers: HashMap::from([("accept".to_string(), "*/*".to_string())]),
            body: String::new(),
        };

        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["id"], "r-1");
        assert_eq!(value["method"], "GET");
        assert_eq!(value["path"], "/ping");
    }

    #[test]
    fn response_frame_accepts_structured_body() {
        let json = r#"{
            "type": "response",
            "id": "r-1",
            "statusCode": 201,
            "headers": {"x-test": "1"},
            "body": {"ok": true}
        }"#;

        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::Response {
                id,
                status_code,
                headers,
                body,
            } => {
                assert_eq!(id, "r-1");
                assert_eq!(status_code, Some(201));
                assert_eq!(headers.get("x-test").map(String::as_str), Some("1"));
                assert_eq!(body["ok"], true);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn response_frame_defaults() {
        let frame: Frame = serde_json::from_str(r#"{"type":"response","id":"r-2"}"#).unwrap();
        match frame {
            Frame::Response {
                status_code, body, ..
            } => {
                assert_eq!(status_code, None);
                assert!(body.is_null());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn tunnel_summary_uses_camel_case() {
        let summary = TunnelSummary {
            id: "t1".to_string(),
            subdomain: "t1".to_string(),
            name: "t1".to_string(),
            description: None,
            local_port: Some(3000),
            protocol: "http".to_string(),
            is_active: true,
            connected_at: None,
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert!(value.get("isActive").is_some());
        assert!(value.get("localPort").is_some());
        assert!(value.get("is_active").is_none());
    }
}
