//! # Agent WebSocket Handlers
//!
//! The agent-facing half of the server:
//! - Upgrading HTTP connections to WebSocket
//! - Managing the lifecycle of each session (outbound task, inbound loop, cleanup)
//! - Authenticated registration: token check, subdomain resolution,
//!   tunnel upsert, duplicate eviction
//! - Dispatching `response` frames into the request multiplexer

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, TunnelUpsert};
use crate::error::RegisterError;
use crate::mux::AgentResponse;
use crate::protocol::{Frame, CLOSE_DUPLICATE};
use crate::state::{AgentSession, AppState, Outbound};

/// How long cleanup waits for the outbound task to drain queued frames
/// (close frames included) before stopping it.
const OUTBOUND_DRAIN: Duration = Duration::from_secs(1);

// ── WebSocket Upgrade Endpoint ──────────────────────────────────

/// `GET /ws` — upgrades the connection and hands it to
/// [`handle_connection`].
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

// ── Session Lifecycle ───────────────────────────────────────────

/// Manages the full lifecycle of a single agent session.
///
/// 1. Assign a session id and send a `welcome` frame
/// 2. Spawn an outbound task that serialises and sends queued items
/// 3. Process inbound frames on the current task
/// 4. On disconnect: release the registry entry if this session still
///    owns it, cancel its in-flight responders, persist the disconnect
async fn handle_connection(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    debug!(%session_id, "agent transport open");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let _ = tx.send(Outbound::Frame(Frame::Welcome {
        timestamp: Utc::now().timestamp_millis(),
    }));

    // ── Outbound Task ──
    // Single writer for this socket: frames go out in queue order, and a
    // queued close terminates the writer after it is sent.
    let outbound_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            error!("frame serialize error: {err}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });
    let outbound_abort = outbound_task.abort_handle();

    // ── Inbound Loop ──
    let mut registered: Option<AgentSession> = None;
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    if handle_frame(&state, &session_id, &tx, &mut registered, frame).await {
                        break;
                    }
                }
                Err(err) => warn!(%session_id, "dropping undecodable frame: {err}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup on Disconnect ──
    // Release the registry entry only if this session still owns it; an
    // evicted session must not unregister its replacement.
    let mut owned_tunnel: Option<String> = None;
    if let Some(session) = registered.take() {
        let still_owner = state
            .agents
            .remove_if(&session.tunnel_id, |_, current| {
                current.session_id == session.session_id
            })
            .is_some();
        if still_owner {
            owned_tunnel = Some(session.tunnel_id.clone());
        }
    }

    // Let the writer drain anything queued (error and close frames), then
    // stop it.
    drop(tx);
    if tokio::time::timeout(OUTBOUND_DRAIN, outbound_task).await.is_err() {
        outbound_abort.abort();
    }

    if let Some(tunnel_id) = owned_tunnel {
        info!(%tunnel_id, "agent disconnected");
        let cancelled = state.mux.cancel_session(&tunnel_id);
        if cancelled > 0 {
            debug!(%tunnel_id, cancelled, "cancelled in-flight responders");
        }
        if let Err(err) = db::mark_tunnel_disconnected(&state.db, &tunnel_id).await {
            warn!(%tunnel_id, "failed to persist disconnect: {err}");
        }
    } else {
        debug!(%session_id, "transport closed without a bound tunnel");
    }
}

// ── Frame Dispatcher ────────────────────────────────────────────

/// Handles one inbound frame. Returns true when the inbound loop should
/// stop (failed registration queues a close and ends the session).
async fn handle_frame(
    state: &AppState,
    session_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    registered: &mut Option<AgentSession>,
    frame: Frame,
) -> bool {
    match frame {
        // ── Registration ──
        Frame::Register {
            agent_id,
            token,
            tunnel_name,
            subdomain,
            local_port,
            description,
        } => {
            if registered.is_some() {
                warn!(%session_id, "duplicate register frame on a bound session, dropping");
                return false;
            }
            match register_agent(
                state,
                session_id,
                tx,
                agent_id,
                &token,
                tunnel_name,
                subdomain,
                local_port,
                description,
            )
            .await
            {
                Ok(session) => {
                    *registered = Some(session);
                    false
                }
                Err(err) => {
                    warn!(%session_id, "registration failed: {err}");
                    if !matches!(err, RegisterError::Auth) {
                        let _ = tx.send(Outbound::Frame(Frame::Error {
                            message: "registration failed".to_string(),
                            error: Some(err.to_string()),
                        }));
                    }
                    let _ = tx.send(Outbound::Close {
                        code: err.close_code(),
                        reason: "registration failed",
                    });
                    true
                }
            }
        }

        // ── Response Dispatch ──
        Frame::Response {
            id,
            status_code,
            headers,
            body,
        } => {
            if registered.is_none() {
                warn!(%session_id, "response frame before registration, dropping");
                return false;
            }
            let fulfilled = state.mux.fulfil(
                &id,
                AgentResponse {
                    status_code,
                    headers,
                    body,
                },
            );
            if !fulfilled {
                debug!(%id, "late or unknown response discarded");
            }
            false
        }

        // ── Heartbeat ──
        Frame::Ping { timestamp } => {
            let _ = tx.send(Outbound::Frame(Frame::Pong { timestamp }));
            false
        }
        Frame::Pong { .. } => false,

        // Server-to-agent frames echoed back make no sense here.
        other => {
            warn!(%session_id, "unexpected frame from agent, dropping: {other:?}");
            false
        }
    }
}

// ── Registration ────────────────────────────────────────────────

/// Admits an agent: verify the token, resolve the subdomain, upsert the
/// tunnel row, evict any prior session for the id, install the new one,
/// and acknowledge with a `registered` frame.
///
/// Ordering: the database is not touched on an auth failure, and the
/// live map is not touched on a database failure.
#[allow(clippy::too_many_arguments)]
async fn register_agent(
    state: &AppState,
    session_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    agent_id: String,
    token: &str,
    tunnel_name: Option<String>,
    subdomain: Option<String>,
    local_port: Option<u16>,
    description: Option<String>,
) -> Result<AgentSession, RegisterError> {
    let claims = state.signer.verify(token).ok_or(RegisterError::Auth)?;

    let tunnel_id = agent_id;
    let name = tunnel_name.unwrap_or_else(|| tunnel_id.clone());
    // Subdomain resolution only reads, so a conflict leaves no writes
    // behind.
    let subdomain = resolve_subdomain(state, &tunnel_id, subdomain, &name).await?;

    db::ensure_user(&state.db, &claims.user_id, &claims.email).await?;

    let tunnel = db::upsert_tunnel(
        &state.db,
        TunnelUpsert {
            id: tunnel_id.clone(),
            user_id: claims.user_id,
            name,
            subdomain,
            local_port: local_port.map(i32::from),
            description,
        },
    )
    .await?;

    // Evict any prior session before installing the replacement, so the
    // registry never holds two sessions for one tunnel id.
    if let Some((_, prior)) = state.agents.remove(&tunnel_id) {
        info!(%tunnel_id, evicted = %prior.session_id, "evicting duplicate session");
        let _ = prior.tx.send(Outbound::Close {
            code: CLOSE_DUPLICATE,
            reason: "replaced by a new session",
        });
        state.mux.cancel_session(&tunnel_id);
    }

    let session = AgentSession {
        session_id: session_id.to_string(),
        tunnel_id: tunnel_id.clone(),
        subdomain: tunnel.subdomain.clone(),
        connected_at: Utc::now(),
        tx: tx.clone(),
    };
    state.agents.insert(tunnel_id.clone(), session.clone());

    let url = format!("{}/{}", state.config.base_url, tunnel.subdomain);
    info!(%tunnel_id, subdomain = %tunnel.subdomain, %url, "agent registered");
    let _ = tx.send(Outbound::Frame(Frame::Registered {
        tunnel: (&tunnel).into(),
        url,
    }));

    Ok(session)
}

/// Picks the subdomain for a registration.
///
/// An explicitly requested subdomain that another tunnel owns is a hard
/// conflict. Without an explicit request the agent id is tried first,
/// then `-<n>`-suffixed variants of the sanitized tunnel name, then a
/// time-based suffix.
async fn resolve_subdomain(
    state: &AppState,
    tunnel_id: &str,
    explicit: Option<String>,
    tunnel_name: &str,
) -> Result<String, RegisterError> {
    if let Some(requested) = explicit {
        if db::subdomain_taken(&state.db, &requested, tunnel_id).await? {
            return Err(RegisterError::SubdomainConflict(requested));
        }
        return Ok(requested);
    }

    if !db::subdomain_taken(&state.db, tunnel_id, tunnel_id).await? {
        return Ok(tunnel_id.to_string());
    }

    let base = sanitize_subdomain(tunnel_name);
    for n in 1..=100 {
        let candidate = format!("{base}-{n}");
        if !db::subdomain_taken(&state.db, &candidate, tunnel_id).await? {
            return Ok(candidate);
        }
    }
    Ok(format!("{base}-{}", Utc::now().timestamp_millis()))
}

/// Lowercases, strips non-alphanumerics, and keeps the first 20 chars.
fn sanitize_subdomain(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(20)
        .collect();
    if cleaned.is_empty() {
        "tunnel".to_string()
    } else {
        cleaned
    }
}
