//! End-to-end tests of the public forward path, driven through the
//! router with an in-process stand-in for the agent session.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::any,
    Router,
};
use chrono::Utc;
use sea_orm::EntityTrait;
use tower::ServiceExt;
use uuid::Uuid;

use tunnel_hub::config::Config;
use tunnel_hub::db::entities::live_stats;
use tunnel_hub::db::{self, TunnelUpsert};
use tunnel_hub::ingress;
use tunnel_hub::mux::AgentResponse;
use tunnel_hub::protocol::Frame;
use tunnel_hub::state::{AgentSession, AppState, Outbound};

fn test_config() -> Config {
    Config {
        port: 0,
        base_url: "http://localhost:8080".to_string(),
        jwt_secret: "test_secret_key_1234567890".to_string(),
        database_url: "sqlite::memory:".to_string(),
    }
}

async fn setup_state() -> AppState {
    let db = db::connect("sqlite::memory:").await.expect("connect");
    db::migrate(&db).await.expect("migrate");
    AppState::new(test_config(), db)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", any(ingress::empty_identifier))
        .route("/{identifier}", any(ingress::forward_root))
        .route("/{identifier}/{*rest}", any(ingress::forward_rest))
        .with_state(state)
}

async fn seed_tunnel(state: &AppState, id: &str) {
    db::ensure_user(&state.db, "user-1", "u@x").await.expect("user");
    db::upsert_tunnel(
        &state.db,
        TunnelUpsert {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            name: id.to_string(),
            subdomain: id.to_string(),
            local_port: Some(3000),
            description: None,
        },
    )
    .await
    .expect("tunnel");
}

/// Installs a live session for `tunnel_id` and returns its outbound
/// queue, standing in for a connected agent transport.
fn install_session(
    state: &AppState,
    tunnel_id: &str,
) -> tokio::sync::mpsc::UnboundedReceiver<Outbound> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    state.agents.insert(
        tunnel_id.to_string(),
        AgentSession {
            session_id: Uuid::new_v4().to_string(),
            tunnel_id: tunnel_id.to_string(),
            subdomain: tunnel_id.to_string(),
            connected_at: Utc::now(),
            tx,
        },
    );
    rx
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn empty_identifier_is_rejected() {
    let state = setup_state().await;
    let response = router(state)
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_tunnel_is_404_without_metrics() {
    let state = setup_state().await;
    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/nope/anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    // No telemetry capture happens before the tunnel resolves.
    assert_eq!(state.metrics.in_flight(), 0);
    assert_eq!(state.metrics.buffered(), 0);
}

#[tokio::test]
async fn inactive_tunnel_is_503_with_tunnel_details() {
    let state = setup_state().await;
    seed_tunnel(&state, "t2").await;
    db::mark_tunnel_disconnected(&state.db, "t2").await.unwrap();

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/t2/anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["tunnel"]["id"], "t2");
    assert!(body["tunnel"].get("lastDisconnected").is_some());
}

#[tokio::test]
async fn active_tunnel_without_session_is_502_and_reconciled() {
    let state = setup_state().await;
    seed_tunnel(&state, "t3").await;

    let response = router(state.clone())
        .oneshot(Request::builder().uri("/t3/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let repaired = db::get_tunnel_by_identifier(&state.db, "t3")
        .await
        .unwrap()
        .unwrap();
    assert!(!repaired.is_active, "row should be reconciled to inactive");
}

#[tokio::test]
async fn happy_path_forwards_and_records_telemetry() {
    let state = setup_state().await;
    seed_tunnel(&state, "t1").await;
    let mut agent_rx = install_session(&state, "t1");

    // Stand-in agent: answer the forwarded frame by correlation id.
    let agent_state = state.clone();
    tokio::spawn(async move {
        while let Some(outbound) = agent_rx.recv().await {
            if let Outbound::Frame(Frame::Request {
                id, method, path, ..
            }) = outbound
            {
                assert_eq!(method, "GET");
                assert_eq!(path, "/ping");
                agent_state.mux.fulfil(
                    &id,
                    AgentResponse {
                        status_code: Some(200),
                        headers: std::collections::HashMap::from([(
                            "x-agent".to_string(),
                            "1".to_string(),
                        )]),
                        body: serde_json::Value::String("pong".to_string()),
                    },
                );
            }
        }
    });

    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/t1/ping")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-agent").unwrap(), "1");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"pong");

    // The telemetry worker runs off the response path; wait for it.
    let mut waited = 0;
    while state.metrics.buffered() == 0 && waited < 200 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(state.metrics.buffered(), 1);

    let live = live_stats::Entity::find_by_id("t1")
        .one(&state.db)
        .await
        .unwrap()
        .expect("live stats row");
    assert_eq!(live.requests_last_5_min, 1);
    assert_eq!(live.requests_last_1_hour, 1);
    assert_eq!(live.error_rate, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_agent_yields_504_within_the_deadline() {
    let state = setup_state().await;
    seed_tunnel(&state, "t1").await;

    // Drain the outbound queue but never answer.
    let mut agent_rx = install_session(&state, "t1");
    tokio::spawn(async move { while agent_rx.recv().await.is_some() {} });

    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/t1/slow")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    // The correlation entry is gone, so a late response frame would be
    // discarded.
    assert_eq!(state.mux.outstanding(), 0);
}

#[tokio::test]
async fn disconnecting_agent_mid_flight_yields_502() {
    let state = setup_state().await;
    seed_tunnel(&state, "t1").await;
    let mut agent_rx = install_session(&state, "t1");

    // On the first forwarded frame, emulate the session close handler:
    // drop the registry entry and cancel its responders.
    let agent_state = state.clone();
    tokio::spawn(async move {
        if let Some(Outbound::Frame(Frame::Request { .. })) = agent_rx.recv().await {
            agent_state.agents.remove("t1");
            agent_state.mux.cancel_session("t1");
        }
    });

    let response = router(state)
        .oneshot(Request::builder().uri("/t1/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
