//! Server entry point.
//!
//! Loads configuration, connects and migrates the database, assembles
//! the router, spawns the background schedule, and serves until a
//! shutdown signal arrives.

use std::net::SocketAddr;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use tunnel_hub::config::Config;
use tunnel_hub::state::AppState;
use tunnel_hub::{api, db, handlers, ingress, scheduler};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Structured logging with env-filter support; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_hub=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let db = match db::connect(&config.database_url).await {
        Ok(db) => db,
        Err(err) => {
            error!("database connection failed: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = db::migrate(&db).await {
        error!("database migration failed: {err}");
        std::process::exit(1);
    }

    let state = AppState::new(config, db);
    scheduler::spawn_background_tasks(&state);

    // Static routes win over the `{identifier}` captures, so the agent
    // transport and the API keep their paths.
    let app = Router::new()
        .route("/", any(ingress::empty_identifier))
        .route("/ws", get(handlers::ws_handler))
        .route("/healthz", get(api::healthz))
        .route("/api/agents", get(api::list_agents))
        .route("/api/device/code", post(api::create_device_code))
        .route("/api/device/poll/{code}", get(api::poll_device_code))
        .route("/api/device/claim", post(api::claim_device_code))
        .route("/{identifier}", any(ingress::forward_root))
        .route("/{identifier}/{*rest}", any(ingress::forward_rest))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    info!("tunnel hub listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(scheduler::shutdown_signal(state.clone()));

    if let Err(err) = serve.await {
        error!("server error: {err}");
        scheduler::finalize_shutdown(&state).await;
        std::process::exit(1);
    }

    scheduler::finalize_shutdown(&state).await;
}
