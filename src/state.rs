//! # Server State
//!
//! Process-scoped shared state: the agent registry, the request
//! multiplexer, the telemetry pipeline, and the handles they need.
//! Everything lives here with defined initialisation and shutdown;
//! nothing is ambient.
//!
//! The registry uses [`DashMap`] for lock-free concurrent access, since
//! sessions, the ingress path, and the close handler all touch it.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;

use crate::auth::TokenSigner;
use crate::config::Config;
use crate::geo::CountryResolver;
use crate::metrics::MetricsPipeline;
use crate::mux::RequestMux;
use crate::protocol::Frame;
use crate::ratelimit::DeviceRateLimits;

/// Sender half of a session's outbound queue. The outbound task drains
/// it and writes each item to the WebSocket in order.
pub type AgentTx = mpsc::UnboundedSender<Outbound>;

/// Items queued for a session's outbound task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Frame),
    /// Close the transport with the given code after draining the queue
    /// up to this point.
    Close { code: u16, reason: &'static str },
}

/// A live agent session bound to one tunnel id.
#[derive(Debug, Clone)]
pub struct AgentSession {
    /// Distinguishes this transport from a replacement session for the
    /// same tunnel id, so an evicted session's cleanup cannot unregister
    /// its successor.
    pub session_id: String,
    pub tunnel_id: String,
    pub subdomain: String,
    pub connected_at: DateTime<Utc>,
    pub tx: AgentTx,
}

impl AgentSession {
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }
}

/// Shared application state, cloned into each handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: DatabaseConnection,

    /// Registry of live sessions, keyed by tunnel id. At most one entry
    /// per tunnel id at any time.
    pub agents: Arc<DashMap<String, AgentSession>>,

    pub mux: Arc<RequestMux>,
    pub metrics: Arc<MetricsPipeline>,
    pub signer: Arc<TokenSigner>,
    pub device_limits: Arc<DeviceRateLimits>,

    /// Flipped once shutdown begins; the ingress path answers 503 from
    /// then on.
    pub shutting_down: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Config, db: DatabaseConnection) -> Self {
        let signer = TokenSigner::new(&config.jwt_secret);
        let metrics = MetricsPipeline::spawn(db.clone(), CountryResolver::new());

        Self {
            config: Arc::new(config),
            db,
            agents: Arc::new(DashMap::new()),
            mux: Arc::new(RequestMux::new()),
            metrics,
            signer: Arc::new(signer),
            device_limits: Arc::new(DeviceRateLimits::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }
}
