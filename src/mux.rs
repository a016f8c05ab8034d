//! # Request Multiplexer
//!
//! Correlates each public HTTP request with exactly one agent response.
//! Every in-flight request owns a *responder*: a one-shot handle that
//! exactly one of {response arrived, timeout, agent disconnected,
//! shutdown} fulfils, at most once.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

/// Wall-clock budget from HTTP ingress to agent response.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// A decoded `response` frame, ready for the front-end to replay.
#[derive(Debug)]
pub struct AgentResponse {
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

/// How a responder was settled. Agent disconnection is signalled by
/// dropping the sender instead, which the waiting side observes as a
/// closed channel.
#[derive(Debug)]
pub enum Verdict {
    Response(AgentResponse),
    Shutdown,
}

struct Responder {
    tunnel_id: String,
    tx: oneshot::Sender<Verdict>,
}

/// The correlation map. Writers are the ingress path, the per-session
/// response dispatcher, the session close handler, and shutdown.
#[derive(Default)]
pub struct RequestMux {
    pending: DashMap<String, Responder>,
}

impl RequestMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a responder for `request_id` and returns the waiting end.
    pub fn register(&self, request_id: &str, tunnel_id: &str) -> oneshot::Receiver<Verdict> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            Responder {
                tunnel_id: tunnel_id.to_string(),
                tx,
            },
        );
        rx
    }

    /// Fulfils the responder for `request_id` with an agent response.
    /// Returns false when no responder is registered: the request timed
    /// out already or the id is unknown, and the frame is discarded.
    pub fn fulfil(&self, request_id: &str, response: AgentResponse) -> bool {
        match self.pending.remove(request_id) {
            Some((_, responder)) => responder.tx.send(Verdict::Response(response)).is_ok(),
            None => false,
        }
    }

    /// Drops the responder for `request_id` without fulfilling it. Used
    /// on timeout and on send failure, so a late response is discarded.
    pub fn discard(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Cancels every responder belonging to `tunnel_id`. Dropping the
    /// senders wakes the waiting requests with a closed-channel error,
    /// which the front-end maps to 502.
    pub fn cancel_session(&self, tunnel_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().tunnel_id == tunnel_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids.len()
    }

    /// Settles every outstanding responder with [`Verdict::Shutdown`].
    pub fn shutdown_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, responder)) = self.pending.remove(&id) {
                let _ = responder.tx.send(Verdict::Shutdown);
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
