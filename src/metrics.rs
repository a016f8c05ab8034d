//! # Telemetry Pipeline
//!
//! Per-request data path: `capture` snapshots an in-flight entry at
//! ingress; `finalize` enqueues a completion event on a bounded channel
//! so the response is never held up by country lookup or storage writes.
//! A single worker task drains the events: it updates the live counters,
//! writes the request log, and appends a metric record to the in-memory
//! buffer. The buffer rolls up to hourly rows when it reaches the flush
//! threshold and on a periodic tick.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::db;
use crate::geo::CountryResolver;
use crate::ids;
use crate::rollup::{self, MetricRecord};

/// Buffer length that triggers a flush without waiting for the tick.
pub const FLUSH_THRESHOLD: usize = 100;

/// Periodic flush interval.
pub const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(120);

/// Completion events queued between the response path and the worker.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Hard cap on buffered metrics while flushes are failing. Beyond this
/// the newest metrics are dropped rather than growing without bound.
const BUFFER_HARD_CAP: usize = 10_000;

/// Snapshot taken at request ingress.
#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub tunnel_id: String,
    pub started: Instant,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub request_size: i64,
    pub user_agent: Option<String>,
}

#[derive(Debug)]
struct FinalizeEvent {
    telemetry_id: String,
    status_code: u16,
    response_size: i64,
}

pub struct MetricsPipeline {
    db: DatabaseConnection,
    resolver: CountryResolver,
    active: DashMap<String, InflightRequest>,
    buffer: Mutex<Vec<MetricRecord>>,
    events_tx: mpsc::Sender<FinalizeEvent>,
    flush_notify: Notify,
}

impl MetricsPipeline {
    /// Creates the pipeline and spawns its event worker.
    pub fn spawn(db: DatabaseConnection, resolver: CountryResolver) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::channel::<FinalizeEvent>(EVENT_QUEUE_CAPACITY);

        let pipeline = Arc::new(Self {
            db,
            resolver,
            active: DashMap::new(),
            buffer: Mutex::new(Vec::new()),
            events_tx,
            flush_notify: Notify::new(),
        });

        let worker = Arc::clone(&pipeline);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                worker.process(event).await;
            }
        });

        pipeline
    }

    /// Snapshots an in-flight request and returns its telemetry id.
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        &self,
        tunnel_id: &str,
        method: &str,
        path: &str,
        client_ip: &str,
        request_size: i64,
        user_agent: Option<String>,
    ) -> String {
        let telemetry_id = ids::generate_telemetry_id();
        self.active.insert(
            telemetry_id.clone(),
            InflightRequest {
                tunnel_id: tunnel_id.to_string(),
                started: Instant::now(),
                timestamp: Utc::now(),
                method: method.to_string(),
                path: path.to_string(),
                client_ip: client_ip.to_string(),
                request_size,
                user_agent,
            },
        );
        telemetry_id
    }

    /// Queues the completion event for the worker. Never blocks: when the
    /// queue is saturated the metric is dropped and the in-flight entry
    /// released.
    pub fn finalize(&self, telemetry_id: &str, status_code: u16, response_size: i64) {
        let event = FinalizeEvent {
            telemetry_id: telemetry_id.to_string(),
            status_code,
            response_size,
        };
        if let Err(err) = self.events_tx.try_send(event) {
            warn!("telemetry queue saturated, dropping metric: {err}");
            self.active.remove(telemetry_id);
        }
    }

    async fn process(&self, event: FinalizeEvent) {
        let Some((_, inflight)) = self.active.remove(&event.telemetry_id) else {
            debug!(id = %event.telemetry_id, "finalize without capture, ignoring");
            return;
        };

        let response_time_ms = inflight.started.elapsed().as_millis() as i64;
        let country = self.resolver.resolve(&inflight.client_ip).await;

        let metric = MetricRecord {
            tunnel_id: inflight.tunnel_id,
            timestamp: inflight.timestamp,
            method: inflight.method,
            path: inflight.path,
            status_code: event.status_code,
            response_time_ms,
            request_size: inflight.request_size,
            response_size: event.response_size,
            client_ip: inflight.client_ip,
            country,
            user_agent: inflight.user_agent.as_deref().map(rollup::truncate_user_agent),
        };

        let is_error = metric.status_code >= 400;
        if let Err(err) =
            db::bump_live_stats(&self.db, &metric.tunnel_id, response_time_ms as f64, is_error)
                .await
        {
            warn!("live stats update failed: {err}");
        }
        if let Err(err) = db::insert_request_log(&self.db, &metric).await {
            warn!("request log insert failed: {err}");
        }
        if let Err(err) = db::record_tunnel_traffic(
            &self.db,
            &metric.tunnel_id,
            metric.request_size + metric.response_size,
        )
        .await
        {
            warn!("tunnel counters update failed: {err}");
        }

        let trigger = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() >= BUFFER_HARD_CAP {
                warn!("metrics buffer at hard cap, dropping metric");
                false
            } else {
                buffer.push(metric);
                buffer.len() >= FLUSH_THRESHOLD
            }
        };
        if trigger {
            self.flush_notify.notify_one();
        }
    }

    /// Rolls the buffered metrics up into hourly rows. Groups that fail
    /// to write are returned to the buffer for the next attempt.
    pub async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return;
        }

        // Partition so a failed group's metrics can be requeued intact.
        let mut groups: std::collections::HashMap<(String, DateTime<Utc>), Vec<MetricRecord>> =
            std::collections::HashMap::new();
        for metric in batch {
            let key = (
                metric.tunnel_id.clone(),
                rollup::truncate_to_hour(metric.timestamp),
            );
            groups.entry(key).or_default().push(metric);
        }

        let mut flushed = 0usize;
        let mut requeue: Vec<MetricRecord> = Vec::new();
        for ((tunnel_id, hour), metrics) in groups {
            let aggregates = rollup::aggregate(&metrics);
            let Some(agg) = aggregates.into_iter().next() else {
                continue;
            };
            match db::upsert_hourly_stats(&self.db, &agg).await {
                Ok(()) => flushed += metrics.len(),
                Err(err) => {
                    warn!(%tunnel_id, %hour, "hourly upsert failed, requeueing group: {err}");
                    requeue.extend(metrics);
                }
            }
        }

        if !requeue.is_empty() {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.extend(requeue);
        }
        debug!(flushed, "metrics flush complete");
    }

    /// Drives the periodic and threshold-triggered flushes. A panic in a
    /// flush discards that batch and re-arms the ticker.
    pub async fn run_flush_worker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_notify.notified() => {}
            }
            let pipeline = Arc::clone(&self);
            let run = tokio::spawn(async move { pipeline.flush().await });
            if let Err(join_err) = run.await {
                error!("metrics flush panicked, batch discarded: {join_err}");
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }
}
