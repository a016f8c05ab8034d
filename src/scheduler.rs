//! # Scheduler
//!
//! Periodic background work and the graceful-shutdown sequence.
//!
//! Tickers: metrics flush (2 min, plus threshold triggers), live-stats
//! decay (10 min), device-code cleanup (hourly), and the daily rollup at
//! the next local midnight and every 24 hours thereafter.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeZone, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::protocol::CLOSE_NORMAL;
use crate::state::{AppState, Outbound};

const DECAY_INTERVAL: Duration = Duration::from_secs(600);
const DEVICE_CODE_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Bound on the best-effort final flush during shutdown.
const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Spawns all periodic tasks. They run until the process exits.
pub fn spawn_background_tasks(state: &AppState) {
    // Metrics flush worker: periodic tick plus threshold triggers.
    tokio::spawn(state.metrics.clone().run_flush_worker());

    // Live-stats decay: zero rolling counters on idle rows.
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DECAY_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - chrono::Duration::minutes(10);
                match db::decay_idle_live_stats(&db, cutoff).await {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "decayed idle live stats"),
                    Err(err) => warn!("live stats decay failed: {err}"),
                }
            }
        });
    }

    // Expired device codes.
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEVICE_CODE_CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match db::delete_expired_device_codes(&db).await {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "deleted expired device codes"),
                    Err(err) => warn!("device code cleanup failed: {err}"),
                }
            }
        });
    }

    // Daily rollup at the next local midnight, then every 24 hours.
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(until_next_local_midnight()).await;
                let yesterday = (Utc::now() - chrono::Duration::days(1)).date_naive();
                match db::rollup_daily_stats(&db, yesterday).await {
                    Ok(tunnels) => info!(%yesterday, tunnels, "daily rollup complete"),
                    Err(err) => error!(%yesterday, "daily rollup failed: {err}"),
                }
            }
        });
    }
}

fn until_next_local_midnight() -> Duration {
    let now = Local::now();
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    let midnight = Local
        .from_local_datetime(&tomorrow.and_time(NaiveTime::MIN))
        .earliest()
        .unwrap_or_else(|| now + chrono::Duration::days(1));
    (midnight - now)
        .to_std()
        .unwrap_or(Duration::from_secs(24 * 3600))
}

/// Resolves once SIGINT or SIGTERM arrives and flips the shutdown flag,
/// which makes the ingress path answer 503 and lets the HTTP server
/// stop accepting.
pub async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    state.shutting_down.store(true, Ordering::Relaxed);
}

/// Runs after the listener has stopped accepting: settle in-flight
/// responders, close every agent session, flush the metrics buffer once
/// (bounded), and release the database.
pub async fn finalize_shutdown(state: &AppState) {
    info!("draining before exit");

    state.mux.shutdown_all();

    for entry in state.agents.iter() {
        let _ = entry.value().tx.send(Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "server shutting down",
        });
    }
    state.agents.clear();

    if tokio::time::timeout(FINAL_FLUSH_DEADLINE, state.metrics.flush())
        .await
        .is_err()
    {
        warn!("final metrics flush did not finish in time");
    }

    if let Err(err) = state.db.clone().close().await {
        warn!("database close failed: {err}");
    }
    info!("shutdown complete");
}
