//! # Persistence Gateway
//!
//! Typed operations over the relational schema. Backends:
//! - **PostgreSQL** (production)
//! - **SQLite** (development, tests, `sqlite::memory:`)
//!
//! All operations are safe to call concurrently; none span a transaction
//! across component boundaries.

pub mod entities;
pub mod migrator;

use chrono::{Duration, NaiveDate, NaiveTime, Timelike, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr,
    EntityTrait, NotSet, QueryFilter, Set,
};
use tracing::{info, warn};

use crate::error::DeviceCodeError;
use crate::ids;
use crate::rollup::{merge_top_k, HourlyAggregate, MetricRecord, TopEntries};

use entities::{daily_stats, device_auth_code, hourly_stats, live_stats, request_log, tunnel, user};

/// Initialize the database connection.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;
    info!("connected to database backend: {:?}", db.get_database_backend());
    Ok(db)
}

/// Run pending migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm_migration::MigratorTrait;

    info!("running database migrations");
    migrator::Migrator::up(db, None).await
}

// ── Users ───────────────────────────────────────────────────────

/// Creates the user row if it does not exist yet.
pub async fn ensure_user(
    db: &DatabaseConnection,
    user_id: &str,
    email: &str,
) -> Result<user::Model, DbErr> {
    if let Some(existing) = user::Entity::find_by_id(user_id).one(db).await? {
        return Ok(existing);
    }
    user::ActiveModel {
        id: Set(user_id.to_string()),
        email: Set(email.to_string()),
        name: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
}

// ── Tunnels ─────────────────────────────────────────────────────

/// Fields an agent supplies (or defaults) when registering a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelUpsert {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub subdomain: String,
    pub local_port: Option<i32>,
    pub description: Option<String>,
}

/// Resolves a tunnel by subdomain first, then by id.
pub async fn get_tunnel_by_identifier(
    db: &DatabaseConnection,
    identifier: &str,
) -> Result<Option<tunnel::Model>, DbErr> {
    if let Some(found) = tunnel::Entity::find()
        .filter(tunnel::Column::Subdomain.eq(identifier))
        .one(db)
        .await?
    {
        return Ok(Some(found));
    }
    tunnel::Entity::find_by_id(identifier).one(db).await
}

/// True when another tunnel already owns `subdomain`.
pub async fn subdomain_taken(
    db: &DatabaseConnection,
    subdomain: &str,
    excluding_tunnel_id: &str,
) -> Result<bool, DbErr> {
    Ok(tunnel::Entity::find()
        .filter(tunnel::Column::Subdomain.eq(subdomain))
        .filter(tunnel::Column::Id.ne(excluding_tunnel_id))
        .one(db)
        .await?
        .is_some())
}

/// Creates or reconnects a tunnel row: the update branch refreshes the
/// agent-supplied settings and marks the tunnel connected.
pub async fn upsert_tunnel(
    db: &DatabaseConnection,
    fields: TunnelUpsert,
) -> Result<tunnel::Model, DbErr> {
    let now = Utc::now();

    match tunnel::Entity::find_by_id(&fields.id).one(db).await? {
        Some(existing) => {
            let mut active: tunnel::ActiveModel = existing.into();
            active.name = Set(fields.name);
            active.subdomain = Set(fields.subdomain);
            active.local_port = Set(fields.local_port);
            active.description = Set(fields.description);
            active.is_active = Set(true);
            active.connected_at = Set(Some(now));
            active.last_connected = Set(Some(now));
            active.update(db).await
        }
        None => {
            tunnel::ActiveModel {
                id: Set(fields.id),
                subdomain: Set(fields.subdomain),
                user_id: Set(fields.user_id),
                name: Set(fields.name),
                description: Set(fields.description),
                local_port: Set(fields.local_port),
                protocol: Set("http".to_string()),
                custom_domain: Set(None),
                is_active: Set(true),
                connected_at: Set(Some(now)),
                last_connected: Set(Some(now)),
                last_disconnected: Set(None),
                total_requests: Set(0),
                total_bandwidth: Set(0),
                created_at: Set(now),
            }
            .insert(db)
            .await
        }
    }
}

/// Marks a tunnel disconnected. Used on transport close and as the
/// best-effort repair when a persisted-active tunnel has no session.
pub async fn mark_tunnel_disconnected(db: &DatabaseConnection, id: &str) -> Result<(), DbErr> {
    tunnel::Entity::update_many()
        .col_expr(tunnel::Column::IsActive, Expr::value(false))
        .col_expr(tunnel::Column::LastDisconnected, Expr::value(Utc::now()))
        .filter(tunnel::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Bumps the cumulative per-tunnel counters with atomic increments.
pub async fn record_tunnel_traffic(
    db: &DatabaseConnection,
    tunnel_id: &str,
    bandwidth: i64,
) -> Result<(), DbErr> {
    tunnel::Entity::update_many()
        .col_expr(
            tunnel::Column::TotalRequests,
            Expr::col(tunnel::Column::TotalRequests).add(1),
        )
        .col_expr(
            tunnel::Column::TotalBandwidth,
            Expr::col(tunnel::Column::TotalBandwidth).add(bandwidth),
        )
        .filter(tunnel::Column::Id.eq(tunnel_id))
        .exec(db)
        .await?;
    Ok(())
}

// ── Live stats ──────────────────────────────────────────────────

/// Eager per-request update of the live counters.
///
/// Increments are applied in the database so concurrent request paths do
/// not lose updates. `avg_response_time` is last-wins and `error_rate`
/// accumulates, as the dashboards expect.
pub async fn bump_live_stats(
    db: &DatabaseConnection,
    tunnel_id: &str,
    response_time_ms: f64,
    is_error: bool,
) -> Result<(), DbErr> {
    let now = Utc::now();
    let error_delta: i32 = if is_error { 1 } else { 0 };

    let bump = || {
        live_stats::Entity::update_many()
            .col_expr(
                live_stats::Column::RequestsLast5Min,
                Expr::col(live_stats::Column::RequestsLast5Min).add(1),
            )
            .col_expr(
                live_stats::Column::RequestsLast1Hour,
                Expr::col(live_stats::Column::RequestsLast1Hour).add(1),
            )
            .col_expr(
                live_stats::Column::AvgResponseTime,
                Expr::value(response_time_ms),
            )
            .col_expr(
                live_stats::Column::ErrorRate,
                Expr::col(live_stats::Column::ErrorRate).add(error_delta),
            )
            .col_expr(live_stats::Column::LastUpdated, Expr::value(now))
            .filter(live_stats::Column::TunnelId.eq(tunnel_id))
    };

    if bump().exec(db).await?.rows_affected > 0 {
        return Ok(());
    }

    let inserted = live_stats::ActiveModel {
        tunnel_id: Set(tunnel_id.to_string()),
        requests_last_5_min: Set(1),
        requests_last_1_hour: Set(1),
        avg_response_time: Set(response_time_ms),
        error_rate: Set(error_delta),
        last_updated: Set(now),
    }
    .insert(db)
    .await;

    match inserted {
        Ok(_) => Ok(()),
        // Lost the first-row race to a concurrent request; increment instead.
        Err(insert_err) => {
            if bump().exec(db).await?.rows_affected > 0 {
                Ok(())
            } else {
                Err(insert_err)
            }
        }
    }
}

/// Zeroes the rolling counters on rows idle since `cutoff`.
pub async fn decay_idle_live_stats(
    db: &DatabaseConnection,
    cutoff: chrono::DateTime<Utc>,
) -> Result<u64, DbErr> {
    let result = live_stats::Entity::update_many()
        .col_expr(live_stats::Column::RequestsLast5Min, Expr::value(0))
        .col_expr(live_stats::Column::RequestsLast1Hour, Expr::value(0))
        .filter(live_stats::Column::LastUpdated.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// ── Hourly / daily stats ────────────────────────────────────────

fn parse_top(text: &str) -> TopEntries {
    serde_json::from_str(text).unwrap_or_default()
}

fn encode_top(entries: &TopEntries) -> String {
    serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string())
}

/// Upserts one `(tunnel_id, hour)` aggregate.
///
/// The create branch writes absolute values; the update branch increments
/// the counters, merges the top-k mappings with the batch, and sets
/// `avg_response_time` to the batch mean.
pub async fn upsert_hourly_stats(
    db: &DatabaseConnection,
    agg: &HourlyAggregate,
) -> Result<(), DbErr> {
    let existing = hourly_stats::Entity::find()
        .filter(hourly_stats::Column::TunnelId.eq(&agg.tunnel_id))
        .filter(hourly_stats::Column::Hour.eq(agg.hour))
        .one(db)
        .await?;

    match existing {
        None => {
            hourly_stats::ActiveModel {
                id: NotSet,
                tunnel_id: Set(agg.tunnel_id.clone()),
                hour: Set(agg.hour),
                total_requests: Set(agg.total_requests),
                success_requests: Set(agg.success_requests),
                error_requests: Set(agg.error_requests),
                avg_response_time: Set(agg.avg_response_time),
                total_bandwidth: Set(agg.total_bandwidth),
                unique_visitors: Set(agg.unique_visitors),
                top_paths: Set(encode_top(&agg.top_paths)),
                top_countries: Set(encode_top(&agg.top_countries)),
                status_codes: Set(encode_top(&agg.status_codes)),
            }
            .insert(db)
            .await?;
        }
        Some(row) => {
            let top_paths = merge_top_k(&parse_top(&row.top_paths), &agg.top_paths);
            let top_countries = merge_top_k(&parse_top(&row.top_countries), &agg.top_countries);
            let status_codes = merge_top_k(&parse_top(&row.status_codes), &agg.status_codes);
            let total_requests = row.total_requests + agg.total_requests;
            let success_requests = row.success_requests + agg.success_requests;
            let error_requests = row.error_requests + agg.error_requests;
            let total_bandwidth = row.total_bandwidth + agg.total_bandwidth;
            let unique_visitors = row.unique_visitors + agg.unique_visitors;

            let mut active: hourly_stats::ActiveModel = row.into();
            active.total_requests = Set(total_requests);
            active.success_requests = Set(success_requests);
            active.error_requests = Set(error_requests);
            active.avg_response_time = Set(agg.avg_response_time);
            active.total_bandwidth = Set(total_bandwidth);
            active.unique_visitors = Set(unique_visitors);
            active.top_paths = Set(encode_top(&top_paths));
            active.top_countries = Set(encode_top(&top_countries));
            active.status_codes = Set(encode_top(&status_codes));
            active.update(db).await?;
        }
    }
    Ok(())
}

/// Rolls one day of hourly rows into `daily_stats`, one row per tunnel.
/// Recomputes from the hourly rows, so re-running for the same date is
/// idempotent. Returns the number of tunnels rolled up.
pub async fn rollup_daily_stats(db: &DatabaseConnection, date: NaiveDate) -> Result<u64, DbErr> {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    let end = start + Duration::days(1);

    let rows = hourly_stats::Entity::find()
        .filter(hourly_stats::Column::Hour.gte(start))
        .filter(hourly_stats::Column::Hour.lt(end))
        .all(db)
        .await?;

    let mut by_tunnel: std::collections::HashMap<String, Vec<&hourly_stats::Model>> =
        std::collections::HashMap::new();
    for row in &rows {
        by_tunnel.entry(row.tunnel_id.clone()).or_default().push(row);
    }

    let mut rolled = 0u64;
    for (tunnel_id, hours) in by_tunnel {
        let total: i32 = hours.iter().map(|h| h.total_requests).sum();
        let success: i32 = hours.iter().map(|h| h.success_requests).sum();
        let errors: i32 = hours.iter().map(|h| h.error_requests).sum();
        let bandwidth: i64 = hours.iter().map(|h| h.total_bandwidth).sum();
        let visitors: i32 = hours.iter().map(|h| h.unique_visitors).sum();
        let avg_response_time =
            hours.iter().map(|h| h.avg_response_time).sum::<f64>() / hours.len() as f64;
        let peak_hour = hours
            .iter()
            .max_by_key(|h| h.total_requests)
            .map(|h| h.hour.hour() as i32)
            .unwrap_or(0);

        let existing = daily_stats::Entity::find()
            .filter(daily_stats::Column::TunnelId.eq(&tunnel_id))
            .filter(daily_stats::Column::Date.eq(date))
            .one(db)
            .await?;

        match existing {
            None => {
                daily_stats::ActiveModel {
                    id: NotSet,
                    tunnel_id: Set(tunnel_id),
                    date: Set(date),
                    total_requests: Set(total),
                    success_requests: Set(success),
                    error_requests: Set(errors),
                    avg_response_time: Set(avg_response_time),
                    total_bandwidth: Set(bandwidth),
                    unique_visitors: Set(visitors),
                    peak_hour: Set(peak_hour),
                }
                .insert(db)
                .await?;
            }
            Some(row) => {
                let mut active: daily_stats::ActiveModel = row.into();
                active.total_requests = Set(total);
                active.success_requests = Set(success);
                active.error_requests = Set(errors);
                active.avg_response_time = Set(avg_response_time);
                active.total_bandwidth = Set(bandwidth);
                active.unique_visitors = Set(visitors);
                active.peak_hour = Set(peak_hour);
                active.update(db).await?;
            }
        }
        rolled += 1;
    }
    Ok(rolled)
}

// ── Request log ─────────────────────────────────────────────────

pub async fn insert_request_log(
    db: &DatabaseConnection,
    metric: &MetricRecord,
) -> Result<(), DbErr> {
    request_log::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        tunnel_id: Set(metric.tunnel_id.clone()),
        path: Set(metric.path.clone()),
        method: Set(metric.method.clone()),
        status_code: Set(i32::from(metric.status_code)),
        response_time: Set(metric.response_time_ms.min(i64::from(i32::MAX)) as i32),
        request_size: Set(metric.request_size),
        response_size: Set(metric.response_size),
        client_ip: Set(metric.client_ip.clone()),
        country: Set(metric.country.clone()),
        user_agent: Set(metric.user_agent.clone()),
        timestamp: Set(metric.timestamp),
    }
    .insert(db)
    .await?;
    Ok(())
}

// ── Device auth codes ───────────────────────────────────────────

/// Allocates a fresh device code, retrying on collision with a live row.
pub async fn allocate_device_code(
    db: &DatabaseConnection,
    ttl: Duration,
) -> Result<device_auth_code::Model, DeviceCodeError> {
    const MAX_ATTEMPTS: usize = 10;

    for attempt in 1..=MAX_ATTEMPTS {
        let code = ids::generate_device_code();
        if find_device_code(db, &code).await?.is_some() {
            warn!(%code, attempt, "device code collision, regenerating");
            continue;
        }
        let now = Utc::now();
        let row = device_auth_code::ActiveModel {
            code: Set(code),
            user_id: Set(None),
            token: Set(None),
            expires_at: Set(now + ttl),
            is_used: Set(false),
            claimed: Set(false),
            created_at: Set(now),
        }
        .insert(db)
        .await?;
        return Ok(row);
    }
    Err(DeviceCodeError::Exhausted)
}

pub async fn find_device_code(
    db: &DatabaseConnection,
    code: &str,
) -> Result<Option<device_auth_code::Model>, DbErr> {
    device_auth_code::Entity::find_by_id(code).one(db).await
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    NotFound,
    Expired,
    AlreadyClaimed,
}

/// Binds a user and freshly-signed token to a live device code. Called by
/// the browser-side activation flow.
pub async fn claim_device_code(
    db: &DatabaseConnection,
    code: &str,
    user_id: &str,
    token: &str,
) -> Result<ClaimOutcome, DbErr> {
    let Some(row) = find_device_code(db, code).await? else {
        return Ok(ClaimOutcome::NotFound);
    };
    if row.expires_at < Utc::now() {
        return Ok(ClaimOutcome::Expired);
    }
    if row.claimed {
        return Ok(ClaimOutcome::AlreadyClaimed);
    }

    let mut active: device_auth_code::ActiveModel = row.into();
    active.user_id = Set(Some(user_id.to_string()));
    active.token = Set(Some(token.to_string()));
    active.claimed = Set(true);
    active.update(db).await?;
    Ok(ClaimOutcome::Claimed)
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    NotFound,
    Pending,
    Ready(String),
}

/// Agent-side poll: hands the bound token out at most once.
pub async fn take_device_token(
    db: &DatabaseConnection,
    code: &str,
) -> Result<PollOutcome, DbErr> {
    let Some(row) = find_device_code(db, code).await? else {
        return Ok(PollOutcome::NotFound);
    };
    if row.is_used || row.expires_at < Utc::now() {
        return Ok(PollOutcome::NotFound);
    }
    match (row.claimed, row.token.clone()) {
        (true, Some(token)) => {
            let mut active: device_auth_code::ActiveModel = row.into();
            active.is_used = Set(true);
            active.update(db).await?;
            Ok(PollOutcome::Ready(token))
        }
        _ => Ok(PollOutcome::Pending),
    }
}

pub async fn delete_expired_device_codes(db: &DatabaseConnection) -> Result<u64, DbErr> {
    let result = device_auth_code::Entity::delete_many()
        .filter(device_auth_code::Column::ExpiresAt.lt(Utc::now()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}
