//! Integration tests for the persistence gateway and telemetry rollups,
//! run against a real SQLite in-memory database.

use chrono::{Duration, TimeZone, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use tunnel_hub::db::entities::{daily_stats, hourly_stats, live_stats, request_log, tunnel};
use tunnel_hub::db::{self, ClaimOutcome, PollOutcome, TunnelUpsert};
use tunnel_hub::geo::CountryResolver;
use tunnel_hub::metrics::MetricsPipeline;
use tunnel_hub::rollup::{self, HourlyAggregate, MetricRecord};

async fn setup_test_db() -> DatabaseConnection {
    let db = db::connect("sqlite::memory:")
        .await
        .expect("failed to connect to in-memory database");
    db::migrate(&db).await.expect("failed to run migrations");
    db
}

/// Creates a user and a connected tunnel to hang other rows off of.
async fn seed_tunnel(db: &DatabaseConnection, id: &str) -> tunnel::Model {
    db::ensure_user(db, "user-1", "u@x").await.expect("user");
    db::upsert_tunnel(
        db,
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
    .expect("tunnel upsert")
}

fn metric(tunnel_id: &str, status: u16, rt_ms: i64, path: &str) -> MetricRecord {
    metric_at(Utc::now(), tunnel_id, status, rt_ms, path)
}

fn metric_at(
    timestamp: chrono::DateTime<Utc>,
    tunnel_id: &str,
    status: u16,
    rt_ms: i64,
    path: &str,
) -> MetricRecord {
    MetricRecord {
        tunnel_id: tunnel_id.to_string(),
        timestamp,
        method: "GET".to_string(),
        path: path.to_string(),
        status_code: status,
        response_time_ms: rt_ms,
        request_size: 0,
        response_size: 4,
        client_ip: "127.0.0.1".to_string(),
        country: Some("LOCAL".to_string()),
        user_agent: None,
    }
}

#[tokio::test]
async fn migrations_run_successfully() {
    let db = db::connect("sqlite::memory:").await.expect("connect");
    assert!(db::migrate(&db).await.is_ok());
}

#[tokio::test]
async fn ensure_user_is_idempotent() {
    let db = setup_test_db().await;

    let first = db::ensure_user(&db, "user-1", "u@x").await.unwrap();
    let second = db::ensure_user(&db, "user-1", "u@x").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.email, "u@x");
}

#[tokio::test]
async fn upsert_tunnel_creates_then_reconnects() {
    let db = setup_test_db().await;
    let created = seed_tunnel(&db, "t1").await;

    assert!(created.is_active);
    assert_eq!(created.protocol, "http");
    assert_eq!(created.total_requests, 0);
    assert!(created.connected_at.is_some());

    db::mark_tunnel_disconnected(&db, "t1").await.unwrap();
    let disconnected = db::get_tunnel_by_identifier(&db, "t1")
        .await
        .unwrap()
        .unwrap();
    assert!(!disconnected.is_active);
    assert!(disconnected.last_disconnected.is_some());

    // Re-registration refreshes the settings and flips the flag back.
    let reconnected = db::upsert_tunnel(
        &db,
        TunnelUpsert {
            id: "t1".to_string(),
            user_id: "user-1".to_string(),
            name: "renamed".to_string(),
            subdomain: "t1".to_string(),
            local_port: Some(4000),
            description: Some("demo".to_string()),
        },
    )
    .await
    .unwrap();

    assert!(reconnected.is_active);
    assert_eq!(reconnected.name, "renamed");
    assert_eq!(reconnected.local_port, Some(4000));
}

#[tokio::test]
async fn tunnel_lookup_by_subdomain_then_id() {
    let db = setup_test_db().await;
    db::ensure_user(&db, "user-1", "u@x").await.unwrap();
    db::upsert_tunnel(
        &db,
        TunnelUpsert {
            id: "t1".to_string(),
            user_id: "user-1".to_string(),
            name: "t1".to_string(),
            subdomain: "myapp".to_string(),
            local_port: None,
            description: None,
        },
    )
    .await
    .unwrap();

    let by_subdomain = db::get_tunnel_by_identifier(&db, "myapp").await.unwrap();
    assert_eq!(by_subdomain.unwrap().id, "t1");

    let by_id = db::get_tunnel_by_identifier(&db, "t1").await.unwrap();
    assert_eq!(by_id.unwrap().subdomain, "myapp");

    assert!(db::get_tunnel_by_identifier(&db, "nope")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn subdomain_taken_excludes_own_tunnel() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    assert!(db::subdomain_taken(&db, "t1", "other").await.unwrap());
    // A tunnel keeping its own subdomain is not a conflict.
    assert!(!db::subdomain_taken(&db, "t1", "t1").await.unwrap());
    assert!(!db::subdomain_taken(&db, "free", "t1").await.unwrap());
}

#[tokio::test]
async fn live_stats_increment_and_last_wins_average() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    db::bump_live_stats(&db, "t1", 120.0, false).await.unwrap();
    db::bump_live_stats(&db, "t1", 80.0, true).await.unwrap();
    db::bump_live_stats(&db, "t1", 45.0, false).await.unwrap();

    let row = live_stats::Entity::find_by_id("t1")
        .one(&db)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(row.requests_last_5_min, 3);
    assert_eq!(row.requests_last_1_hour, 3);
    // Last-wins, not a rolling mean.
    assert!((row.avg_response_time - 45.0).abs() < f64::EPSILON);
    // Accumulator, not a rate.
    assert_eq!(row.error_rate, 1);
}

#[tokio::test]
async fn live_stats_decay_only_touches_idle_rows() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;
    db::bump_live_stats(&db, "t1", 50.0, false).await.unwrap();

    // A cutoff in the past leaves the fresh row alone.
    let stale_cutoff = Utc::now() - Duration::minutes(10);
    assert_eq!(db::decay_idle_live_stats(&db, stale_cutoff).await.unwrap(), 0);

    // A cutoff in the future treats the row as idle.
    let future_cutoff = Utc::now() + Duration::minutes(1);
    assert_eq!(db::decay_idle_live_stats(&db, future_cutoff).await.unwrap(), 1);

    let row = live_stats::Entity::find_by_id("t1")
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.requests_last_5_min, 0);
    assert_eq!(row.requests_last_1_hour, 0);
}

#[tokio::test]
async fn hourly_rollup_matches_expected_counters() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    // Three metrics within one UTC hour: two on /a, one 500 on /b.
    let ts = Utc.with_ymd_and_hms(2026, 3, 4, 13, 5, 0).unwrap();
    let batch = vec![
        metric_at(ts, "t1", 200, 100, "/a"),
        metric_at(ts, "t1", 500, 200, "/b"),
        metric_at(ts, "t1", 200, 100, "/a"),
    ];
    let aggregates = rollup::aggregate(&batch);
    assert_eq!(aggregates.len(), 1);
    db::upsert_hourly_stats(&db, &aggregates[0]).await.unwrap();

    let row = hourly_stats::Entity::find()
        .filter(hourly_stats::Column::TunnelId.eq("t1"))
        .one(&db)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(row.total_requests, 3);
    assert_eq!(row.success_requests, 2);
    assert_eq!(row.error_requests, 1);

    let top_paths: Vec<(String, i64)> = serde_json::from_str(&row.top_paths).unwrap();
    assert_eq!(
        top_paths,
        vec![("GET /a".to_string(), 2), ("GET /b".to_string(), 1)]
    );
    let status_codes: Vec<(String, i64)> = serde_json::from_str(&row.status_codes).unwrap();
    assert_eq!(
        status_codes,
        vec![("200".to_string(), 2), ("500".to_string(), 1)]
    );
}

#[tokio::test]
async fn hourly_update_branch_increments_and_merges() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    let ts = Utc.with_ymd_and_hms(2026, 3, 4, 13, 5, 0).unwrap();
    let first = rollup::aggregate(&[
        metric_at(ts, "t1", 200, 100, "/a"),
        metric_at(ts, "t1", 200, 100, "/a"),
    ]);
    db::upsert_hourly_stats(&db, &first[0]).await.unwrap();

    let second = rollup::aggregate(&[metric_at(ts, "t1", 404, 50, "/b")]);
    db::upsert_hourly_stats(&db, &second[0]).await.unwrap();

    let rows = hourly_stats::Entity::find()
        .filter(hourly_stats::Column::TunnelId.eq("t1"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "same (tunnel, hour) key must upsert");
    let row = &rows[0];

    assert_eq!(row.total_requests, 3);
    assert_eq!(row.success_requests, 2);
    assert_eq!(row.error_requests, 1);
    // Batch mean, per the update-branch contract.
    assert!((row.avg_response_time - 50.0).abs() < f64::EPSILON);

    // Earlier batches keep contributing to the merged top-k.
    let top_paths: Vec<(String, i64)> = serde_json::from_str(&row.top_paths).unwrap();
    assert_eq!(
        top_paths,
        vec![("GET /a".to_string(), 2), ("GET /b".to_string(), 1)]
    );
}

#[tokio::test]
async fn daily_rollup_sums_hours_and_picks_peak() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    let date = Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap().date_naive();
    let quiet_hour = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();
    let busy_hour = Utc.with_ymd_and_hms(2026, 3, 4, 13, 0, 0).unwrap();

    for (hour, total, errors) in [(quiet_hour, 5, 1), (busy_hour, 20, 2)] {
        db::upsert_hourly_stats(
            &db,
            &HourlyAggregate {
                tunnel_id: "t1".to_string(),
                hour,
                total_requests: total,
                success_requests: total - errors,
                error_requests: errors,
                avg_response_time: 100.0,
                total_bandwidth: 1000,
                unique_visitors: 3,
                top_paths: vec![("GET /".to_string(), total as i64)],
                top_countries: vec![],
                status_codes: vec![("200".to_string(), total as i64)],
            },
        )
        .await
        .unwrap();
    }

    assert_eq!(db::rollup_daily_stats(&db, date).await.unwrap(), 1);

    let row = daily_stats::Entity::find()
        .filter(daily_stats::Column::TunnelId.eq("t1"))
        .one(&db)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(row.total_requests, 25);
    assert_eq!(row.success_requests, 22);
    assert_eq!(row.error_requests, 3);
    assert_eq!(row.total_bandwidth, 2000);
    assert!((0..=23).contains(&row.peak_hour));
    assert_eq!(row.peak_hour, 13);

    // Re-running recomputes rather than double-counting.
    assert_eq!(db::rollup_daily_stats(&db, date).await.unwrap(), 1);
    let rows = daily_stats::Entity::find()
        .filter(daily_stats::Column::TunnelId.eq("t1"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_requests, 25);
}

#[tokio::test]
async fn request_log_row_round_trips() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    let mut record = metric("t1", 200, 40, "/ping");
    record.user_agent = Some("curl/8.0".to_string());
    db::insert_request_log(&db, &record).await.unwrap();

    let rows = request_log::Entity::find()
        .filter(request_log::Column::TunnelId.eq("t1"))
        .all(&db)
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].method, "GET");
    assert_eq!(rows[0].path, "/ping");
    assert_eq!(rows[0].status_code, 200);
    assert_eq!(rows[0].country.as_deref(), Some("LOCAL"));
    assert_eq!(rows[0].user_agent.as_deref(), Some("curl/8.0"));
}

#[tokio::test]
async fn tunnel_traffic_counters_accumulate() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    db::record_tunnel_traffic(&db, "t1", 500).await.unwrap();
    db::record_tunnel_traffic(&db, "t1", 250).await.unwrap();

    let row = tunnel::Entity::find_by_id("t1").one(&db).await.unwrap().unwrap();
    assert_eq!(row.total_requests, 2);
    assert_eq!(row.total_bandwidth, 750);
}

#[tokio::test]
async fn device_code_lifecycle() {
    let db = setup_test_db().await;
    db::ensure_user(&db, "user-1", "u@x").await.unwrap();

    let code = db::allocate_device_code(&db, Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(code.code.len(), 6);
    assert!(code
        .code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    assert!(!code.claimed);

    // Nothing bound yet: the agent keeps polling.
    assert_eq!(
        db::take_device_token(&db, &code.code).await.unwrap(),
        PollOutcome::Pending
    );

    // Browser flow binds the user and a token.
    assert_eq!(
        db::claim_device_code(&db, &code.code, "user-1", "signed-jwt")
            .await
            .unwrap(),
        ClaimOutcome::Claimed
    );
    assert_eq!(
        db::claim_device_code(&db, &code.code, "user-1", "signed-jwt")
            .await
            .unwrap(),
        ClaimOutcome::AlreadyClaimed
    );

    // Token is handed out exactly once.
    assert_eq!(
        db::take_device_token(&db, &code.code).await.unwrap(),
        PollOutcome::Ready("signed-jwt".to_string())
    );
    assert_eq!(
        db::take_device_token(&db, &code.code).await.unwrap(),
        PollOutcome::NotFound
    );

    assert_eq!(
        db::claim_device_code(&db, "ZZZZZZ", "user-1", "t").await.unwrap(),
        ClaimOutcome::NotFound
    );
}

#[tokio::test]
async fn expired_device_codes_are_swept() {
    let db = setup_test_db().await;

    db::allocate_device_code(&db, Duration::minutes(-1))
        .await
        .unwrap();
    db::allocate_device_code(&db, Duration::minutes(10))
        .await
        .unwrap();

    assert_eq!(db::delete_expired_device_codes(&db).await.unwrap(), 1);
    assert_eq!(db::delete_expired_device_codes(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn pipeline_capture_finalize_flush_end_to_end() {
    let db = setup_test_db().await;
    seed_tunnel(&db, "t1").await;

    let pipeline = MetricsPipeline::spawn(db.clone(), CountryResolver::new());
    let telemetry_id = pipeline.capture("t1", "GET", "/ping", "127.0.0.1", 0, None);
    pipeline.finalize(&telemetry_id, 200, 4);

    // The worker drains the event off the response path.
    let mut waited = 0;
    while pipeline.buffered() == 0 && waited < 200 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(pipeline.buffered(), 1, "worker should have buffered the metric");
    assert_eq!(pipeline.in_flight(), 0);

    // Live counters and the request log were written eagerly.
    let live = live_stats::Entity::find_by_id("t1")
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.requests_last_5_min, 1);

    let logs = request_log::Entity::find()
        .filter(request_log::Column::TunnelId.eq("t1"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].path, "/ping");
    assert_eq!(logs[0].country.as_deref(), Some("LOCAL"));

    // The flush rolls the buffer into an hourly row and clears it.
    pipeline.flush().await;
    assert_eq!(pipeline.buffered(), 0);

    let hourly = hourly_stats::Entity::find()
        .filter(hourly_stats::Column::TunnelId.eq("t1"))
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hourly.total_requests, 1);
    assert_eq!(hourly.success_requests, 1);
}
