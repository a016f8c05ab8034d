//! Time-bucketed aggregation for the telemetry pipeline.
//!
//! Pure functions over metric batches: hour truncation, per-(tunnel, hour)
//! grouping, and the bounded top-k mappings stored on hourly rows.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Top-k mappings keep at most this many entries.
pub const TOP_K: usize = 10;

/// User agents are truncated to this many bytes before logging.
pub const USER_AGENT_MAX_BYTES: usize = 500;

/// One completed public request, as buffered between finalize and flush.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub tunnel_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub request_size: i64,
    pub response_size: i64,
    pub client_ip: String,
    pub country: Option<String>,
    pub user_agent: Option<String>,
}

/// An ordered `(label, count)` mapping, at most [`TOP_K`] entries, sorted
/// descending by count. Serialized as a JSON array of pairs.
pub type TopEntries = Vec<(String, i64)>;

/// Aggregate of one `(tunnel_id, hour)` group of metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub tunnel_id: String,
    pub hour: DateTime<Utc>,
    pub total_requests: i32,
    pub success_requests: i32,
    pub error_requests: i32,
    pub avg_response_time: f64,
    pub total_bandwidth: i64,
    pub unique_visitors: i32,
    pub top_paths: TopEntries,
    pub top_countries: TopEntries,
    pub status_codes: TopEntries,
}

/// Truncates a timestamp to its UTC hour.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Sorts a count map descending and keeps the top [`TOP_K`] entries.
/// Ties break on the label so the output is deterministic.
pub fn top_k(counts: HashMap<String, i64>) -> TopEntries {
    let mut entries: Vec<(String, i64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_K);
    entries
}

/// Merges a stored top-k mapping with a fresh batch, re-sorting and
/// re-truncating. Used on the hourly update branch so earlier batches in
/// the same hour keep contributing.
pub fn merge_top_k(existing: &[(String, i64)], incoming: &[(String, i64)]) -> TopEntries {
    let mut counts: HashMap<String, i64> = existing.iter().cloned().collect();
    for (label, count) in incoming {
        *counts.entry(label.clone()).or_insert(0) += count;
    }
    top_k(counts)
}

/// Groups a drained metric batch by `(tunnel_id, utc hour)` and computes
/// each group's aggregate.
pub fn aggregate(batch: &[MetricRecord]) -> Vec<HourlyAggregate> {
    let mut groups: HashMap<(String, DateTime<Utc>), Vec<&MetricRecord>> = HashMap::new();
    for metric in batch {
        let key = (metric.tunnel_id.clone(), truncate_to_hour(metric.timestamp));
        groups.entry(key).or_default().push(metric);
    }

    let mut aggregates: Vec<HourlyAggregate> = groups
        .into_iter()
        .map(|((tunnel_id, hour), metrics)| aggregate_group(tunnel_id, hour, &metrics))
        .collect();
    // Deterministic flush order across keys.
    aggregates.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id).then(a.hour.cmp(&b.hour)));
    aggregates
}

fn aggregate_group(
    tunnel_id: String,
    hour: DateTime<Utc>,
    metrics: &[&MetricRecord],
) -> HourlyAggregate {
    let total = metrics.len() as i32;
    let errors = metrics.iter().filter(|m| m.status_code >= 400).count() as i32;
    let response_time_sum: i64 = metrics.iter().map(|m| m.response_time_ms).sum();
    let bandwidth: i64 = metrics
        .iter()
        .map(|m| m.request_size + m.response_size)
        .sum();

    let unique_ips: HashSet<&str> = metrics.iter().map(|m| m.client_ip.as_str()).collect();

    let mut paths: HashMap<String, i64> = HashMap::new();
    let mut countries: HashMap<String, i64> = HashMap::new();
    let mut statuses: HashMap<String, i64> = HashMap::new();
    for metric in metrics {
        *paths
            .entry(format!("{} {}", metric.method, metric.path))
            .or_insert(0) += 1;
        if let Some(country) = &metric.country {
            *countries.entry(country.clone()).or_insert(0) += 1;
        }
        *statuses.entry(metric.status_code.to_string()).or_insert(0) += 1;
    }

    HourlyAggregate {
        tunnel_id,
        hour,
        total_requests: total,
        success_requests: total - errors,
        error_requests: errors,
        avg_response_time: if total > 0 {
            response_time_sum as f64 / total as f64
        } else {
            0.0
        },
        total_bandwidth: bandwidth,
        unique_visitors: unique_ips.len() as i32,
        top_paths: top_k(paths),
        top_countries: top_k(countries),
        status_codes: top_k(statuses),
    }
}

/// Truncates a user agent to [`USER_AGENT_MAX_BYTES`], respecting char
/// boundaries.
pub fn truncate_user_agent(user_agent: &str) -> String {
    if user_agent.len() <= USER_AGENT_MAX_BYTES {
        return user_agent.to_string();
    }
    let mut end = USER_AGENT_MAX_BYTES;
    while !user_agent.is_char_boundary(end) {
        end -= 1;
    }
    user_agent[..end].to_string()
}
