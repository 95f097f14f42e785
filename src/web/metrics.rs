use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use salvo::http::header::CONTENT_TYPE;
use salvo::http::HeaderValue;
use salvo::prelude::*;

const MESSAGES_COUNT: &str = "msteams_bridge_messages_count";
const REACTIONS_COUNT: &str = "msteams_bridge_reactions_count";
const FILES_COUNT: &str = "msteams_bridge_files_count";
const CHANGE_EVENT_TOTAL: &str = "msteams_bridge_change_event_total";
const PROCESSED_CHANGE_EVENT_TOTAL: &str = "msteams_bridge_processed_change_event_total";
const LIFECYCLE_EVENT_TOTAL: &str = "msteams_bridge_lifecycle_event_total";
const CONNECTED_USERS_TOTAL: &str = "msteams_bridge_connected_users_total";
const SYNTHETIC_USERS_TOTAL: &str = "msteams_bridge_synthetic_users_total";
const LINKED_CHANNELS_TOTAL: &str = "msteams_bridge_linked_channels_total";
const QUEUE_CAPACITY: &str = "msteams_bridge_change_event_queue_capacity";
const QUEUE_LENGTH: &str = "msteams_bridge_change_event_queue_length";
const API_TIME_SECONDS: &str = "msteams_bridge_api_time_seconds";
const HTTP_REQUESTS_TOTAL: &str = "msteams_bridge_http_requests_total";
const HTTP_ERRORS_TOTAL: &str = "msteams_bridge_http_errors_total";
const SUBSCRIPTION_RECONCILE_TOTAL: &str = "msteams_bridge_subscription_reconcile_total";

const API_TIME_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Empty label for events and files that were applied.
pub const NOT_DISCARDED: &str = "";

pub const SOURCE_REMOTE: &str = "msteams";
pub const SOURCE_LOCAL: &str = "mattermost";

pub const ACTION_CREATED: &str = "created";
pub const ACTION_UPDATED: &str = "updated";
pub const ACTION_DELETED: &str = "deleted";
pub const REACTION_SET: &str = "set";
pub const REACTION_UNSET: &str = "unset";

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the process-wide Prometheus recorder. Later calls are no-ops.
pub fn install_recorder() -> Result<()> {
    if PROMETHEUS.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(API_TIME_SECONDS.to_string()), API_TIME_BUCKETS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install prometheus recorder")?;
    let _ = PROMETHEUS.set(handle);
    Ok(())
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Write side of the metrics surface. Without an installed recorder every
/// call is a no-op.
pub struct Metrics;

impl Metrics {
    pub fn observe_message(action: &'static str, source: &'static str, is_direct: bool) {
        counter!(
            MESSAGES_COUNT,
            "action" => action,
            "source" => source,
            "is_direct" => flag(is_direct)
        )
        .increment(1);
    }

    pub fn observe_reaction(action: &'static str, source: &'static str, is_direct: bool) {
        counter!(
            REACTIONS_COUNT,
            "action" => action,
            "source" => source,
            "is_direct" => flag(is_direct)
        )
        .increment(1);
    }

    pub fn observe_files(
        action: &'static str,
        source: &'static str,
        is_direct: bool,
        discarded_reason: &'static str,
        count: u64,
    ) {
        if count == 0 {
            return;
        }
        counter!(
            FILES_COUNT,
            "action" => action,
            "source" => source,
            "is_direct" => flag(is_direct),
            "discarded_reason" => discarded_reason
        )
        .increment(count);
    }

    pub fn observe_change_event(change_type: &'static str) {
        counter!(CHANGE_EVENT_TOTAL, "change_type" => change_type).increment(1);
    }

    pub fn observe_processed_change_event(change_type: &'static str, discarded_reason: &'static str) {
        counter!(
            PROCESSED_CHANGE_EVENT_TOTAL,
            "change_type" => change_type,
            "discarded_reason" => discarded_reason
        )
        .increment(1);
    }

    pub fn observe_lifecycle_event(event_type: String) {
        counter!(LIFECYCLE_EVENT_TOTAL, "event_type" => event_type).increment(1);
    }

    pub fn set_connected_users(count: usize) {
        gauge!(CONNECTED_USERS_TOTAL).set(count as f64);
    }

    pub fn set_synthetic_users(count: usize) {
        gauge!(SYNTHETIC_USERS_TOTAL).set(count as f64);
    }

    pub fn set_linked_channels(count: usize) {
        gauge!(LINKED_CHANNELS_TOTAL).set(count as f64);
    }

    pub fn set_queue_capacity(capacity: usize) {
        gauge!(QUEUE_CAPACITY).set(capacity as f64);
    }

    pub fn increment_queue_length(change_type: &'static str) {
        gauge!(QUEUE_LENGTH, "change_type" => change_type).increment(1.0);
    }

    pub fn decrement_queue_length(change_type: &'static str) {
        gauge!(QUEUE_LENGTH, "change_type" => change_type).decrement(1.0);
    }

    pub fn observe_api_time(method: &'static str, success: bool, elapsed: Duration) {
        histogram!(API_TIME_SECONDS, "method" => method, "success" => flag(success))
            .record(elapsed.as_secs_f64());
    }

    pub fn increment_http_requests() {
        counter!(HTTP_REQUESTS_TOTAL).increment(1);
    }

    pub fn increment_http_errors() {
        counter!(HTTP_ERRORS_TOTAL).increment(1);
    }

    pub fn observe_reconcile(result: &'static str) {
        counter!(SUBSCRIPTION_RECONCILE_TOTAL, "result" => result).increment(1);
    }
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    let body = PROMETHEUS.get().map(PrometheusHandle::render).unwrap_or_default();
    res.render(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_series_render_with_labels() {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(API_TIME_SECONDS.to_string()), API_TIME_BUCKETS)
            .unwrap()
            .build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            Metrics::observe_message("created", "remote", false);
            Metrics::observe_processed_change_event("created", "self");
            Metrics::observe_files("created", "remote", true, "size", 2);
            Metrics::observe_files("created", "remote", true, "size", 0);
            Metrics::set_queue_capacity(5000);
            Metrics::increment_queue_length("created");
            Metrics::increment_queue_length("created");
            Metrics::decrement_queue_length("created");
            Metrics::observe_api_time("get_message", true, Duration::from_millis(20));
        });

        let output = handle.render();
        assert!(output.contains(
            "msteams_bridge_messages_count{action=\"created\",source=\"remote\",is_direct=\"false\"} 1"
        ));
        assert!(output.contains("discarded_reason=\"self\""));
        assert!(output.contains("discarded_reason=\"size\"} 2"));
        assert!(output.contains("msteams_bridge_change_event_queue_capacity 5000"));
        assert!(output.contains("msteams_bridge_change_event_queue_length{change_type=\"created\"} 1"));
        assert!(output.contains("msteams_bridge_api_time_seconds_bucket"));
    }

    #[test]
    fn calls_without_recorder_are_noops() {
        Metrics::increment_http_requests();
        Metrics::observe_reconcile("ok");
    }
}
