//! Metrics definitions for the TapLink SDK.
//!
//! This module defines all metrics keys used by the SDK and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for counting connection attempts.
pub const METRICS_ID_SDK_CONNECT_ATTEMPTS: &str = "taplink.sdk.connect.attempts";
/// Metrics key for counting failed connection attempts.
pub const METRICS_ID_SDK_CONNECT_FAILURES: &str = "taplink.sdk.connect.failures";
/// Metrics key for currently outstanding calls in the registry.
pub const METRICS_ID_SDK_CALLS_OUTSTANDING: &str = "taplink.sdk.calls.outstanding";
/// Metrics key for calls that expired without a response.
pub const METRICS_ID_SDK_CALLS_TIMEOUT: &str = "taplink.sdk.calls.timeout";
/// Metrics key for heartbeat round-trip time.
pub const METRICS_ID_SDK_HEARTBEAT_RTT: &str = "taplink.sdk.heartbeat.rtt";
/// Metrics key for heartbeat timeouts.
pub const METRICS_ID_SDK_HEARTBEAT_TIMEOUTS: &str = "taplink.sdk.heartbeat.timeouts";
/// Metrics key for service-discovery rounds.
pub const METRICS_ID_SDK_DISCOVERY_ROUNDS: &str = "taplink.sdk.discovery.rounds";

/// Describe all metrics used by the SDK.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_SDK_CONNECT_ATTEMPTS,
        metrics::Unit::Count,
        "Number of connection attempts"
    );

    metrics::describe_counter!(
        METRICS_ID_SDK_CONNECT_FAILURES,
        metrics::Unit::Count,
        "Number of failed connection attempts"
    );

    metrics::describe_gauge!(
        METRICS_ID_SDK_CALLS_OUTSTANDING,
        metrics::Unit::Count,
        "Number of outstanding calls in the callback registry"
    );

    metrics::describe_counter!(
        METRICS_ID_SDK_CALLS_TIMEOUT,
        metrics::Unit::Count,
        "Number of calls that expired without a response"
    );

    metrics::describe_histogram!(
        METRICS_ID_SDK_HEARTBEAT_RTT,
        metrics::Unit::Milliseconds,
        "Heartbeat round-trip time"
    );

    metrics::describe_counter!(
        METRICS_ID_SDK_HEARTBEAT_TIMEOUTS,
        metrics::Unit::Count,
        "Number of heartbeats that received no reply in time"
    );

    metrics::describe_counter!(
        METRICS_ID_SDK_DISCOVERY_ROUNDS,
        metrics::Unit::Count,
        "Number of mDNS discovery rounds"
    )
}
