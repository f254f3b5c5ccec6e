//! Metrics definitions for the server.
//!
//! This module defines all metrics keys used by the engine and provides a
//! helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for counting dispatched requests.
pub const METRICS_ID_REQUESTS_DISPATCHED: &str = "marlin.server.requests.dispatched";
/// Metrics key for counting requests answered with an error response.
pub const METRICS_ID_REQUESTS_FAILED: &str = "marlin.server.requests.failed";
/// Metrics key for the current number of pool workers.
pub const METRICS_ID_POOL_WORKERS: &str = "marlin.pool.workers";
/// Metrics key for the current number of busy pool workers.
pub const METRICS_ID_POOL_BUSY: &str = "marlin.pool.busy";
/// Metrics key for the work backlog length.
pub const METRICS_ID_POOL_BACKLOG: &str = "marlin.pool.backlog";
/// Metrics key for currently open reliable-messaging sessions.
pub const METRICS_ID_RM_SESSIONS_OPEN: &str = "marlin.rm.sessions.open";
/// Metrics key for reliable-messaging faults sent.
pub const METRICS_ID_RM_FAULTS: &str = "marlin.rm.faults";
/// Metrics key for currently live event streams.
pub const METRICS_ID_EVENT_STREAMS_LIVE: &str = "marlin.events.streams.live";
/// Metrics key for push events delivered to streams.
pub const METRICS_ID_EVENTS_SENT: &str = "marlin.events.sent";

/// Describe all metrics used by the server.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_REQUESTS_DISPATCHED,
        metrics::Unit::Count,
        "Number of requests dispatched to a site pipeline"
    );

    metrics::describe_counter!(
        METRICS_ID_REQUESTS_FAILED,
        metrics::Unit::Count,
        "Number of requests answered with an error response"
    );

    metrics::describe_gauge!(
        METRICS_ID_POOL_WORKERS,
        metrics::Unit::Count,
        "Current number of worker threads in the pool"
    );

    metrics::describe_gauge!(
        METRICS_ID_POOL_BUSY,
        metrics::Unit::Count,
        "Current number of busy worker threads"
    );

    metrics::describe_gauge!(
        METRICS_ID_POOL_BACKLOG,
        metrics::Unit::Count,
        "Number of submitted work items not yet picked up"
    );

    metrics::describe_gauge!(
        METRICS_ID_RM_SESSIONS_OPEN,
        metrics::Unit::Count,
        "Number of open reliable-messaging sessions"
    );

    metrics::describe_counter!(
        METRICS_ID_RM_FAULTS,
        metrics::Unit::Count,
        "Number of reliable-messaging faults sent"
    );

    metrics::describe_gauge!(
        METRICS_ID_EVENT_STREAMS_LIVE,
        metrics::Unit::Count,
        "Number of live server-push event streams"
    );

    metrics::describe_counter!(
        METRICS_ID_EVENTS_SENT,
        metrics::Unit::Count,
        "Number of push events delivered to event streams"
    )
}
