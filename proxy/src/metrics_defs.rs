//! Metrics definitions for the proxy.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS_TOTAL: MetricDef = MetricDef {
    name: "requests.total",
    metric_type: MetricType::Counter,
    description: "Proxied requests by edge and grouped status",
};

pub const REQUEST_TTFB: MetricDef = MetricDef {
    name: "requests.ttfb",
    metric_type: MetricType::Histogram,
    description: "Time to first upstream body byte in seconds",
};

pub const RESOLVE_DURATION: MetricDef = MetricDef {
    name: "resolve.duration",
    metric_type: MetricType::Histogram,
    description: "Time to resolve a backend location in seconds",
};

pub const PROBE_FAILURES: MetricDef = MetricDef {
    name: "resolve.probe_failures",
    metric_type: MetricType::Counter,
    description: "Service endpoints that failed their probe check",
};

pub const DIAL_TOTAL: MetricDef = MetricDef {
    name: "dial.total",
    metric_type: MetricType::Counter,
    description: "Backend dial attempts",
};

pub const DIAL_CURRENT: MetricDef = MetricDef {
    name: "dial.current",
    metric_type: MetricType::Gauge,
    description: "Backend dials in flight",
};

pub const DIAL_ERRORS: MetricDef = MetricDef {
    name: "dial.errors",
    metric_type: MetricType::Counter,
    description: "Backend dials that failed after all redial attempts",
};

pub const DIAL_DURATION: MetricDef = MetricDef {
    name: "dial.duration",
    metric_type: MetricType::Histogram,
    description: "Backend dial duration in seconds, retries included",
};

pub const JOB_SPAWN_TOTAL: MetricDef = MetricDef {
    name: "job.spawn.total",
    metric_type: MetricType::Counter,
    description: "Worker job spawn attempts",
};

pub const JOB_SPAWN_CURRENT: MetricDef = MetricDef {
    name: "job.spawn.current",
    metric_type: MetricType::Gauge,
    description: "Worker job spawns in flight",
};

pub const JOB_SPAWN_ERRORS: MetricDef = MetricDef {
    name: "job.spawn.errors",
    metric_type: MetricType::Counter,
    description: "Worker job spawns that failed",
};

pub const JOB_SPAWN_DURATION: MetricDef = MetricDef {
    name: "job.spawn.duration",
    metric_type: MetricType::Histogram,
    description: "Time from spawn decision to a ready worker in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS_TOTAL,
    REQUEST_TTFB,
    RESOLVE_DURATION,
    PROBE_FAILURES,
    DIAL_TOTAL,
    DIAL_CURRENT,
    DIAL_ERRORS,
    DIAL_DURATION,
    JOB_SPAWN_TOTAL,
    JOB_SPAWN_CURRENT,
    JOB_SPAWN_ERRORS,
    JOB_SPAWN_DURATION,
];
