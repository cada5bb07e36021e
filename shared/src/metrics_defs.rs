//! Shared vocabulary for declaring metrics.
//!
//! Each crate declares its metrics as `MetricDef` constants in a
//! `metrics_defs` module and lists them in an `ALL_METRICS` table, so the
//! full set can be registered with the recorder at startup and rendered
//! into docs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Register descriptions for a set of metric definitions with the global
/// recorder.
pub fn describe_all(metrics: &[MetricDef]) {
    for def in metrics {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}
