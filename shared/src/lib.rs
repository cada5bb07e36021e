pub mod http;
pub mod metrics_defs;

/// Increment a counter declared as a [`metrics_defs::MetricDef`].
///
/// ```ignore
/// counter!(REQUESTS_TOTAL, "edge" => edge.to_string()).increment(1);
/// ```
#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        ::metrics::counter!($def.name)
    };
    ($def:expr, $($key:expr => $value:expr),+ $(,)?) => {
        ::metrics::counter!($def.name, $($key => $value),+)
    };
}

/// Record into a histogram declared as a [`metrics_defs::MetricDef`].
#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        ::metrics::histogram!($def.name)
    };
    ($def:expr, $($key:expr => $value:expr),+ $(,)?) => {
        ::metrics::histogram!($def.name, $($key => $value),+)
    };
}

/// Update a gauge declared as a [`metrics_defs::MetricDef`].
#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        ::metrics::gauge!($def.name)
    };
    ($def:expr, $($key:expr => $value:expr),+ $(,)?) => {
        ::metrics::gauge!($def.name, $($key => $value),+)
    };
}
