//! Common types for metrics definitions.

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

/// Registers the description of every metric with the installed recorder.
///
/// Call once after the global recorder is set; descriptions registered before
/// that are dropped by the noop recorder.
pub fn describe_metrics(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        metrics::counter!($def.name, $($label => $value),+)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        metrics::gauge!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        metrics::gauge!($def.name, $($label => $value),+)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        metrics::histogram!($def.name, $($label => $value),+)
    };
}
