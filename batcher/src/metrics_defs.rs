//! Metrics definitions for the batcher.

use shared::metrics_defs::{MetricDef, MetricType};

pub const MEASUREMENTS_ACCEPTED: MetricDef = MetricDef {
    name: "batcher.measurements.accepted",
    metric_type: MetricType::Counter,
    description: "Number of measurements accepted into a batch buffer",
};

pub const FLUSHES: MetricDef = MetricDef {
    name: "batcher.flushes",
    metric_type: MetricType::Counter,
    description: "Number of batches flushed. Tagged with reason.",
};

pub const FLUSH_SIZE: MetricDef = MetricDef {
    name: "batcher.flush.size",
    metric_type: MetricType::Histogram,
    description: "Number of measurements in each flushed batch",
};

pub const FORWARD_FAILURES: MetricDef = MetricDef {
    name: "batcher.forward.failures",
    metric_type: MetricType::Counter,
    description: "Number of flushed batches the forwarding service failed to deliver",
};

pub const FORWARDS_INFLIGHT: MetricDef = MetricDef {
    name: "batcher.forwards.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of forward calls submitted but not yet completed",
};

pub const ACTIVE_BUFFERS: MetricDef = MetricDef {
    name: "batcher.buffers.active",
    metric_type: MetricType::Gauge,
    description: "Number of batch buffers, one per routing key",
};

pub const ALL_METRICS: &[MetricDef] = &[
    MEASUREMENTS_ACCEPTED,
    FLUSHES,
    FLUSH_SIZE,
    FORWARD_FAILURES,
    FORWARDS_INFLIGHT,
    ACTIVE_BUFFERS,
];
