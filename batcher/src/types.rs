//! Payload model shared by callers, the batch buffers and the forwarding service.
//!
//! A [`StatPayload`] is both what callers submit and what a flush emits: the
//! routing fields, the proxy identity, the limit sets used to interpret
//! histogram buckets, and the measurements themselves.
//!
//! ## Example
//!
//! ```json
//! {
//!   "source": "web-1",
//!   "zone": "us-east",
//!   "proxyName": "relay",
//!   "proxyVersion": "1.4.0",
//!   "limitSets": { "default": [0.1, 0.2, 0.4, 0.8] },
//!   "measurements": [
//!     { "name": "cpu", "timestamp": 1700000000000, "value": 0.42 },
//!     { "name": "latency", "timestamp": 1700000000000,
//!       "histogram": { "limits": "default", "counts": [3, 5, 1, 0, 0] } }
//!   ]
//! }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::BatchError;

/// Limit-set name to ascending bucket upper bounds, in first-seen order.
pub type LimitSets = IndexMap<String, Vec<f64>>;

/// One named, timestamped data point or histogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tags: IndexMap<String, String>,
    #[serde(flatten)]
    pub sample: Sample,
}

impl Measurement {
    pub fn value(name: impl Into<String>, timestamp: i64, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            tags: IndexMap::new(),
            sample: Sample::Value(value),
        }
    }

    pub fn histogram(
        name: impl Into<String>,
        timestamp: i64,
        limits: impl Into<String>,
        counts: Vec<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            timestamp,
            tags: IndexMap::new(),
            sample: Sample::Histogram(Histogram {
                limits: limits.into(),
                counts,
            }),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Sample {
    Value(f64),
    Histogram(Histogram),
}

/// Bucket counts interpreted with the limit set named by `limits`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub limits: String,
    pub counts: Vec<u64>,
}

/// Name and version of the proxy that relayed the measurements.
///
/// Both fields are optional; two identities are compatible only when they are equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyIdentity {
    #[serde(
        rename = "proxyName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        rename = "proxyVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
}

impl ProxyIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: Some(version.into()),
        }
    }
}

/// Measurements destined for one source/node/zone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatPayload {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub zone: String,
    #[serde(flatten)]
    pub proxy: ProxyIdentity,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub limit_sets: LimitSets,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl StatPayload {
    pub fn new(source: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            zone: zone.into(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyIdentity) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_limit_set(mut self, name: impl Into<String>, limits: Vec<f64>) -> Self {
        self.limit_sets.insert(name.into(), limits);
        self
    }

    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurements.push(measurement);
        self
    }

    pub fn with_measurements(mut self, measurements: impl IntoIterator<Item = Measurement>) -> Self {
        self.measurements.extend(measurements);
        self
    }
}

/// Identity of a batch buffer.
///
/// An absent or empty node routes as if it were the source, but the emitted
/// payload keeps the node exactly as it was submitted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub source: String,
    pub node: String,
    pub zone: String,
}

impl RoutingKey {
    pub fn new(
        source: impl Into<String>,
        node: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            node: node.into(),
            zone: zone.into(),
        }
    }

    /// Derives the routing key of a payload, rejecting payloads without a source.
    pub fn for_payload(payload: &StatPayload) -> Result<Self, BatchError> {
        if payload.source.is_empty() {
            return Err(BatchError::MissingRoutingField("source"));
        }

        let node = match payload.node.as_deref() {
            Some(node) if !node.is_empty() => node,
            _ => payload.source.as_str(),
        };

        Ok(Self::new(payload.source.as_str(), node, payload.zone.as_str()))
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.node, self.zone)
    }
}
