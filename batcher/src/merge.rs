//! Merge policy for accumulation windows.
//!
//! A [`Fragment`] holds everything a batch buffer has accumulated since its last
//! flush. Incoming payloads are turned into fragments and merged into the open
//! one when the two agree on:
//! - Proxy identity: name and version must be equal, including both unset
//! - Limit sets: a name present in both must have identical bounds; names present
//!   in only one side are carried over (union)
//!
//! Anything else is an [`Incompatibility`] and the caller must flush the open
//! fragment before starting a new window with the incoming one. Downstream
//! consumers interpret histogram buckets with the limit sets shipped alongside
//! them, so conflicting definitions can never share a batch.

use crate::types::{LimitSets, Measurement, ProxyIdentity, RoutingKey, StatPayload};

/// Reason two fragments cannot share a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Incompatibility {
    ProxyIdentity {
        current: ProxyIdentity,
        incoming: ProxyIdentity,
    },
    LimitSet {
        name: String,
    },
}

impl std::fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Incompatibility::ProxyIdentity { current, incoming } => write!(
                f,
                "proxy identity changed from {:?}/{:?} to {:?}/{:?}",
                current.name, current.version, incoming.name, incoming.version
            ),
            Incompatibility::LimitSet { name } => {
                write!(f, "limit set {name:?} has conflicting bounds")
            }
        }
    }
}

/// Outcome of merging an incoming fragment into the open one.
#[derive(Debug)]
pub enum MergeOutcome {
    /// The incoming measurements were appended.
    Merged,
    /// Nothing was changed; the incoming fragment is handed back untouched.
    Incompatible {
        reason: Incompatibility,
        incoming: Fragment,
    },
}

/// Content of one accumulation window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fragment {
    node: Option<String>,
    proxy: ProxyIdentity,
    limit_sets: LimitSets,
    measurements: Vec<Measurement>,
}

impl From<StatPayload> for Fragment {
    fn from(payload: StatPayload) -> Self {
        Self {
            node: payload.node,
            proxy: payload.proxy,
            limit_sets: payload.limit_sets,
            measurements: payload.measurements,
        }
    }
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn proxy(&self) -> &ProxyIdentity {
        &self.proxy
    }

    pub fn limit_sets(&self) -> &LimitSets {
        &self.limit_sets
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Checks whether `incoming` may be merged into this fragment.
    ///
    /// An empty fragment accepts anything since the incoming attributes become
    /// its baseline.
    pub fn check_compatible(&self, incoming: &Fragment) -> Result<(), Incompatibility> {
        if self.is_empty() {
            return Ok(());
        }

        if self.proxy != incoming.proxy {
            return Err(Incompatibility::ProxyIdentity {
                current: self.proxy.clone(),
                incoming: incoming.proxy.clone(),
            });
        }

        for (name, limits) in &incoming.limit_sets {
            if let Some(existing) = self.limit_sets.get(name)
                && existing != limits
            {
                return Err(Incompatibility::LimitSet { name: name.clone() });
            }
        }

        Ok(())
    }

    /// Merges `incoming` into this fragment if the two are compatible.
    pub fn merge(&mut self, incoming: Fragment) -> MergeOutcome {
        if let Err(reason) = self.check_compatible(&incoming) {
            return MergeOutcome::Incompatible { reason, incoming };
        }

        if self.is_empty() {
            self.node = incoming.node;
            self.proxy = incoming.proxy;
            self.limit_sets = incoming.limit_sets;
            self.measurements.extend(incoming.measurements);
            return MergeOutcome::Merged;
        }

        if self.node.is_none() {
            self.node = incoming.node;
        }
        for (name, limits) in incoming.limit_sets {
            self.limit_sets.entry(name).or_insert(limits);
        }
        self.measurements.extend(incoming.measurements);

        MergeOutcome::Merged
    }

    /// Splits off the first `max` measurements as their own fragment.
    ///
    /// The returned fragment and the remainder both keep the full set of
    /// attributes, so either can be flushed on its own.
    pub fn split_head(&mut self, max: usize) -> Fragment {
        if self.measurements.len() <= max {
            return std::mem::take(self);
        }

        let tail = self.measurements.split_off(max);
        let head = std::mem::replace(&mut self.measurements, tail);

        Fragment {
            node: self.node.clone(),
            proxy: self.proxy.clone(),
            limit_sets: self.limit_sets.clone(),
            measurements: head,
        }
    }

    /// Packages the fragment into the payload shape sent to the forwarding service.
    pub fn into_payload(self, key: &RoutingKey) -> StatPayload {
        StatPayload {
            source: key.source.clone(),
            node: self.node,
            zone: key.zone.clone(),
            proxy: self.proxy,
            limit_sets: self.limit_sets,
            measurements: self.measurements,
        }
    }
}
