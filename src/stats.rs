//! Statistics sink.
//!
//! The engine reports observable events as named counter increments; what
//! happens to them (export, aggregation) is the deployment's business. The
//! bundled [`StatsRegistry`] keeps them in memory, which is also what the
//! test suite asserts against.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::SubnetId;

/// Address a client tried to use or renew was reserved for someone else.
pub const RESERVATION_CONFLICTS: &str = "reservation-conflicts";

/// A valid lease was returned without a repository write.
pub const LEASE_REUSES: &str = "lease-reuses";

/// Reservation backend lookup failed and processing continued unreserved.
pub const RESERVATION_LOOKUP_ERRORS: &str = "reservation-lookup-errors";

/// A claim lost its race and allocation was retried.
pub const ALLOCATION_COLLISIONS: &str = "allocation-collisions";

/// A client declined an address into probation.
pub const DECLINED_ADDRESSES: &str = "declined-addresses";

/// No candidate address satisfied the constraints.
pub const POOL_EXHAUSTED: &str = "pool-exhausted";

/// Builds the subnet-scoped form of a counter name.
pub fn subnet_counter(subnet_id: SubnetId, name: &str) -> String {
    format!("subnet[{subnet_id}].{name}")
}

/// Consumer of counter increments.
pub trait StatsSink: Send + Sync {
    /// Increments the global counter and, when given, its subnet-scoped
    /// sibling.
    fn increment(&self, name: &str, subnet_scoped: Option<&str>);
}

/// In-memory counter registry.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    counters: RwLock<HashMap<String, u64>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; absent counters read as zero.
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .expect("stats lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl StatsSink for StatsRegistry {
    fn increment(&self, name: &str, subnet_scoped: Option<&str>) {
        let mut counters = self.counters.write().expect("stats lock poisoned");
        *counters.entry(name.to_string()).or_insert(0) += 1;
        if let Some(scoped) = subnet_scoped {
            *counters.entry(scoped.to_string()).or_insert(0) += 1;
        }
    }
}

/// Sink that discards every increment.
#[derive(Debug, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn increment(&self, _name: &str, _subnet_scoped: Option<&str>) {}
}
