//! ---
//! vtnc_section: "02-resource-allocation"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Two-phase label allocator over bounded pools."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fmt;

use vtnc_store::{ConfigRecord, KeyType, RecordKey};

/// `LabelPool` counter attribute.
pub const ATTR_USED_COUNT: &str = "used_count";
/// `PoolLimit` capacity attribute.
pub const ATTR_CAPACITY: &str = "capacity";
/// `LabelUsage` holder attribute.
pub const ATTR_OWNER: &str = "owner";

const BRIDGE_PREFIX: &str = "vtn:";
const SPINE_PREFIX: &str = "spine:";

pub fn bridge_scope(vtn: &str) -> String {
    format!("{BRIDGE_PREFIX}{vtn}")
}

pub fn spine_scope(spine: &str) -> String {
    format!("{SPINE_PREFIX}{spine}")
}

/// Spine domain identifier of a tunnel-label scope.
pub fn spine_of_scope(scope: &str) -> Option<&str> {
    scope.strip_prefix(SPINE_PREFIX)
}

/// Which family of pools an allocation draws from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// The single bridge-label pool of a VTN.
    Bridge { vtn: String },
    /// Every spine domain's tunnel-label pool.
    Tunnel,
}

impl PoolKind {
    pub fn bridge(vtn: impl Into<String>) -> Self {
        PoolKind::Bridge { vtn: vtn.into() }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Bridge { vtn } => write!(f, "bridge({vtn})"),
            PoolKind::Tunnel => f.write_str("tunnel"),
        }
    }
}

/// Capacity and usage of one pool as seen from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub scope: String,
    pub capacity: u64,
    pub used: u64,
}

impl PoolSnapshot {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    pub(crate) fn is_bridge_scope(scope: &str) -> bool {
        scope.starts_with(BRIDGE_PREFIX)
    }
}

pub(crate) fn pool_key(scope: &str) -> RecordKey {
    RecordKey::new(KeyType::LabelPool, [scope])
}

pub(crate) fn limit_key(scope: &str) -> RecordKey {
    RecordKey::new(KeyType::PoolLimit, [scope])
}

pub(crate) fn usage_key(scope: &str, label: u32) -> RecordKey {
    RecordKey::new(KeyType::LabelUsage, [scope.to_owned(), label.to_string()])
}

/// Capacity override for one pool scope.
pub fn pool_limit_record(scope: &str, capacity: u32) -> ConfigRecord {
    ConfigRecord::new(limit_key(scope)).with_attr(ATTR_CAPACITY, capacity)
}

/// Spine domain able to host tunnel hubs; each one contributes a tunnel-label pool.
pub fn spine_domain_record(spine: &str, controller: &str, domain: &str) -> ConfigRecord {
    ConfigRecord::new(RecordKey::new(KeyType::SpineDomain, [spine])).with_location(controller, domain)
}
