//! ---
//! vtnc_section: "02-resource-allocation"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Two-phase label allocator over bounded pools."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Resource label allocator.
//!
//! Pools are bounded counters identified by a scope key: `vtn:<name>` for the
//! bridge labels of one VTN and `spine:<id>` for the tunnel labels of one
//! spine domain. Allocation mutates CANDIDATE directly and records a signed
//! delta in the scratch ledger; the enclosing transaction settles the ledger
//! into RUNNING on commit or reverses it on abort.

mod allocator;
mod label;
mod pool;

pub use allocator::{Allocation, LabelAllocator, Settlement};
pub use label::Label;
pub use pool::{
    bridge_scope, pool_limit_record, spine_domain_record, spine_of_scope, spine_scope, PoolKind, PoolSnapshot,
    ATTR_CAPACITY, ATTR_OWNER, ATTR_USED_COUNT,
};

use vtnc_store::StoreError;

/// Result alias for allocator operations.
pub type Result<T> = std::result::Result<T, AllocError>;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// No candidate pool has headroom.
    #[error("no {kind} pool has headroom")]
    ExceedsResourceLimit { kind: String },
    /// The label is not held in the pool by the given owner.
    #[error("label {label} is not allocated in pool {scope}")]
    UnknownLabel { scope: String, label: u32 },
    /// Settlement or release would drive a counter below zero.
    #[error("pool {scope} counter would drop below zero")]
    CounterUnderflow { scope: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}
