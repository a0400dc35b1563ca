//! ---
//! vtnc_section: "04-topology-conversion"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Port-map intent conversion into leaf and tunnel topology."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Topology conversion pipeline.
//!
//! A unified bridge spanning several `(controller, domain)` leaves is realised
//! as one leaf bridge per leaf. Once a bridge reaches two leaves, each leaf is
//! wired to the VTN's tunnel hub through a leaf interface, a tunnel interface
//! and a link. Every apply/retract call stages its writes in a
//! [`TopologyBuilder`] and lands them all or none.

mod builder;
mod intent;
pub mod nodes;
mod pipeline;

pub use builder::TopologyBuilder;
pub use intent::{PortLabel, PortMapIntent};
pub use nodes::BridgeState;
pub use pipeline::{ConversionPipeline, TopologyChange};

use vtnc_alloc::AllocError;
use vtnc_store::{RecordKey, StoreError};

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("parent {0} does not exist")]
    ParentMissing(RecordKey),
    #[error("port map {0} already exists")]
    IntentExists(RecordKey),
    #[error("port map {0} does not exist")]
    IntentNotFound(RecordKey),
    /// A bridge carries at most one transparent leaf.
    #[error("bridge {vtn}/{vbr} already has a transparent leaf")]
    TransparentLabelInUse { vtn: String, vbr: String },
    /// The leaf's label kind was fixed by its first intent.
    #[error("leaf {leaf} already carries a {existing} label")]
    LabelKindConflict { leaf: String, existing: &'static str },
    #[error("invalid port map intent: {0}")]
    InvalidIntent(String),
    /// Stored topology contradicts itself; the call is refused.
    #[error("inconsistent topology: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
