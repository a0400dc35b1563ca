//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Reconciliation engines of the VTN coordinator.
//!
//! The [`CommitEngine`] promotes CANDIDATE to RUNNING one entity type at a
//! time, the [`AuditEngine`] reconciles RUNNING against a controller's
//! reported state, and the [`ImportEngine`] merges discovered configuration.
//! [`TransactionCoordinator`] drives all three together with the label
//! allocator and the topology pipeline.

mod audit;
mod commit;
mod coordinator;
mod import;
pub mod metrics;
mod registry;
pub mod status;
mod translate;

pub use audit::{AuditEngine, AuditReport, AuditResult, AuditSignal};
pub use commit::{CommitEngine, CommitReport, DispatchFailure};
pub use coordinator::{AuditSummary, EngineContext, TransactionCoordinator, TransactionReport};
pub use import::{ImportEngine, MergeReport, ATTR_CONTROLLER_VTN};
pub use metrics::EngineMetrics;
pub use registry::{
    Capabilities, EntityType, KeyTypeHandler, KeyTypeRegistry, StandardHandler, ATTR_DESCRIPTION,
};
pub use translate::{RenameTable, Translated};

use vtnc_alloc::AllocError;
use vtnc_driver::DriverError;
use vtnc_store::{ConfigRecord, KeyType, RecordKey, StoreError};
use vtnc_topology::TopologyError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("dispatch of {} to {} failed ({}): {}", .0.error_record.key, .0.controller, .0.code, .0.message)]
    Dispatch(Box<DispatchFailure>),
    #[error("controller {0} is unreachable")]
    ControllerUnreachable(String),
    #[error("controller {0} is not configured")]
    UnknownController(String),
    #[error("imported record {} conflicts with candidate configuration", .record.key)]
    MergeConflict { record: Box<ConfigRecord> },
    #[error("validation failed for {key}: {reason}")]
    Validation { key: RecordKey, reason: String },
    #[error("no handler registered for key type {0}")]
    UnknownKeyType(KeyType),
    #[error("invalid engine configuration: {0}")]
    Config(String),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EngineError {
    pub(crate) fn validation(key: &RecordKey, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Record the caller should report, for failures that point at one.
    pub fn error_record(&self) -> Option<&ConfigRecord> {
        match self {
            EngineError::Dispatch(failure) => Some(&failure.error_record),
            EngineError::MergeConflict { record } => Some(record),
            _ => None,
        }
    }
}

impl From<DriverError> for EngineError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Unreachable(controller) => EngineError::ControllerUnreachable(controller),
            DriverError::UnknownController(controller) => EngineError::UnknownController(controller),
        }
    }
}
