//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Versioned configuration store and storage bindings."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Partitioned configuration store.
//!
//! Every partition (CANDIDATE, RUNNING, STARTUP, AUDIT, IMPORT, STATE) holds the
//! same logical schema. The [`ConfigStore`] trait is the seam the allocator,
//! topology pipeline and engines depend on; [`MemoryStore`] is the in-process
//! implementation.

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the store subsystem.
///
/// Absence is reported as `Ok(None)` by reads; [`StoreError::NotFound`] only
/// surfaces from writes that require an existing record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Update or delete targeted a record that does not exist.
    #[error("record {0} not found")]
    NotFound(RecordKey),
    /// Create targeted a record that already exists.
    #[error("record {0} already exists")]
    InstanceExists(RecordKey),
    /// Key does not have the number of components its key type requires.
    #[error("malformed key {0}")]
    MalformedKey(RecordKey),
    /// Backend failure; fatal to the current operation.
    #[error("storage failure: {0}")]
    Storage(String),
    /// Wrapper for IO errors encountered while reading/writing snapshot files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a snapshot fails integrity verification.
    #[error("snapshot hash mismatch")]
    HashMismatch,
    /// Snapshot envelope written by an incompatible version.
    #[error("unsupported snapshot version {0}")]
    SnapshotVersion(u16),
}

impl StoreError {
    /// Whether the error is the benign "record absent" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub mod memory;
pub mod snapshot;
pub mod store;
pub mod types;

pub use memory::MemoryStore;
pub use snapshot::{load_snapshot, save_snapshot, verify_snapshot, SNAPSHOT_VERSION};
pub use store::{ConfigStore, CursorLease, DiffCursor, DiffEntry, ScopeFilter, ScratchDelta, WriteOp};
pub use types::{
    Attribute, ConfigRecord, ConfigStatus, KeyClass, KeyType, Operation, Partition, RecordFlags,
    RecordKey, Validity,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_key() {
        let key = RecordKey::new(KeyType::Vtn, ["vtn-1"]);
        let err = StoreError::NotFound(key);
        assert_eq!(format!("{err}"), "record vtn[vtn-1] not found");
        assert!(err.is_not_found());
    }
}
