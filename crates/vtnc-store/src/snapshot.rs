//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Versioned configuration store and storage bindings."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::ConfigRecord;
use crate::{Result, StoreError};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    records: Vec<ConfigRecord>,
}

/// Persist a partition dump (typically STARTUP) as a hashed JSON envelope.
pub fn save_snapshot(records: &[ConfigRecord], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(records)?,
        records: records.to_vec(),
    };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
    writer.flush()?;
    Ok(())
}

/// Load a snapshot, rejecting unknown versions and tampered payloads.
pub fn load_snapshot(path: &Path) -> Result<Vec<ConfigRecord>> {
    let envelope = load_envelope(path)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(StoreError::SnapshotVersion(envelope.version));
    }
    if compute_hash(&envelope.records)? != envelope.hash {
        return Err(StoreError::HashMismatch);
    }
    Ok(envelope.records)
}

/// Verify the integrity of a snapshot without handing out its records.
pub fn verify_snapshot(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.records)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<SnapshotEnvelope> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn compute_hash(records: &[ConfigRecord]) -> Result<String> {
    let serialized = serde_json::to_vec(records)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyType, RecordKey};
    use tempfile::tempdir;

    fn sample() -> Vec<ConfigRecord> {
        vec![
            ConfigRecord::new(RecordKey::new(KeyType::Vtn, ["vtn-a"])).with_attr("description", "blue"),
            ConfigRecord::new(RecordKey::new(KeyType::Vbridge, ["vtn-a", "br-1"]))
                .with_location("ctl-1", "dom-1"),
        ]
    }

    #[test]
    fn save_and_load_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("startup").join("startup.json");
        let records = sample();

        save_snapshot(&records, &path).unwrap();
        assert!(verify_snapshot(&path));
        assert_eq!(load_snapshot(&path).unwrap(), records);
    }

    #[test]
    fn verify_rejects_tampered_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("startup.json");
        save_snapshot(&sample(), &path).unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["records"][0]["key"]["parts"][0] = serde_json::json!("vtn-z");
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(!verify_snapshot(&path));
        assert!(matches!(load_snapshot(&path), Err(StoreError::HashMismatch)));
    }

    #[test]
    fn load_rejects_future_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("startup.json");
        save_snapshot(&sample(), &path).unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["version"] = serde_json::json!(SNAPSHOT_VERSION + 1);
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(matches!(
            load_snapshot(&path),
            Err(StoreError::SnapshotVersion(v)) if v == SNAPSHOT_VERSION + 1
        ));
    }

    #[test]
    fn missing_snapshot_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = load_snapshot(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
