//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Versioned configuration store and storage bindings."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::types::{ConfigRecord, KeyType, Operation, Partition, RecordKey};
use crate::Result;

/// Write semantics for [`ConfigStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Fails with `InstanceExists` when the key is present.
    Create,
    /// Fails with `NotFound` when the key is absent.
    Update,
    /// Create or replace.
    Upsert,
}

/// Restricts reads and diffs to a key prefix and/or an owning controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    pub prefix: Vec<String>,
    pub controller: Option<String>,
}

impl ScopeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn prefix<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: parts.into_iter().map(Into::into).collect(),
            controller: None,
        }
    }

    pub fn with_controller(mut self, controller: impl Into<String>) -> Self {
        self.controller = Some(controller.into());
        self
    }

    pub fn matches(&self, record: &ConfigRecord) -> bool {
        record.key.starts_with(&self.prefix)
            && self
                .controller
                .as_deref()
                .map_or(true, |controller| record.is_owned_by(controller))
    }
}

/// One changed record yielded by a [`DiffCursor`].
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub op: Operation,
    /// Source record for create/update, destination record for delete.
    pub record: ConfigRecord,
    /// Destination record for update.
    pub prior: Option<ConfigRecord>,
}

/// Tracks an open cursor against its store; released on drop.
#[derive(Debug)]
pub struct CursorLease {
    open: Option<Arc<AtomicUsize>>,
}

impl CursorLease {
    pub fn tracked(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            open: Some(counter),
        }
    }

    pub fn detached() -> Self {
        Self { open: None }
    }
}

impl Drop for CursorLease {
    fn drop(&mut self) {
        if let Some(counter) = self.open.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Iterator over the records of one diff.
///
/// The lease is released when the cursor is dropped, so every early return
/// in a consumer loop closes the underlying query.
#[derive(Debug)]
pub struct DiffCursor {
    op: Operation,
    entries: std::vec::IntoIter<DiffEntry>,
    _lease: CursorLease,
}

impl DiffCursor {
    pub fn new(op: Operation, entries: Vec<DiffEntry>, lease: CursorLease) -> Self {
        Self {
            op,
            entries: entries.into_iter(),
            _lease: lease,
        }
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Release the cursor explicitly.
    pub fn close(self) {}
}

impl Iterator for DiffCursor {
    type Item = DiffEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Signed pending adjustment of a pool counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchDelta {
    pub scope: String,
    pub vtn: String,
    pub delta: i64,
}

/// Storage collaborator consumed by the allocator, topology pipeline and engines.
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when the record is absent.
    fn read(&self, partition: Partition, key: &RecordKey) -> Result<Option<ConfigRecord>>;

    /// All records of `key_type` matching `filter`, in key order.
    fn read_all(
        &self,
        partition: Partition,
        key_type: KeyType,
        filter: &ScopeFilter,
    ) -> Result<Vec<ConfigRecord>>;

    fn write(&self, partition: Partition, op: WriteOp, record: ConfigRecord) -> Result<()>;

    /// Fails with `NotFound` when the key is absent.
    fn delete(&self, partition: Partition, key: &RecordKey) -> Result<()>;

    /// Remove every record of `key_type` matching `filter`; returns the count removed.
    fn clear(&self, partition: Partition, key_type: KeyType, filter: &ScopeFilter)
        -> Result<usize>;

    /// Add `delta` to the scratch row for `(scope, vtn)`.
    fn add_scratch(&self, scope: &str, vtn: &str, delta: i64) -> Result<()>;

    fn scratch(&self, scope: &str) -> Result<Vec<ScratchDelta>>;

    /// Delete every scratch row of `scope`; returns the count removed.
    fn purge_scratch(&self, scope: &str) -> Result<usize>;

    /// Scopes with at least one scratch row.
    fn scratch_scopes(&self) -> Result<Vec<String>>;

    /// Lease handed to each cursor this store opens.
    fn cursor_lease(&self) -> CursorLease {
        CursorLease::detached()
    }

    fn exists(&self, partition: Partition, key: &RecordKey) -> Result<bool> {
        Ok(self.read(partition, key)?.is_some())
    }

    /// Records of `key_type` that changed between `src` and `dst` for `op`.
    fn diff(
        &self,
        src: Partition,
        dst: Partition,
        key_type: KeyType,
        op: Operation,
        filter: &ScopeFilter,
    ) -> Result<DiffCursor> {
        let source = keyed(self.read_all(src, key_type, filter)?);
        let target = keyed(self.read_all(dst, key_type, filter)?);
        let entries = match op {
            Operation::Create => source
                .into_iter()
                .filter(|(key, _)| !target.contains_key(key))
                .map(|(_, record)| DiffEntry {
                    op,
                    record,
                    prior: None,
                })
                .collect(),
            Operation::Update => source
                .into_iter()
                .filter_map(|(key, record)| {
                    let prior = target.get(&key)?;
                    if record.same_config(prior) {
                        return None;
                    }
                    Some(DiffEntry {
                        op,
                        record,
                        prior: Some(prior.clone()),
                    })
                })
                .collect(),
            Operation::Delete => target
                .into_iter()
                .filter(|(key, _)| !source.contains_key(key))
                .map(|(_, record)| DiffEntry {
                    op,
                    record,
                    prior: None,
                })
                .collect(),
        };
        Ok(DiffCursor::new(op, entries, self.cursor_lease()))
    }

    /// Replace the `key_type` table of `to` with the one of `from`.
    fn copy_key_type(&self, from: Partition, to: Partition, key_type: KeyType) -> Result<usize> {
        let records = self.read_all(from, key_type, &ScopeFilter::all())?;
        self.clear(to, key_type, &ScopeFilter::all())?;
        let copied = records.len();
        for record in records {
            self.write(to, WriteOp::Upsert, record)?;
        }
        Ok(copied)
    }

    /// Every record of a partition, grouped by key type.
    fn dump(&self, partition: Partition) -> Result<Vec<ConfigRecord>> {
        let mut records = Vec::new();
        for key_type in KeyType::iter() {
            records.extend(self.read_all(partition, key_type, &ScopeFilter::all())?);
        }
        Ok(records)
    }

    /// Replace the whole content of a partition.
    fn replace_partition(&self, partition: Partition, records: Vec<ConfigRecord>) -> Result<()> {
        for key_type in KeyType::iter() {
            self.clear(partition, key_type, &ScopeFilter::all())?;
        }
        for record in records {
            self.write(partition, WriteOp::Upsert, record)?;
        }
        Ok(())
    }
}

fn keyed(records: Vec<ConfigRecord>) -> BTreeMap<RecordKey, ConfigRecord> {
    records
        .into_iter()
        .map(|record| (record.key.clone(), record))
        .collect()
}
