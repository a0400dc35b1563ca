//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Versioned configuration store and storage bindings."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::store::{ConfigStore, CursorLease, ScopeFilter, ScratchDelta, WriteOp};
use crate::types::{ConfigRecord, KeyType, Partition, RecordKey};
use crate::{Result, StoreError};

type Table = BTreeMap<RecordKey, ConfigRecord>;

#[derive(Debug, Default)]
struct Inner {
    partitions: HashMap<Partition, Table>,
    scratch: BTreeMap<(String, String), i64>,
    write_fault: Option<(Partition, KeyType)>,
}

/// In-process [`ConfigStore`] backed by ordered maps.
///
/// Records are kept per partition in key order, so reads and diffs are
/// deterministic. Open diff cursors are counted for leak detection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    open_cursors: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of diff cursors not yet dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Make every subsequent write of `key_type` into `partition` fail.
    pub fn inject_write_fault(&self, partition: Partition, key_type: KeyType) {
        self.inner.write().write_fault = Some((partition, key_type));
    }

    pub fn clear_write_fault(&self) {
        self.inner.write().write_fault = None;
    }

    /// Total record count of a partition.
    pub fn len(&self, partition: Partition) -> usize {
        self.inner
            .read()
            .partitions
            .get(&partition)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, partition: Partition) -> bool {
        self.len(partition) == 0
    }
}

fn check_fault(inner: &Inner, partition: Partition, key_type: KeyType) -> Result<()> {
    if inner.write_fault == Some((partition, key_type)) {
        warn!(partition = %partition, key_type = %key_type, "injected write fault");
        return Err(StoreError::Storage(format!(
            "write to {partition}/{key_type} rejected"
        )));
    }
    Ok(())
}

fn type_range<'a>(
    table: &'a Table,
    key_type: KeyType,
) -> impl Iterator<Item = (&'a RecordKey, &'a ConfigRecord)> + 'a {
    let lower = RecordKey::new(key_type, Vec::<String>::new());
    table
        .range(lower..)
        .take_while(move |(key, _)| key.key_type == key_type)
}

impl ConfigStore for MemoryStore {
    fn read(&self, partition: Partition, key: &RecordKey) -> Result<Option<ConfigRecord>> {
        if !key.is_well_formed() {
            return Err(StoreError::MalformedKey(key.clone()));
        }
        Ok(self
            .inner
            .read()
            .partitions
            .get(&partition)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn read_all(
        &self,
        partition: Partition,
        key_type: KeyType,
        filter: &ScopeFilter,
    ) -> Result<Vec<ConfigRecord>> {
        let inner = self.inner.read();
        let Some(table) = inner.partitions.get(&partition) else {
            return Ok(Vec::new());
        };
        Ok(type_range(table, key_type)
            .map(|(_, record)| record)
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    fn write(&self, partition: Partition, op: WriteOp, record: ConfigRecord) -> Result<()> {
        if !record.key.is_well_formed() {
            return Err(StoreError::MalformedKey(record.key));
        }
        let mut inner = self.inner.write();
        check_fault(&inner, partition, record.key.key_type)?;
        let table = inner.partitions.entry(partition).or_default();
        let present = table.contains_key(&record.key);
        match op {
            WriteOp::Create if present => return Err(StoreError::InstanceExists(record.key)),
            WriteOp::Update if !present => return Err(StoreError::NotFound(record.key)),
            _ => {}
        }
        debug!(partition = %partition, key = %record.key, ?op, "record written");
        table.insert(record.key.clone(), record);
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &RecordKey) -> Result<()> {
        let mut inner = self.inner.write();
        check_fault(&inner, partition, key.key_type)?;
        inner
            .partitions
            .get_mut(&partition)
            .and_then(|table| table.remove(key))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn clear(
        &self,
        partition: Partition,
        key_type: KeyType,
        filter: &ScopeFilter,
    ) -> Result<usize> {
        let mut inner = self.inner.write();
        check_fault(&inner, partition, key_type)?;
        let Some(table) = inner.partitions.get_mut(&partition) else {
            return Ok(0);
        };
        let doomed: Vec<RecordKey> = type_range(table, key_type)
            .filter(|(_, record)| filter.matches(record))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            table.remove(key);
        }
        Ok(doomed.len())
    }

    fn add_scratch(&self, scope: &str, vtn: &str, delta: i64) -> Result<()> {
        let mut inner = self.inner.write();
        *inner
            .scratch
            .entry((scope.to_owned(), vtn.to_owned()))
            .or_insert(0) += delta;
        Ok(())
    }

    fn scratch(&self, scope: &str) -> Result<Vec<ScratchDelta>> {
        Ok(self
            .inner
            .read()
            .scratch
            .iter()
            .filter(|((row_scope, _), _)| row_scope == scope)
            .map(|((scope, vtn), delta)| ScratchDelta {
                scope: scope.clone(),
                vtn: vtn.clone(),
                delta: *delta,
            })
            .collect())
    }

    fn purge_scratch(&self, scope: &str) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.scratch.len();
        inner.scratch.retain(|(row_scope, _), _| row_scope != scope);
        Ok(before - inner.scratch.len())
    }

    fn scratch_scopes(&self) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut scopes: Vec<String> = inner.scratch.keys().map(|(scope, _)| scope.clone()).collect();
        scopes.dedup();
        Ok(scopes)
    }

    fn cursor_lease(&self) -> CursorLease {
        CursorLease::tracked(Arc::clone(&self.open_cursors))
    }
}
