//! ---
//! vtnc_section: "04-topology-conversion"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Port-map intent conversion into leaf and tunnel topology."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::{debug, error, warn};
use vtnc_alloc::{Allocation, LabelAllocator, PoolKind};
use vtnc_store::{
    ConfigRecord, ConfigStore, KeyType, Partition, RecordKey, ScopeFilter, StoreError, WriteOp,
};

use crate::{Result, TopologyError};

const ATTR_NEXT: &str = "next";

/// Staged CANDIDATE mutations of one pipeline call.
///
/// Reads see staged writes. Allocations are made eagerly and released by
/// [`TopologyBuilder::abandon`]; releases are deferred to
/// [`TopologyBuilder::commit`], which lands the writes all or none.
pub struct TopologyBuilder<'a> {
    allocator: &'a LabelAllocator,
    staged: IndexMap<RecordKey, Option<ConfigRecord>>,
    acquired: Vec<(Allocation, String)>,
    released: Vec<(Allocation, String)>,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(allocator: &'a LabelAllocator) -> Self {
        Self {
            allocator,
            staged: IndexMap::new(),
            acquired: Vec::new(),
            released: Vec::new(),
        }
    }

    fn store(&self) -> &dyn ConfigStore {
        self.allocator.store().as_ref()
    }

    pub fn read(&self, key: &RecordKey) -> Result<Option<ConfigRecord>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.store().read(Partition::Candidate, key)?),
        }
    }

    /// Records of `key_type` under `prefix`, staged writes applied.
    pub fn read_all(&self, key_type: KeyType, prefix: &[&str]) -> Result<Vec<ConfigRecord>> {
        let prefix: Vec<String> = prefix.iter().map(|part| (*part).to_owned()).collect();
        let mut merged: BTreeMap<RecordKey, ConfigRecord> = self
            .store()
            .read_all(Partition::Candidate, key_type, &ScopeFilter::prefix(prefix.clone()))?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        for (key, staged) in &self.staged {
            if key.key_type != key_type || !key.starts_with(&prefix) {
                continue;
            }
            match staged {
                Some(record) => {
                    merged.insert(key.clone(), record.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    pub fn put(&mut self, record: ConfigRecord) {
        self.staged.insert(record.key.clone(), Some(record));
    }

    pub fn remove(&mut self, key: RecordKey) {
        self.staged.insert(key, None);
    }

    pub fn allocate(&mut self, kind: &PoolKind, owner: &str) -> Result<Allocation> {
        let allocation = self.allocator.allocate(kind, owner)?;
        self.acquired.push((allocation.clone(), owner.to_owned()));
        Ok(allocation)
    }

    pub fn transparent(&self, vtn: &str) -> Allocation {
        self.allocator.transparent(vtn)
    }

    /// Schedule a release for commit; the label must currently be held by `owner`.
    pub fn release(&mut self, allocation: Allocation, owner: &str) -> Result<()> {
        if !self.allocator.is_held(&allocation, owner)? {
            return Err(TopologyError::Inconsistent(format!(
                "label {} of pool {} is not held by {}",
                allocation.label, allocation.scope, owner
            )));
        }
        self.released.push((allocation, owner.to_owned()));
        Ok(())
    }

    /// Next `<prefix>-<seq:06>` name from the prefix's counter record.
    pub fn next_name(&mut self, prefix: &str) -> Result<String> {
        let key = RecordKey::new(KeyType::NameSequence, [prefix]);
        let mut counter = self
            .read(&key)?
            .unwrap_or_else(|| ConfigRecord::new(key.clone()));
        let seq = counter.attr_u64(ATTR_NEXT).unwrap_or(1);
        counter.set_attr(ATTR_NEXT, seq + 1);
        self.put(counter);
        Ok(format!("{prefix}-{seq:06}"))
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Perform the deferred releases, then land every staged write.
    ///
    /// Any failure reclaims the labels already released, restores the records
    /// already written and releases the labels acquired by this builder.
    pub fn commit(self) -> Result<()> {
        for (index, (allocation, owner)) in self.released.iter().enumerate() {
            if let Err(err) = self.allocator.deallocate(allocation, owner) {
                warn!(scope = %allocation.scope, label = %allocation.label, error = %err, "label release failed, abandoning topology change");
                self.reclaim_released(index);
                self.abandon();
                return Err(err.into());
            }
        }

        let store = self.allocator.store().clone();
        let mut undo: Vec<(RecordKey, Option<ConfigRecord>)> = Vec::with_capacity(self.staged.len());
        let mut failure = None;
        for (key, staged) in &self.staged {
            match apply(store.as_ref(), key, staged) {
                Ok(prior) => undo.push((key.clone(), prior)),
                Err(err) => {
                    failure = Some((key.clone(), err));
                    break;
                }
            }
        }
        if let Some((key, err)) = failure {
            warn!(key = %key, error = %err, written = undo.len(), "topology write failed, rolling back");
            rollback(store.as_ref(), undo);
            self.reclaim_released(self.released.len());
            self.abandon();
            return Err(err.into());
        }
        debug!(
            writes = self.staged.len(),
            acquired = self.acquired.len(),
            released = self.released.len(),
            "topology staged writes committed"
        );
        Ok(())
    }

    fn reclaim_released(&self, count: usize) {
        for (allocation, owner) in self.released[..count].iter().rev() {
            if let Err(err) = self.allocator.reclaim(allocation, owner) {
                error!(scope = %allocation.scope, label = %allocation.label, error = %err, "failed to reclaim label of abandoned topology change");
            }
        }
    }

    /// Drop staged writes and return every label acquired by this builder.
    pub fn abandon(self) {
        for (allocation, owner) in self.acquired.iter().rev() {
            if let Err(err) = self.allocator.deallocate(allocation, owner) {
                error!(scope = %allocation.scope, label = %allocation.label, error = %err, "failed to release label of abandoned topology change");
            }
        }
    }
}

fn apply(
    store: &dyn ConfigStore,
    key: &RecordKey,
    staged: &Option<ConfigRecord>,
) -> std::result::Result<Option<ConfigRecord>, StoreError> {
    let prior = store.read(Partition::Candidate, key)?;
    match staged {
        Some(record) => store.write(Partition::Candidate, WriteOp::Upsert, record.clone())?,
        None if prior.is_some() => store.delete(Partition::Candidate, key)?,
        None => {}
    }
    Ok(prior)
}

fn rollback(store: &dyn ConfigStore, undo: Vec<(RecordKey, Option<ConfigRecord>)>) {
    for (key, prior) in undo.into_iter().rev() {
        let restored = match prior {
            Some(record) => store.write(Partition::Candidate, WriteOp::Upsert, record),
            None => match store.delete(Partition::Candidate, &key) {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            },
        };
        if let Err(err) = restored {
            error!(key = %key, error = %err, "failed to restore record during topology rollback");
        }
    }
}
