//! ---
//! vtnc_section: "02-resource-allocation"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Two-phase label allocator over bounded pools."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vtnc_common::AllocatorConfig;
use vtnc_store::{ConfigRecord, ConfigStore, KeyType, Partition, ScopeFilter, WriteOp};

use crate::label::Label;
use crate::pool::{
    bridge_scope, limit_key, pool_key, spine_scope, usage_key, PoolKind, PoolSnapshot,
    ATTR_CAPACITY, ATTR_OWNER, ATTR_USED_COUNT,
};
use crate::{AllocError, Result};

/// A label together with the pool it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub scope: String,
    pub label: Label,
}

/// Outcome of settling one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub scope: String,
    /// Net delta that was applied.
    pub applied: i64,
    /// Counter value written by the settlement.
    pub used_count: u64,
}

/// Allocates labels from CANDIDATE pools and settles the scratch ledger.
///
/// Callers serialize transactions touching the same scope; the best-fit scan
/// and the counter update are not atomic across two calls.
pub struct LabelAllocator {
    store: Arc<dyn ConfigStore>,
    config: AllocatorConfig,
}

impl LabelAllocator {
    pub fn new(store: Arc<dyn ConfigStore>, config: AllocatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Candidate view of every pool of `kind`, ordered by scope.
    pub fn pools(&self, kind: &PoolKind) -> Result<Vec<PoolSnapshot>> {
        let scopes = match kind {
            PoolKind::Bridge { vtn } => vec![bridge_scope(vtn)],
            PoolKind::Tunnel => self
                .store
                .read_all(Partition::Candidate, KeyType::SpineDomain, &ScopeFilter::all())?
                .iter()
                .map(|record| spine_scope(record.key.name()))
                .collect(),
        };
        scopes
            .iter()
            .map(|scope| self.pool(Partition::Candidate, scope))
            .collect()
    }

    /// Capacity and usage of one pool in `partition`.
    pub fn pool(&self, partition: Partition, scope: &str) -> Result<PoolSnapshot> {
        Ok(PoolSnapshot {
            scope: scope.to_owned(),
            capacity: self.capacity(partition, scope)?,
            used: self.used_count(partition, scope)?,
        })
    }

    /// Hand out the lowest free label of the pool with the most headroom.
    ///
    /// Ties on headroom go to the lexicographically smallest scope.
    pub fn allocate(&self, kind: &PoolKind, owner: &str) -> Result<Allocation> {
        let pools = self.pools(kind)?;
        let Some(pool) = pick_pool(&pools) else {
            warn!(kind = %kind, owner, "label pools exhausted");
            return Err(AllocError::ExceedsResourceLimit {
                kind: kind.to_string(),
            });
        };

        let in_use = self.labels_in_use(Partition::Candidate, &pool.scope)?;
        let Some(value) = (1..=self.config.max_label).find(|label| !in_use.contains(label)) else {
            warn!(scope = %pool.scope, owner, "pool counter has headroom but no free label");
            return Err(AllocError::ExceedsResourceLimit {
                kind: kind.to_string(),
            });
        };

        self.claim(&pool.scope, value, owner, pool.used)?;
        debug!(scope = %pool.scope, owner, label = value, used = pool.used + 1, "label allocated");
        Ok(Allocation {
            scope: pool.scope.clone(),
            label: Label::Value(value),
        })
    }

    /// Take back a label released by [`LabelAllocator::deallocate`] in the same transaction.
    ///
    /// Fails with [`vtnc_store::StoreError::InstanceExists`] if the label was handed out again meanwhile.
    pub fn reclaim(&self, allocation: &Allocation, owner: &str) -> Result<()> {
        let Label::Value(value) = allocation.label else {
            return Ok(());
        };
        let used = self.used_count(Partition::Candidate, &allocation.scope)?;
        self.claim(&allocation.scope, value, owner, used)?;
        debug!(scope = %allocation.scope, owner, label = value, used = used + 1, "label reclaimed");
        Ok(())
    }

    fn claim(&self, scope: &str, value: u32, owner: &str, used: u64) -> Result<()> {
        self.store.write(
            Partition::Candidate,
            WriteOp::Create,
            ConfigRecord::new(usage_key(scope, value)).with_attr(ATTR_OWNER, owner),
        )?;
        self.write_used(Partition::Candidate, scope, used + 1)?;
        self.store.add_scratch(scope, owner, 1)?;
        Ok(())
    }

    /// The transparent sentinel for a VTN's bridge scope; no accounting happens.
    pub fn transparent(&self, vtn: &str) -> Allocation {
        Allocation {
            scope: bridge_scope(vtn),
            label: Label::Transparent,
        }
    }

    /// Return a label to its pool. Releasing the transparent sentinel is a no-op.
    pub fn deallocate(&self, allocation: &Allocation, owner: &str) -> Result<()> {
        let Label::Value(value) = allocation.label else {
            return Ok(());
        };
        let scope = allocation.scope.as_str();
        if !self.is_held(allocation, owner)? {
            return Err(AllocError::UnknownLabel {
                scope: scope.to_owned(),
                label: value,
            });
        }
        let used = self.used_count(Partition::Candidate, scope)?;
        if used == 0 {
            return Err(AllocError::CounterUnderflow {
                scope: scope.to_owned(),
            });
        }

        let usage = usage_key(scope, value);
        self.store.delete(Partition::Candidate, &usage)?;
        if let Err(err) = self.write_used(Partition::Candidate, scope, used - 1) {
            let restored = ConfigRecord::new(usage).with_attr(ATTR_OWNER, owner);
            if let Err(restore) = self.store.write(Partition::Candidate, WriteOp::Create, restored) {
                warn!(scope, label = value, error = %restore, "failed to restore usage record");
            }
            return Err(err);
        }
        self.store.add_scratch(scope, owner, -1)?;

        debug!(scope, owner, label = value, used = used - 1, "label released");
        Ok(())
    }

    /// Whether `owner` currently holds the allocation in CANDIDATE.
    pub fn is_held(&self, allocation: &Allocation, owner: &str) -> Result<bool> {
        let Label::Value(value) = allocation.label else {
            return Ok(true);
        };
        Ok(self
            .store
            .read(Partition::Candidate, &usage_key(&allocation.scope, value))?
            .map_or(false, |usage| usage.attr_str(ATTR_OWNER) == Some(owner)))
    }

    /// Scopes with unsettled deltas.
    pub fn pending_scopes(&self) -> Result<Vec<String>> {
        Ok(self.store.scratch_scopes()?)
    }

    /// Fold the pending deltas of `scope` into RUNNING and purge them.
    pub fn settle_on_commit(&self, scope: &str) -> Result<Settlement> {
        let (applied, per_owner) = self.pending_sum(scope)?;
        let running = self.used_count(Partition::Running, scope)? as i64;
        let settled = running + applied;
        if settled < 0 {
            return Err(AllocError::CounterUnderflow {
                scope: scope.to_owned(),
            });
        }
        let used_count = settled as u64;
        self.write_used(Partition::Running, scope, used_count)?;
        self.store.purge_scratch(scope)?;

        info!(scope, applied, used_count, owners = ?per_owner, "pool settled on commit");
        Ok(Settlement {
            scope: scope.to_owned(),
            applied,
            used_count,
        })
    }

    /// Reverse the pending deltas of `scope` in CANDIDATE and purge them.
    pub fn settle_on_abort(&self, scope: &str) -> Result<Settlement> {
        let (applied, per_owner) = self.pending_sum(scope)?;
        let candidate = self.used_count(Partition::Candidate, scope)? as i64;
        let restored = candidate - applied;
        if restored < 0 {
            warn!(scope, candidate, applied, "abort settlement clamped at zero");
        }
        let used_count = restored.max(0) as u64;
        self.write_used(Partition::Candidate, scope, used_count)?;
        self.store.purge_scratch(scope)?;

        info!(scope, reversed = applied, used_count, owners = ?per_owner, "pool settled on abort");
        Ok(Settlement {
            scope: scope.to_owned(),
            applied: -applied,
            used_count,
        })
    }

    /// Labels currently recorded as handed out from `scope`.
    pub fn labels_in_use(&self, partition: Partition, scope: &str) -> Result<BTreeSet<u32>> {
        Ok(self
            .store
            .read_all(partition, KeyType::LabelUsage, &ScopeFilter::prefix([scope]))?
            .iter()
            .filter_map(|usage| usage.key.name().parse().ok())
            .collect())
    }

    fn pending_sum(&self, scope: &str) -> Result<(i64, BTreeMap<String, i64>)> {
        let mut per_owner = BTreeMap::new();
        for row in self.store.scratch(scope)? {
            *per_owner.entry(row.vtn).or_insert(0) += row.delta;
        }
        Ok((per_owner.values().sum(), per_owner))
    }

    fn capacity(&self, partition: Partition, scope: &str) -> Result<u64> {
        let default = if PoolSnapshot::is_bridge_scope(scope) {
            self.config.bridge_label_capacity
        } else {
            self.config.tunnel_label_capacity
        };
        let limit = self
            .store
            .read(partition, &limit_key(scope))?
            .and_then(|record| record.attr_u64(ATTR_CAPACITY))
            .unwrap_or(u64::from(default));
        Ok(limit.min(u64::from(self.config.max_label)))
    }

    fn used_count(&self, partition: Partition, scope: &str) -> Result<u64> {
        Ok(self
            .store
            .read(partition, &pool_key(scope))?
            .and_then(|record| record.attr_u64(ATTR_USED_COUNT))
            .unwrap_or(0))
    }

    fn write_used(&self, partition: Partition, scope: &str, used: u64) -> Result<()> {
        let mut record = self
            .store
            .read(partition, &pool_key(scope))?
            .unwrap_or_else(|| ConfigRecord::new(pool_key(scope)));
        record.set_attr(ATTR_USED_COUNT, used);
        self.store.write(partition, WriteOp::Upsert, record)?;
        Ok(())
    }
}

fn pick_pool(pools: &[PoolSnapshot]) -> Option<&PoolSnapshot> {
    pools
        .iter()
        .filter(|pool| pool.available() > 0)
        .min_by(|a, b| {
            b.available()
                .cmp(&a.available())
                .then_with(|| a.scope.cmp(&b.scope))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{pool_limit_record, spine_domain_record};
    use vtnc_store::MemoryStore;

    fn allocator() -> (Arc<MemoryStore>, LabelAllocator) {
        let store = Arc::new(MemoryStore::new());
        let allocator = LabelAllocator::new(store.clone(), AllocatorConfig::default());
        (store, allocator)
    }

    fn seed_used(store: &MemoryStore, partition: Partition, scope: &str, used: u64) {
        store
            .write(
                partition,
                WriteOp::Upsert,
                ConfigRecord::new(pool_key(scope)).with_attr(ATTR_USED_COUNT, used),
            )
            .unwrap();
    }

    #[test]
    fn pick_pool_prefers_headroom_then_smallest_scope() {
        let pools = vec![
            PoolSnapshot { scope: "spine:b".into(), capacity: 10, used: 2 },
            PoolSnapshot { scope: "spine:a".into(), capacity: 10, used: 2 },
            PoolSnapshot { scope: "spine:c".into(), capacity: 10, used: 5 },
        ];
        assert_eq!(pick_pool(&pools).unwrap().scope, "spine:a");

        let full = vec![PoolSnapshot { scope: "spine:a".into(), capacity: 1, used: 1 }];
        assert!(pick_pool(&full).is_none());
    }

    #[test]
    fn allocate_hands_out_lowest_free_label_and_stages_delta() {
        let (store, allocator) = allocator();
        let kind = PoolKind::bridge("v1");
        let first = allocator.allocate(&kind, "v1").unwrap();
        let second = allocator.allocate(&kind, "v1").unwrap();
        assert_eq!(first.label, Label::Value(1));
        assert_eq!(second.label, Label::Value(2));

        allocator.deallocate(&first, "v1").unwrap();
        let third = allocator.allocate(&kind, "v1").unwrap();
        assert_eq!(third.label, Label::Value(1));

        assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 2);
        let rows = store.scratch("vtn:v1").unwrap();
        assert_eq!(rows.iter().map(|r| r.delta).sum::<i64>(), 2);
    }

    #[test]
    fn tunnel_allocation_uses_spine_domain_with_most_headroom() {
        let (store, allocator) = allocator();
        for spine in ["s1", "s2"] {
            store
                .write(Partition::Candidate, WriteOp::Upsert, spine_domain_record(spine, "ctl-s", spine))
                .unwrap();
        }
        seed_used(&store, Partition::Candidate, "spine:s1", 5);

        let allocation = allocator.allocate(&PoolKind::Tunnel, "v1").unwrap();
        assert_eq!(allocation.scope, "spine:s2");
    }

    #[test]
    fn tunnel_allocation_without_spine_domains_is_exhaustion() {
        let (_store, allocator) = allocator();
        assert!(matches!(
            allocator.allocate(&PoolKind::Tunnel, "v1"),
            Err(AllocError::ExceedsResourceLimit { .. })
        ));
    }

    #[test]
    fn pool_limit_overrides_default_capacity() {
        let (store, allocator) = allocator();
        store
            .write(Partition::Candidate, WriteOp::Upsert, pool_limit_record("vtn:v1", 1))
            .unwrap();
        let kind = PoolKind::bridge("v1");
        allocator.allocate(&kind, "v1").unwrap();
        assert!(matches!(
            allocator.allocate(&kind, "v1"),
            Err(AllocError::ExceedsResourceLimit { .. })
        ));
    }

    #[test]
    fn transparent_never_touches_accounting() {
        let (store, allocator) = allocator();
        let allocation = allocator.transparent("v1");
        allocator.deallocate(&allocation, "v1").unwrap();
        assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 0);
        assert!(store.scratch_scopes().unwrap().is_empty());
    }

    #[test]
    fn releasing_unknown_label_is_rejected() {
        let (_store, allocator) = allocator();
        let bogus = Allocation { scope: "vtn:v1".into(), label: Label::Value(9) };
        assert!(matches!(
            allocator.deallocate(&bogus, "v1"),
            Err(AllocError::UnknownLabel { label: 9, .. })
        ));
    }

    #[test]
    fn reclaim_restores_a_released_label() {
        let (store, allocator) = allocator();
        let kind = PoolKind::bridge("v1");
        let first = allocator.allocate(&kind, "v1").unwrap();
        allocator.deallocate(&first, "v1").unwrap();
        assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 0);

        allocator.reclaim(&first, "v1").unwrap();
        assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 1);
        assert_eq!(allocator.labels_in_use(Partition::Candidate, "vtn:v1").unwrap(), BTreeSet::from([1]));
        let rows = store.scratch("vtn:v1").unwrap();
        assert_eq!(rows.iter().map(|r| r.delta).sum::<i64>(), 1);

        assert!(matches!(
            allocator.reclaim(&first, "v1"),
            Err(AllocError::Store(_))
        ));
    }

    #[test]
    fn commit_settlement_folds_deltas_into_running() {
        let (store, allocator) = allocator();
        seed_used(&store, Partition::Running, "vtn:v1", 3);
        seed_used(&store, Partition::Candidate, "vtn:v1", 3);
        let kind = PoolKind::bridge("v1");
        let a = allocator.allocate(&kind, "v1").unwrap();
        allocator.allocate(&kind, "v1").unwrap();
        allocator.deallocate(&a, "v1").unwrap();

        let settlement = allocator.settle_on_commit("vtn:v1").unwrap();
        assert_eq!(settlement.applied, 1);
        assert_eq!(settlement.used_count, 4);
        assert_eq!(allocator.pool(Partition::Running, "vtn:v1").unwrap().used, 4);
        assert!(allocator.pending_scopes().unwrap().is_empty());
    }

    #[test]
    fn abort_settlement_restores_candidate() {
        let (store, allocator) = allocator();
        seed_used(&store, Partition::Running, "vtn:v1", 2);
        seed_used(&store, Partition::Candidate, "vtn:v1", 2);
        let kind = PoolKind::bridge("v1");
        allocator.allocate(&kind, "v1").unwrap();
        allocator.allocate(&kind, "v1").unwrap();

        let settlement = allocator.settle_on_abort("vtn:v1").unwrap();
        assert_eq!(settlement.used_count, 2);
        assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 2);
        assert_eq!(allocator.pool(Partition::Running, "vtn:v1").unwrap().used, 2);
        assert!(store.scratch("vtn:v1").unwrap().is_empty());
    }

    #[test]
    fn commit_settlement_refuses_negative_counter() {
        let (store, allocator) = allocator();
        store.add_scratch("vtn:v1", "v1", -1).unwrap();
        assert!(matches!(
            allocator.settle_on_commit("vtn:v1"),
            Err(AllocError::CounterUnderflow { .. })
        ));
    }
}
