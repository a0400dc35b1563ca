//! ---
//! vtnc_section: "02-resource-allocation"
//! vtnc_subsection: "tests"
//! vtnc_type: "source"
//! vtnc_scope: "test"
//! vtnc_description: "Pool accounting properties of the label allocator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use vtnc_alloc::{
    pool_limit_record, AllocError, Label, LabelAllocator, PoolKind, ATTR_USED_COUNT,
};
use vtnc_common::AllocatorConfig;
use vtnc_store::{ConfigRecord, ConfigStore, KeyType, MemoryStore, Partition, RecordKey, WriteOp};

fn setup() -> (Arc<MemoryStore>, LabelAllocator) {
    vtnc_logging::init();
    let store = Arc::new(MemoryStore::new());
    let allocator = LabelAllocator::new(store.clone(), AllocatorConfig::default());
    (store, allocator)
}

fn seed_pool(store: &MemoryStore, scope: &str, used: u64) {
    for partition in [Partition::Candidate, Partition::Running] {
        store
            .write(
                partition,
                WriteOp::Upsert,
                ConfigRecord::new(RecordKey::new(KeyType::LabelPool, [scope]))
                    .with_attr(ATTR_USED_COUNT, used),
            )
            .unwrap();
    }
}

#[test]
fn exhausted_pool_fails_while_sibling_pool_succeeds() {
    let (store, allocator) = setup();
    store
        .write(Partition::Candidate, WriteOp::Upsert, pool_limit_record("vtn:v1", 4000))
        .unwrap();
    seed_pool(&store, "vtn:v1", 3999);

    let v1 = PoolKind::bridge("v1");
    allocator.allocate(&v1, "v1").unwrap();
    assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 4000);

    let err = allocator.allocate(&v1, "v1").unwrap_err();
    assert!(matches!(err, AllocError::ExceedsResourceLimit { .. }));

    let sibling = allocator.allocate(&PoolKind::bridge("v2"), "v2").unwrap();
    assert_eq!(sibling.label, Label::Value(1));
}

#[test]
fn labels_are_unique_until_released() {
    let (_store, allocator) = setup();
    let kind = PoolKind::bridge("v1");
    let mut seen = HashSet::new();
    let mut held = Vec::new();
    for _ in 0..64 {
        let allocation = allocator.allocate(&kind, "v1").unwrap();
        assert!(seen.insert(allocation.label), "duplicate {}", allocation.label);
        held.push(allocation);
    }

    let released = held.swap_remove(10);
    allocator.deallocate(&released, "v1").unwrap();
    let reused = allocator.allocate(&kind, "v1").unwrap();
    assert_eq!(reused.label, released.label);
}

#[test]
fn running_counter_tracks_settled_deltas_across_transactions() {
    let (_store, allocator) = setup();
    let kind = PoolKind::bridge("v1");

    let a = allocator.allocate(&kind, "v1").unwrap();
    allocator.allocate(&kind, "v1").unwrap();
    allocator.settle_on_commit("vtn:v1").unwrap();
    assert_eq!(allocator.pool(Partition::Running, "vtn:v1").unwrap().used, 2);

    allocator.deallocate(&a, "v1").unwrap();
    allocator.allocate(&kind, "v1").unwrap();
    allocator.allocate(&kind, "v1").unwrap();
    allocator.settle_on_abort("vtn:v1").unwrap();
    assert_eq!(allocator.pool(Partition::Candidate, "vtn:v1").unwrap().used, 2);
    assert_eq!(allocator.pool(Partition::Running, "vtn:v1").unwrap().used, 2);

    allocator.allocate(&kind, "v1").unwrap();
    let settlement = allocator.settle_on_commit("vtn:v1").unwrap();
    assert_eq!(settlement.used_count, 3);
    assert!(allocator.pending_scopes().unwrap().is_empty());
}
