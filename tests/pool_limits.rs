//! ---
//! vtnc_section: "08-testing"
//! vtnc_subsection: "integration-tests"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Pool capacity limits across allocation, commit and abort."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::sync::Arc;

use tempfile::TempDir;
use vtnc_alloc::{bridge_scope, pool_limit_record, spine_domain_record, AllocError};
use vtnc_common::{AppConfig, ControllerConfig};
use vtnc_core::{EngineContext, EngineError, TransactionCoordinator};
use vtnc_driver::InMemoryDriver;
use vtnc_store::{ConfigRecord, ConfigStore, KeyType, MemoryStore, Partition, RecordKey, WriteOp};
use vtnc_topology::{PortLabel, PortMapIntent, TopologyError};

struct Setup {
    _dir: TempDir,
    store: Arc<MemoryStore>,
    driver: Arc<InMemoryDriver>,
    coordinator: TransactionCoordinator,
}

fn setup(bridge_capacity: u32) -> Setup {
    vtnc_logging::init();
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.store.startup_path = dir.path().join("startup.json");
    let driver = Arc::new(InMemoryDriver::new());
    for (controller, domain) in [("x", "dom-d"), ("y", "dom-d"), ("spine-ctrl", "spine-a")] {
        config.controllers.insert(
            controller.to_owned(),
            ControllerConfig {
                domains: vec![domain.to_owned()],
                ..Default::default()
            },
        );
        driver.add_controller(controller);
    }

    let store = Arc::new(MemoryStore::new());
    for record in [
        ConfigRecord::new(RecordKey::new(KeyType::Vtn, ["v1"])),
        ConfigRecord::new(RecordKey::new(KeyType::Vbridge, ["v1", "br"])),
        spine_domain_record("s1", "spine-ctrl", "spine-a"),
        pool_limit_record(&bridge_scope("v1"), bridge_capacity),
    ] {
        store.write(Partition::Candidate, WriteOp::Upsert, record).unwrap();
    }
    let ctx = EngineContext::new(config, store.clone(), driver.clone()).unwrap();
    Setup {
        _dir: dir,
        store,
        driver,
        coordinator: TransactionCoordinator::new(ctx),
    }
}

fn intent(id: &str, controller: &str) -> PortMapIntent {
    PortMapIntent {
        vtn: "v1".into(),
        vbr: "br".into(),
        portmap_id: id.into(),
        controller: controller.into(),
        domain: "dom-d".into(),
        logical_port: format!("PP-{controller}-{id}"),
        label: PortLabel::Vlan(20),
    }
}

fn exhausted(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Topology(TopologyError::Alloc(AllocError::ExceedsResourceLimit { .. }))
    )
}

#[test]
fn pool_limit_caps_leaf_bridges_without_partial_writes() {
    let s = setup(1);
    s.coordinator.apply_intent(&intent("a", "x")).unwrap();
    let before = s.store.dump(Partition::Candidate).unwrap();

    let err = s.coordinator.apply_intent(&intent("b", "y")).unwrap_err();
    assert!(exhausted(&err), "unexpected error: {err}");
    assert_eq!(s.store.dump(Partition::Candidate).unwrap(), before);

    let scope = bridge_scope("v1");
    let pool = s.coordinator.allocator().pool(Partition::Candidate, &scope).unwrap();
    assert_eq!((pool.used, pool.capacity), (1, 1));
}

#[test]
fn pool_limit_is_committed_locally_and_survives_into_running() {
    let s = setup(1);
    s.coordinator.apply_intent(&intent("a", "x")).unwrap();
    let report = s.coordinator.commit_transaction(1).unwrap();
    assert_eq!(report.affected.len(), 1);

    let limit = RecordKey::new(KeyType::PoolLimit, [bridge_scope("v1")]);
    assert!(s.store.read(Partition::Running, &limit).unwrap().is_some());
    for request in s.driver.sent() {
        assert_ne!(request.key_type(), KeyType::PoolLimit);
        assert_ne!(request.key_type(), KeyType::LabelUsage);
        assert_ne!(request.key_type(), KeyType::NameSequence);
    }
    let scope = bridge_scope("v1");
    assert_eq!(s.coordinator.allocator().pool(Partition::Running, &scope).unwrap().used, 1);
}

#[test]
fn retracting_a_leaf_frees_room_for_another_controller() {
    let s = setup(1);
    s.coordinator.apply_intent(&intent("a", "x")).unwrap();
    s.coordinator.commit_transaction(1).unwrap();

    s.coordinator.retract_intent(&intent("a", "x")).unwrap();
    s.coordinator.apply_intent(&intent("b", "y")).unwrap();
    s.coordinator.commit_transaction(2).unwrap();

    assert!(s.driver.config("x").is_empty());
    assert_eq!(s.driver.config("y").len(), 2);
    let scope = bridge_scope("v1");
    assert_eq!(s.coordinator.allocator().pool(Partition::Running, &scope).unwrap().used, 1);
    assert!(s.coordinator.allocator().pending_scopes().unwrap().is_empty());
}

#[test]
fn abort_after_exhaustion_keeps_counters_consistent() {
    let s = setup(2);
    s.coordinator.apply_intent(&intent("a", "x")).unwrap();
    s.coordinator.apply_intent(&intent("b", "y")).unwrap();
    assert!(s.coordinator.apply_intent(&intent("c", "z")).is_err());

    s.coordinator.abort_transaction(1).unwrap();
    let scope = bridge_scope("v1");
    assert_eq!(s.coordinator.allocator().pool(Partition::Candidate, &scope).unwrap().used, 0);
    assert!(s.coordinator.allocator().pending_scopes().unwrap().is_empty());
    assert!(s.store.dump(Partition::Running).unwrap().is_empty());
}
