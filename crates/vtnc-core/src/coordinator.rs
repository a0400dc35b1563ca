//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Outer transaction driver tying the engines, allocator and pipeline together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use strum::IntoEnumIterator;
use tracing::warn;
use vtnc_alloc::{LabelAllocator, Settlement};
use vtnc_common::AppConfig;
use vtnc_driver::ControllerDriver;
use vtnc_logging::{log_system_event, LogContext, SystemEventOutcome};
use vtnc_store::{
    load_snapshot, save_snapshot, ConfigStore, KeyClass, KeyType, Operation, Partition,
    ScopeFilter, WriteOp,
};
use vtnc_topology::{ConversionPipeline, PortMapIntent, TopologyChange};

use crate::audit::{AuditEngine, AuditReport, AuditResult, AuditSignal};
use crate::commit::{CommitEngine, CommitReport, DispatchFailure};
use crate::import::ImportEngine;
use crate::metrics::EngineMetrics;
use crate::registry::{Capabilities, EntityType, KeyTypeRegistry};
use crate::translate::{rehydrate, RenameTable};
use crate::{EngineError, Result};

/// Collaborators shared by every engine.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn ConfigStore>,
    pub driver: Arc<dyn ControllerDriver>,
    pub registry: Arc<KeyTypeRegistry>,
    pub capabilities: Arc<Capabilities>,
    pub config: Arc<AppConfig>,
    pub metrics: Option<EngineMetrics>,
}

impl EngineContext {
    /// Context with the standard key-type registry.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ConfigStore>,
        driver: Arc<dyn ControllerDriver>,
    ) -> Result<Self> {
        let capabilities = Capabilities::from_config(&config.controllers)?;
        Ok(Self {
            store,
            driver,
            registry: Arc::new(KeyTypeRegistry::standard()),
            capabilities: Arc::new(capabilities),
            config: Arc::new(config),
            metrics: None,
        })
    }

    pub fn with_registry(mut self, registry: KeyTypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("driver", &self.driver.name())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionReport {
    pub session: u32,
    pub affected: BTreeSet<String>,
    pub dispatched: usize,
    pub promoted: usize,
    pub deferred: usize,
    pub settlements: Vec<Settlement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditSummary {
    pub controller: String,
    pub result: AuditResult,
    pub entities: Vec<(EntityType, AuditReport)>,
    pub cancelled: bool,
}

/// Clears a controller's AUDIT records when dropped.
struct AuditScope<'a> {
    store: &'a dyn ConfigStore,
    controller: &'a str,
}

impl AuditScope<'_> {
    fn clear(&self) {
        let filter = ScopeFilter::all().with_controller(self.controller);
        for key_type in KeyType::iter() {
            if let Err(err) = self.store.clear(Partition::Audit, key_type, &filter) {
                warn!(controller = self.controller, key_type = %key_type, error = %err, "audit partition not cleared");
            }
        }
    }
}

impl Drop for AuditScope<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Drives whole transactions across every entity type.
///
/// Callers serialize transactions; the coordinator holds no lock of its own.
pub struct TransactionCoordinator {
    ctx: EngineContext,
    allocator: Arc<LabelAllocator>,
    pipeline: ConversionPipeline,
    commit: CommitEngine,
    audit: AuditEngine,
    import: ImportEngine,
}

impl TransactionCoordinator {
    pub fn new(ctx: EngineContext) -> Self {
        let allocator = Arc::new(LabelAllocator::new(
            ctx.store.clone(),
            ctx.config.allocator.clone(),
        ));
        Self {
            pipeline: ConversionPipeline::new(allocator.clone()),
            commit: CommitEngine::new(ctx.clone()),
            audit: AuditEngine::new(ctx.clone()),
            import: ImportEngine::new(ctx.clone()),
            allocator,
            ctx,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn allocator(&self) -> &Arc<LabelAllocator> {
        &self.allocator
    }

    pub fn pipeline(&self) -> &ConversionPipeline {
        &self.pipeline
    }

    pub fn import(&self) -> &ImportEngine {
        &self.import
    }

    pub fn apply_intent(&self, intent: &PortMapIntent) -> Result<TopologyChange> {
        Ok(self.pipeline.apply_intent(intent)?)
    }

    pub fn retract_intent(&self, intent: &PortMapIntent) -> Result<TopologyChange> {
        Ok(self.pipeline.retract_intent(intent)?)
    }

    /// Commit every entity type, then settle the allocator.
    ///
    /// Every CREATE and UPDATE record is validated before anything is sent.
    /// CREATE and UPDATE then run in dependency order and DELETE in reverse.
    /// The first rejected record fails the commit with
    /// [`crate::EngineError::Dispatch`]: RUNNING is rolled back to its state
    /// before the commit, the controllers are sent the inverse of what they
    /// accepted, and the allocator is left unsettled for the caller to abort.
    pub fn commit_transaction(&self, session: u32) -> Result<TransactionReport> {
        let started = Instant::now();
        let log_ctx = LogContext::new().with_session(session);

        let creates = [Operation::Create, Operation::Update]
            .into_iter()
            .flat_map(|op| EntityType::COMMIT_ORDER.into_iter().map(move |entity| (entity, op)));
        let deletes = EntityType::COMMIT_ORDER
            .into_iter()
            .rev()
            .map(|entity| (entity, Operation::Delete));
        let phases: Vec<(EntityType, Operation)> = creates.chain(deletes).collect();

        for (entity, op) in &phases {
            if let Err(err) = self.commit.validate_phase(*entity, *op) {
                log_system_event(Some(&log_ctx), "commit", "transaction rejected", SystemEventOutcome::Fault);
                self.observe("commit", started);
                return Err(err);
            }
        }

        let mut report = CommitReport::default();
        let mut outcome = Ok(());
        for (entity, op) in phases {
            outcome = self.commit.run_phase(entity, op, session, &mut report);
            if outcome.is_err() || report.failure.is_some() {
                break;
            }
        }
        if outcome.is_err() || report.failure.is_some() {
            let journal = std::mem::take(&mut report.journal);
            match self.commit.rollback(&journal, session) {
                Ok(rejected) => warn!(session, undone = journal.len(), rejected, "commit rolled back"),
                Err(err) => warn!(session, error = %err, "commit rollback incomplete"),
            }
            log_system_event(Some(&log_ctx), "commit", "transaction failed", SystemEventOutcome::Fault);
            self.observe("commit", started);
            outcome?;
            if let Some(failure) = report.failure.take() {
                return Err(EngineError::Dispatch(Box::new(DispatchFailure {
                    affected: report.affected,
                    ..failure
                })));
            }
        }

        let mut settlements = Vec::new();
        for scope in self.allocator.pending_scopes()? {
            settlements.push(self.allocator.settle_on_commit(&scope)?);
            if let Some(metrics) = &self.ctx.metrics {
                metrics.record_settlement("commit");
            }
        }
        log_system_event(
            Some(&log_ctx),
            "commit",
            &format!(
                "{} dispatched, {} promoted, {} deferred, {} scopes settled",
                report.dispatched,
                report.promoted,
                report.deferred,
                settlements.len()
            ),
            SystemEventOutcome::Success,
        );
        self.observe("commit", started);
        Ok(TransactionReport {
            session,
            affected: report.affected,
            dispatched: report.dispatched,
            promoted: report.promoted,
            deferred: report.deferred,
            settlements,
        })
    }

    /// Reverse pending allocations and reset CANDIDATE to RUNNING.
    pub fn abort_transaction(&self, session: u32) -> Result<Vec<Settlement>> {
        let started = Instant::now();
        let mut settlements = Vec::new();
        for scope in self.allocator.pending_scopes()? {
            settlements.push(self.allocator.settle_on_abort(&scope)?);
            if let Some(metrics) = &self.ctx.metrics {
                metrics.record_settlement("abort");
            }
        }
        for key_type in KeyType::iter().filter(|kt| kt.class() != KeyClass::AllocatorOwned) {
            self.ctx
                .store
                .copy_key_type(Partition::Running, Partition::Candidate, key_type)?;
        }
        log_system_event(
            Some(&LogContext::new().with_session(session)),
            "abort",
            &format!("{} scopes reversed", settlements.len()),
            SystemEventOutcome::Success,
        );
        self.observe("abort", started);
        Ok(settlements)
    }

    /// Pull the controller's configuration into AUDIT and reconcile every entity type.
    pub fn audit_controller(&self, controller: &str, signal: &AuditSignal) -> Result<AuditSummary> {
        let signal = match self.ctx.config.audit.max_duration {
            Some(budget) => signal.clone().with_budget(budget),
            None => signal.clone(),
        };
        let log_ctx = LogContext::new().with_controller(controller);
        let scope = AuditScope {
            store: self.ctx.store.as_ref(),
            controller,
        };
        scope.clear();

        let outcome = self.run_audit(controller, &signal);
        drop(scope);
        match &outcome {
            Ok(summary) => {
                let event = if summary.cancelled {
                    SystemEventOutcome::Cancelled
                } else {
                    SystemEventOutcome::Success
                };
                log_system_event(Some(&log_ctx), "audit", summary.result.as_ref(), event);
                if let Some(metrics) = &self.ctx.metrics {
                    let outcome = if summary.cancelled { "cancelled" } else { summary.result.as_ref() };
                    metrics.record_audit(controller, outcome);
                }
            }
            Err(err) => {
                log_system_event(Some(&log_ctx), "audit", &err.to_string(), SystemEventOutcome::Fault);
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_audit(controller, "failed");
                }
            }
        }
        outcome
    }

    fn run_audit(&self, controller: &str, signal: &AuditSignal) -> Result<AuditSummary> {
        self.load_audit(controller)?;
        let mut summary = AuditSummary {
            controller: controller.to_owned(),
            result: AuditResult::NoChange,
            entities: Vec::new(),
            cancelled: false,
        };
        for entity in EntityType::COMMIT_ORDER.into_iter().filter(|e| !e.is_local()) {
            let report = self.audit.audit(entity, controller, signal)?;
            summary.result.raise(report.result);
            let cancelled = report.cancelled;
            summary.entities.push((entity, report));
            if cancelled {
                summary.cancelled = true;
                break;
            }
        }
        Ok(summary)
    }

    fn load_audit(&self, controller: &str) -> Result<usize> {
        let fetched = self.ctx.driver.fetch_running(controller)?;
        let renames = RenameTable::load(self.ctx.store.as_ref(), Partition::Running)?;
        let mut loaded = 0;
        for mut record in fetched {
            let handler = self.ctx.registry.handler(record.key.key_type)?;
            let domain = record.domain.clone().unwrap_or_default();
            record.key = renames.to_unified_key(&record.key, controller, &domain);
            let running = self.ctx.store.read(Partition::Running, &record.key)?;
            let record = rehydrate(
                handler.as_ref(),
                &self.ctx.capabilities,
                controller,
                record,
                running.as_ref(),
            );
            self.ctx.store.write(Partition::Audit, WriteOp::Upsert, record)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Copy RUNNING to STARTUP and persist it; returns the record count.
    pub fn save_startup(&self) -> Result<usize> {
        for key_type in KeyType::iter() {
            self.ctx
                .store
                .copy_key_type(Partition::Running, Partition::Startup, key_type)?;
        }
        let records = self.ctx.store.dump(Partition::Startup)?;
        save_snapshot(&records, &self.ctx.config.store.startup_path)?;
        log_system_event(
            None,
            "startup_saved",
            &format!("{} records", records.len()),
            SystemEventOutcome::Success,
        );
        Ok(records.len())
    }

    /// Seed STARTUP, RUNNING and CANDIDATE from the persisted snapshot.
    pub fn load_startup(&self) -> Result<usize> {
        let records = load_snapshot(&self.ctx.config.store.startup_path)?;
        for partition in [Partition::Startup, Partition::Running, Partition::Candidate] {
            self.ctx.store.replace_partition(partition, records.clone())?;
        }
        for scope in self.ctx.store.scratch_scopes()? {
            self.ctx.store.purge_scratch(&scope)?;
        }
        log_system_event(
            None,
            "startup_loaded",
            &format!("{} records", records.len()),
            SystemEventOutcome::Success,
        );
        Ok(records.len())
    }

    fn observe(&self, kind: &str, started: Instant) {
        if let Some(metrics) = &self.ctx.metrics {
            metrics.observe_transaction(kind, started.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::StandardHandler;
    use vtnc_common::ControllerConfig;
    use vtnc_driver::InMemoryDriver;
    use vtnc_store::{ConfigRecord, MemoryStore, RecordKey};

    pub(crate) struct Fixture {
        pub store: Arc<MemoryStore>,
        pub driver: Arc<InMemoryDriver>,
        pub ctx: EngineContext,
    }

    impl Fixture {
        pub fn candidate(&self, record: ConfigRecord) {
            self.store
                .write(Partition::Candidate, WriteOp::Upsert, record)
                .unwrap();
        }

        pub fn running_record(&self, record: ConfigRecord) {
            self.store
                .write(Partition::Running, WriteOp::Upsert, record)
                .unwrap();
        }

        pub fn candidate_record(&self, key: &RecordKey) -> Option<ConfigRecord> {
            self.store.read(Partition::Candidate, key).unwrap()
        }

        pub fn running(&self, key: &RecordKey) -> Option<ConfigRecord> {
            self.store.read(Partition::Running, key).unwrap()
        }
    }

    pub(crate) fn fixture(controllers: &[&str]) -> Fixture {
        fixture_with(AppConfig::default(), controllers)
    }

    pub(crate) fn fixture_with(mut config: AppConfig, controllers: &[&str]) -> Fixture {
        vtnc_logging::init();
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(InMemoryDriver::new());
        for controller in controllers {
            driver.add_controller(controller);
            config.controllers.insert(
                controller.to_string(),
                ControllerConfig {
                    domains: vec!["d1".into()],
                    ..Default::default()
                },
            );
        }
        let ctx = EngineContext::new(config, store.clone(), driver.clone()).unwrap();
        Fixture { store, driver, ctx }
    }

    #[test]
    fn audit_partition_is_cleared_on_error_paths() {
        let fx = fixture(&["c1"]);
        let coordinator = TransactionCoordinator::new(fx.ctx.clone());
        fx.driver.seed(
            "c1",
            ConfigRecord::new(RecordKey::new(KeyType::Vbridge, ["v1", "stale"]))
                .with_location("c1", "d1"),
        );
        fx.driver.fail_on(vtnc_driver::FailureRule::Nth(1));

        let summary = coordinator.audit_controller("c1", &AuditSignal::new()).unwrap();
        assert_eq!(summary.result, AuditResult::ConfigStatusChanged);
        assert!(fx.store.is_empty(Partition::Audit));

        let mut registry = KeyTypeRegistry::empty();
        registry.register(Arc::new(StandardHandler::for_key_type(KeyType::Vbridge)));
        let partial = TransactionCoordinator::new(fx.ctx.clone().with_registry(registry));
        fx.driver.seed(
            "c1",
            ConfigRecord::new(RecordKey::new(KeyType::Link, ["v1", "link-000001"]))
                .with_location("c1", "d1"),
        );
        assert!(matches!(
            partial.audit_controller("c1", &AuditSignal::new()),
            Err(EngineError::UnknownKeyType(KeyType::Link))
        ));
        assert!(fx.store.is_empty(Partition::Audit));

        fx.driver.set_connected("c1", false);
        assert!(matches!(
            coordinator.audit_controller("c1", &AuditSignal::new()),
            Err(EngineError::ControllerUnreachable(_))
        ));
    }
}
