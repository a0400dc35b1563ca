//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Reconciles RUNNING against the configuration a controller reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::debug;
use vtnc_driver::{ResultCode, Service};
use vtnc_logging::{vtnc_info, vtnc_warn, LogContext};
use vtnc_store::{
    ConfigRecord, ConfigStatus, ConfigStore, DiffEntry, Operation, Partition, RecordKey,
    ScopeFilter, WriteOp,
};

use crate::coordinator::EngineContext;
use crate::registry::{EntityType, KeyTypeHandler};
use crate::translate::{translate, RenameTable};
use crate::{status, EngineError, Result};

/// Aggregate effect of an audit; only ever raised within one pass.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditResult {
    #[default]
    NoChange,
    ConfigStatusChanged,
    ConfigChanged,
}

impl AuditResult {
    pub fn raise(&mut self, other: AuditResult) {
        *self = (*self).max(other);
    }
}

/// Cooperative cancellation polled once per audited record.
#[derive(Debug, Clone, Default)]
pub struct AuditSignal {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl AuditSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));
        self
    }

    /// Stop once `budget` has elapsed from now, unless an earlier deadline is set.
    pub fn with_budget(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    /// Request cancellation; clones share the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn should_continue(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
            && self.deadline.map_or(true, |deadline| Instant::now() < deadline)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditReport {
    pub result: AuditResult,
    /// Records pushed to the controller.
    pub repaired: usize,
    /// Records promoted to `APPLIED` by the status refresh.
    pub refreshed: usize,
    /// Records the controller rejected.
    pub failed: Vec<RecordKey>,
    pub cancelled: bool,
}

/// Pushes RUNNING onto one controller using the AUDIT partition as its state.
#[derive(Debug, Clone)]
pub struct AuditEngine {
    ctx: EngineContext,
}

impl AuditEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Audit one entity type against `controller`.
    ///
    /// Fails with [`EngineError::ControllerUnreachable`] when the controller
    /// drops mid-pass; records repaired before that stay repaired.
    pub fn audit(&self, entity: EntityType, controller: &str, signal: &AuditSignal) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        if entity.is_local() {
            return Ok(report);
        }
        let renames = RenameTable::load(self.ctx.store.as_ref(), Partition::Running)?;
        let log_ctx = LogContext::new().with_controller(controller).with_key_type(entity.as_ref());

        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            for key_type in entity.key_types() {
                let handler = self.ctx.registry.handler(key_type)?.clone();
                let cursor = self.ctx.store.diff(
                    Partition::Running,
                    Partition::Audit,
                    key_type,
                    op,
                    &ScopeFilter::all().with_controller(controller),
                )?;
                for entry in cursor {
                    if !signal.should_continue() {
                        vtnc_warn!(context = log_ctx.clone(), "audit cancelled at {}", entry.record.key);
                        report.cancelled = true;
                        return Ok(report);
                    }
                    if !entry.record.is_owned_by(controller) {
                        continue;
                    }
                    self.reconcile(handler.as_ref(), entry, &renames, &mut report)?;
                }
            }
        }

        if self.ctx.config.audit.refresh_status {
            self.refresh(entity, controller, &renames, &mut report)?;
        }
        vtnc_info!(
            context = log_ctx,
            "audit of {} finished: {} ({} repaired, {} refreshed, {} failed)",
            entity,
            report.result,
            report.repaired,
            report.refreshed,
            report.failed.len()
        );
        Ok(report)
    }

    fn reconcile(
        &self,
        handler: &dyn KeyTypeHandler,
        entry: DiffEntry,
        renames: &RenameTable,
        report: &mut AuditReport,
    ) -> Result<()> {
        // For DELETE the record comes from AUDIT; RUNNING no longer has it.
        let DiffEntry { op, mut record, prior } = entry;
        let Some(translated) = translate(
            handler,
            &self.ctx.capabilities,
            renames,
            &record,
            prior.as_ref(),
            op,
        ) else {
            return Ok(());
        };
        let controller = translated.controller.clone();
        let response = self.ctx.driver.send(translated.request(Service::Audit, op, None));

        match response.code {
            ResultCode::Success => {
                debug!(controller = %controller, key = %record.key, op = %op, "audit repaired record");
                if op != Operation::Delete {
                    status::mark_dispatched(&mut record, &translated, None);
                    self.ctx.store.write(Partition::Running, WriteOp::Upsert, record)?;
                }
                report.repaired += 1;
                report.result.raise(AuditResult::ConfigChanged);
                Ok(())
            }
            ResultCode::Unreachable => {
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_dispatch_failure(&controller, Service::Audit.as_ref());
                }
                Err(EngineError::ControllerUnreachable(controller))
            }
            ResultCode::Failed => {
                vtnc_warn!(
                    context = LogContext::new().with_controller(&controller),
                    "audit {} of {} rejected: {}",
                    op,
                    record.key,
                    response.message.as_deref().unwrap_or("no reason given")
                );
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_dispatch_failure(&controller, Service::Audit.as_ref());
                }
                report.failed.push(record.key.clone());
                if op != Operation::Delete {
                    status::mark_invalid(&mut record);
                    self.ctx.store.write(Partition::Running, WriteOp::Upsert, record)?;
                }
                report.result.raise(AuditResult::ConfigStatusChanged);
                Ok(())
            }
        }
    }

    /// Mark RUNNING records the controller already holds as `APPLIED`.
    fn refresh(
        &self,
        entity: EntityType,
        controller: &str,
        renames: &RenameTable,
        report: &mut AuditReport,
    ) -> Result<()> {
        let filter = ScopeFilter::all().with_controller(controller);
        for key_type in entity.key_types() {
            let handler = self.ctx.registry.handler(key_type)?.clone();
            for mut record in self.ctx.store.read_all(Partition::Running, key_type, &filter)? {
                if record.status == ConfigStatus::Applied || !self.held_by_controller(&record)? {
                    continue;
                }
                let Some(translated) = translate(
                    handler.as_ref(),
                    &self.ctx.capabilities,
                    renames,
                    &record,
                    None,
                    Operation::Create,
                ) else {
                    continue;
                };
                status::mark_dispatched(&mut record, &translated, None);
                self.ctx.store.write(Partition::Running, WriteOp::Upsert, record)?;
                report.refreshed += 1;
                report.result.raise(AuditResult::ConfigStatusChanged);
            }
        }
        Ok(())
    }

    fn held_by_controller(&self, record: &ConfigRecord) -> Result<bool> {
        Ok(self
            .ctx
            .store
            .read(Partition::Audit, &record.key)?
            .map_or(false, |held| held.same_config(record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::fixture;
    use crate::TransactionCoordinator;
    use vtnc_driver::{ControllerDriver, DriverRequest, DriverResponse, FailureRule, InMemoryDriver};
    use vtnc_store::KeyType;

    /// Trips the audit signal once a record has been pushed.
    struct CancellingDriver {
        inner: Arc<InMemoryDriver>,
        signal: AuditSignal,
    }

    impl ControllerDriver for CancellingDriver {
        fn send(&self, request: DriverRequest) -> DriverResponse {
            let response = self.inner.send(request);
            self.signal.cancel();
            response
        }

        fn is_connected(&self, controller: &str) -> bool {
            self.inner.is_connected(controller)
        }

        fn fetch_running(&self, controller: &str) -> vtnc_driver::Result<Vec<ConfigRecord>> {
            self.inner.fetch_running(controller)
        }

        fn name(&self) -> &'static str {
            "cancelling"
        }
    }

    fn portmap(name: &str) -> ConfigRecord {
        ConfigRecord::new(RecordKey::new(KeyType::PortMap, ["v1", "br", name]))
            .with_location("c1", "d1")
            .with_attr("logical_port", format!("PP-{name}"))
    }

    #[test]
    fn results_only_ever_rise() {
        let mut result = AuditResult::NoChange;
        result.raise(AuditResult::ConfigChanged);
        result.raise(AuditResult::ConfigStatusChanged);
        assert_eq!(result, AuditResult::ConfigChanged);
    }

    #[test]
    fn signal_stops_on_cancel_or_deadline() {
        let signal = AuditSignal::new();
        assert!(signal.should_continue());
        signal.clone().cancel();
        assert!(!signal.should_continue());

        let expired = AuditSignal::new().with_deadline(Instant::now());
        assert!(!expired.should_continue());
        let later = AuditSignal::new()
            .with_budget(Duration::from_secs(3600))
            .with_budget(Duration::from_secs(7200));
        assert!(later.should_continue());
    }

    #[test]
    fn missing_and_extra_records_are_repaired() {
        let fx = fixture(&["c1"]);
        fx.running_record(portmap("pm-a"));
        fx.store
            .write(Partition::Audit, WriteOp::Upsert, portmap("pm-z"))
            .unwrap();
        fx.driver.seed("c1", portmap("pm-z"));

        let report = AuditEngine::new(fx.ctx.clone())
            .audit(EntityType::PortMap, "c1", &AuditSignal::new())
            .unwrap();
        assert_eq!(report.result, AuditResult::ConfigChanged);
        assert_eq!(report.repaired, 2);
        let held: Vec<_> = fx.driver.config("c1").into_iter().map(|r| r.key).collect();
        assert_eq!(held, vec![portmap("pm-a").key]);
        assert_eq!(fx.running(&portmap("pm-a").key).unwrap().status, ConfigStatus::Applied);
    }

    #[test]
    fn other_controllers_are_skipped() {
        let fx = fixture(&["c1", "c2"]);
        fx.running_record(portmap("pm-a").with_location("c2", "d1"));
        let report = AuditEngine::new(fx.ctx.clone())
            .audit(EntityType::PortMap, "c1", &AuditSignal::new())
            .unwrap();
        assert_eq!(report.result, AuditResult::NoChange);
        assert!(fx.driver.sent().is_empty());
    }

    #[test]
    fn rejected_records_are_downgraded_to_invalid() {
        let fx = fixture(&["c1"]);
        fx.running_record(portmap("pm-a"));
        fx.running_record(portmap("pm-b"));
        fx.driver.fail_on(FailureRule::Key(portmap("pm-a").key));

        let report = AuditEngine::new(fx.ctx.clone())
            .audit(EntityType::PortMap, "c1", &AuditSignal::new())
            .unwrap();
        assert_eq!(report.failed, vec![portmap("pm-a").key]);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.result, AuditResult::ConfigChanged);
        assert_eq!(fx.running(&portmap("pm-a").key).unwrap().status, ConfigStatus::Invalid);
    }

    #[test]
    fn disconnect_mid_pass_aborts() {
        let fx = fixture(&["c1"]);
        fx.running_record(portmap("pm-a"));
        fx.driver.set_connected("c1", false);
        let err = AuditEngine::new(fx.ctx.clone())
            .audit(EntityType::PortMap, "c1", &AuditSignal::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::ControllerUnreachable(ref c) if c == "c1"));
        assert_eq!(fx.store.open_cursors(), 0);
    }

    #[test]
    fn cancelled_signal_leaves_records_untouched() {
        let fx = fixture(&["c1"]);
        fx.running_record(portmap("pm-a"));
        let signal = AuditSignal::new();
        signal.cancel();
        let report = AuditEngine::new(fx.ctx.clone())
            .audit(EntityType::PortMap, "c1", &signal)
            .unwrap();
        assert!(report.cancelled);
        assert!(fx.driver.sent().is_empty());
    }

    #[test]
    fn held_records_are_refreshed_to_applied() {
        let fx = fixture(&["c1"]);
        let mut pending = portmap("pm-a");
        status::mark_not_applied(&mut pending);
        fx.running_record(pending.clone());
        fx.store
            .write(Partition::Audit, WriteOp::Upsert, portmap("pm-a"))
            .unwrap();

        let report = AuditEngine::new(fx.ctx.clone())
            .audit(EntityType::PortMap, "c1", &AuditSignal::new())
            .unwrap();
        assert_eq!(report.result, AuditResult::ConfigStatusChanged);
        assert_eq!(report.refreshed, 1);
        assert!(fx.driver.sent().is_empty());
        assert_eq!(fx.running(&pending.key).unwrap().status, ConfigStatus::Applied);
    }

    #[test]
    fn cancellation_mid_pass_keeps_earlier_repairs() {
        let fx = fixture(&["c1"]);
        fx.running_record(portmap("pm-a"));
        fx.running_record(portmap("pm-b"));
        let signal = AuditSignal::new();
        let driver = Arc::new(CancellingDriver {
            inner: fx.driver.clone(),
            signal: signal.clone(),
        });
        let coordinator = TransactionCoordinator::new(EngineContext {
            driver,
            ..fx.ctx.clone()
        });

        let summary = coordinator.audit_controller("c1", &signal).unwrap();
        assert!(summary.cancelled);
        let held: Vec<_> = fx.driver.config("c1").into_iter().map(|r| r.key).collect();
        assert_eq!(held, vec![portmap("pm-a").key]);
        assert_eq!(fx.driver.sent().len(), 1);
        assert!(fx.store.is_empty(Partition::Audit));
        assert_eq!(fx.running(&portmap("pm-a").key).unwrap().status, ConfigStatus::Applied);

        let resumed = TransactionCoordinator::new(fx.ctx.clone())
            .audit_controller("c1", &AuditSignal::new())
            .unwrap();
        assert!(!resumed.cancelled);
        assert_eq!(resumed.result, AuditResult::ConfigChanged);
        assert_eq!(fx.driver.config("c1").len(), 2);
    }
}
