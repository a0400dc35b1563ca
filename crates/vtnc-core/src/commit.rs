//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use tracing::{debug, warn};
use vtnc_common::DisconnectedPolicy;
use vtnc_driver::{ResultCode, Service};
use vtnc_logging::{log_system_event, vtnc_warn, LogContext, SystemEventOutcome};
use vtnc_store::{
    ConfigRecord, ConfigStore, DiffEntry, KeyClass, Operation, Partition, RecordKey, ScopeFilter,
    WriteOp,
};

use crate::coordinator::EngineContext;
use crate::registry::{EntityType, KeyTypeHandler};
use crate::translate::{translate, RenameTable};
use crate::{status, EngineError, Result};

/// A record the controller rejected, reported against the user-visible entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub controller: String,
    pub code: ResultCode,
    pub message: String,
    /// Key of the record that was actually dispatched.
    pub failed_key: RecordKey,
    /// User-visible record the failure is reported against.
    pub error_record: ConfigRecord,
    /// Controllers that accepted records before the failure.
    pub affected: BTreeSet<String>,
}

/// One change made to RUNNING, kept so a failed transaction can be undone.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub op: Operation,
    /// Record as promoted; for DELETE, the RUNNING record that was removed.
    pub record: ConfigRecord,
    /// RUNNING record replaced by an UPDATE.
    pub prior: Option<ConfigRecord>,
    /// Controller that accepted the record, if it was dispatched.
    pub controller: Option<String>,
}

/// Outcome of one or more commit phases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub affected: BTreeSet<String>,
    pub dispatched: usize,
    /// Records promoted without dispatch.
    pub promoted: usize,
    /// Records promoted as `NOT_APPLIED` because their controller was down.
    pub deferred: usize,
    pub failure: Option<DispatchFailure>,
    /// Every promotion in order, for [`CommitEngine::rollback`].
    pub journal: Vec<Promotion>,
}

impl CommitReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn absorb(&mut self, other: CommitReport) {
        self.affected.extend(other.affected);
        self.dispatched += other.dispatched;
        self.promoted += other.promoted;
        self.deferred += other.deferred;
        self.journal.extend(other.journal);
        if self.failure.is_none() {
            self.failure = other.failure;
        }
    }

    /// Affected controllers, or the failure as an error.
    pub fn into_result(self) -> Result<BTreeSet<String>> {
        match self.failure {
            None => Ok(self.affected),
            Some(mut failure) => {
                failure.affected = self.affected;
                Err(EngineError::Dispatch(Box::new(failure)))
            }
        }
    }
}

/// Promotes CANDIDATE to RUNNING one entity type at a time.
#[derive(Debug, Clone)]
pub struct CommitEngine {
    ctx: EngineContext,
}

impl CommitEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Run CREATE, UPDATE and DELETE for `entity`, stopping at the first failure.
    ///
    /// Every CREATE and UPDATE record is validated before anything is promoted.
    pub fn commit(&self, entity: EntityType, session: u32) -> Result<CommitReport> {
        for op in [Operation::Create, Operation::Update] {
            self.validate_phase(entity, op)?;
        }
        let mut report = CommitReport::default();
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            self.run_phase(entity, op, session, &mut report)?;
            if !report.is_success() {
                break;
            }
        }
        Ok(report)
    }

    /// Check every pending `op` record of `entity` without promoting any.
    ///
    /// Returns the number of records checked. DELETE records are not checked.
    pub fn validate_phase(&self, entity: EntityType, op: Operation) -> Result<usize> {
        if op == Operation::Delete {
            return Ok(0);
        }
        let mut checked = 0;
        for key_type in entity.key_types() {
            let handler = self.ctx.registry.handler(key_type)?.clone();
            let cursor = self.ctx.store.diff(
                Partition::Candidate,
                Partition::Running,
                key_type,
                op,
                &ScopeFilter::all(),
            )?;
            for entry in cursor {
                handler.validate_key(&entry.record.key)?;
                handler.validate_value(&entry.record)?;
                checked += 1;
            }
        }
        Ok(checked)
    }

    /// Validate, then promote every `op` difference of `entity`, primary table first.
    ///
    /// A rejected record ends the phase; it is returned in
    /// [`CommitReport::failure`] and the remaining records are not attempted.
    pub fn commit_phase(&self, entity: EntityType, op: Operation, session: u32) -> Result<CommitReport> {
        self.validate_phase(entity, op)?;
        let mut report = CommitReport::default();
        self.run_phase(entity, op, session, &mut report)?;
        Ok(report)
    }

    /// Promote already validated records into `report`.
    ///
    /// On error `report` still holds the journal of what was promoted.
    pub(crate) fn run_phase(
        &self,
        entity: EntityType,
        op: Operation,
        session: u32,
        report: &mut CommitReport,
    ) -> Result<()> {
        let renames = RenameTable::load(self.ctx.store.as_ref(), Partition::Running)?;
        for key_type in entity.key_types() {
            let handler = self.ctx.registry.handler(key_type)?.clone();
            let cursor = self.ctx.store.diff(
                Partition::Candidate,
                Partition::Running,
                key_type,
                op,
                &ScopeFilter::all(),
            )?;
            debug!(entity = %entity, key_type = %key_type, op = %op, pending = cursor.remaining(), "commit phase");
            for entry in cursor {
                if let Some(failure) = self.promote(handler.as_ref(), entry, &renames, session, report)? {
                    let ctx = LogContext::new()
                        .with_session(session)
                        .with_controller(&failure.controller)
                        .with_key_type(key_type.as_ref());
                    log_system_event(
                        Some(&ctx),
                        "commit_record_failed",
                        &format!("{} {}: {}", op, failure.failed_key, failure.message),
                        SystemEventOutcome::Fault,
                    );
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.record_commit(entity.as_ref(), op.as_ref(), "failed");
                        metrics.record_dispatch_failure(&failure.controller, Service::Commit.as_ref());
                    }
                    report.failure = Some(failure);
                    return Ok(());
                }
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_commit(entity.as_ref(), op.as_ref(), "success");
                }
            }
        }
        Ok(())
    }

    /// Undo `journal` newest first.
    ///
    /// RUNNING gets its prior records back and each controller is sent the
    /// inverse of every request it accepted. Returns the number of inverse
    /// requests the controllers rejected; audit repairs those.
    pub fn rollback(&self, journal: &[Promotion], session: u32) -> Result<usize> {
        let renames = RenameTable::load(self.ctx.store.as_ref(), Partition::Running)?;
        let mut rejected = 0;
        for promotion in journal.iter().rev() {
            let Promotion { op, record, prior, controller } = promotion;
            match (op, prior) {
                (Operation::Update, Some(prior)) => {
                    self.ctx.store.write(Partition::Running, WriteOp::Upsert, prior.clone())?
                }
                (Operation::Delete, _) => {
                    self.ctx.store.write(Partition::Running, WriteOp::Upsert, record.clone())?
                }
                _ => match self.ctx.store.delete(Partition::Running, &record.key) {
                    Err(err) if !err.is_not_found() => return Err(err.into()),
                    _ => {}
                },
            }

            let Some(controller) = controller else {
                continue;
            };
            let handler = self.ctx.registry.handler(record.key.key_type)?;
            let inverse = match (op, prior) {
                (Operation::Create, _) => {
                    translate(handler.as_ref(), &self.ctx.capabilities, &renames, record, None, Operation::Delete)
                        .map(|t| t.request(Service::Commit, Operation::Delete, Some(session)))
                }
                (Operation::Update, Some(prior)) => translate(
                    handler.as_ref(),
                    &self.ctx.capabilities,
                    &renames,
                    prior,
                    Some(record),
                    Operation::Update,
                )
                .map(|t| t.request(Service::Commit, Operation::Update, Some(session))),
                (Operation::Delete, _) => {
                    translate(handler.as_ref(), &self.ctx.capabilities, &renames, record, None, Operation::Create)
                        .map(|t| t.request(Service::Commit, Operation::Create, Some(session)))
                }
                (Operation::Update, None) => None,
            };
            let Some(request) = inverse else {
                continue;
            };
            let response = self.ctx.driver.send(request);
            if !response.is_success() {
                rejected += 1;
                warn!(controller = %controller, key = %record.key, op = %op, code = %response.code, "inverse request rejected");
            }
        }
        debug!(undone = journal.len(), rejected, "commit rolled back");
        Ok(rejected)
    }

    fn promote(
        &self,
        handler: &dyn KeyTypeHandler,
        entry: DiffEntry,
        renames: &RenameTable,
        session: u32,
        report: &mut CommitReport,
    ) -> Result<Option<DispatchFailure>> {
        let DiffEntry { op, mut record, prior } = entry;
        let removed = (op == Operation::Delete).then(|| record.clone());

        let dispatchable = matches!(record.key.key_type.class(), KeyClass::Primary | KeyClass::Derived);
        let controller = match record.controller.clone() {
            Some(controller) if dispatchable && record.domain.is_some() => controller,
            _ => {
                status::mark_local(&mut record);
                self.settle_running(op, &record)?;
                report.journal.push(Promotion { op, record: removed.unwrap_or(record), prior, controller: None });
                report.promoted += 1;
                return Ok(None);
            }
        };

        if !self.ctx.driver.is_connected(&controller) {
            match self.ctx.config.commit.disconnected_policy {
                DisconnectedPolicy::MarkNotApplied => {
                    vtnc_warn!(
                        context = LogContext::new().with_controller(&controller).with_session(session),
                        "{} deferred, controller not connected",
                        record.key
                    );
                    status::mark_not_applied(&mut record);
                    self.settle_running(op, &record)?;
                    report.journal.push(Promotion { op, record: removed.unwrap_or(record), prior, controller: None });
                    report.deferred += 1;
                    return Ok(None);
                }
                DisconnectedPolicy::Fail => {
                    return Ok(Some(self.failure(
                        handler,
                        &record,
                        controller,
                        ResultCode::Unreachable,
                        "controller is not connected".to_owned(),
                    )?));
                }
            }
        }

        let Some(translated) = translate(
            handler,
            &self.ctx.capabilities,
            renames,
            &record,
            prior.as_ref(),
            op,
        ) else {
            return Err(EngineError::validation(&record.key, "record has no controller"));
        };
        let response = self
            .ctx
            .driver
            .send(translated.request(Service::Commit, op, Some(session)));
        if !response.is_success() {
            let message = response.message.unwrap_or_else(|| response.code.to_string());
            return Ok(Some(self.failure(handler, &record, controller, response.code, message)?));
        }

        debug!(controller = %controller, key = %record.key, op = %op, "record dispatched");
        status::mark_dispatched(&mut record, &translated, prior.as_ref());
        self.settle_running(op, &record)?;
        report.journal.push(Promotion {
            op,
            record: removed.unwrap_or(record),
            prior,
            controller: Some(controller.clone()),
        });
        report.affected.insert(controller);
        report.dispatched += 1;
        Ok(None)
    }

    fn settle_running(&self, op: Operation, record: &ConfigRecord) -> Result<()> {
        match op {
            Operation::Delete => match self.ctx.store.delete(Partition::Running, &record.key) {
                Err(err) if err.is_not_found() => {
                    warn!(key = %record.key, "record already absent from running");
                    Ok(())
                }
                other => Ok(other?),
            },
            Operation::Create | Operation::Update => {
                Ok(self.ctx.store.write(Partition::Running, WriteOp::Upsert, record.clone())?)
            }
        }
    }

    fn failure(
        &self,
        handler: &dyn KeyTypeHandler,
        record: &ConfigRecord,
        controller: String,
        code: ResultCode,
        message: String,
    ) -> Result<DispatchFailure> {
        let visible = handler.user_visible_key(record);
        let error_record = if visible == record.key {
            record.clone()
        } else {
            match self.ctx.store.read(Partition::Candidate, &visible)? {
                Some(found) => found,
                None => self
                    .ctx
                    .store
                    .read(Partition::Running, &visible)?
                    .unwrap_or_else(|| ConfigRecord::new(visible)),
            }
        };
        Ok(DispatchFailure {
            controller,
            code,
            message,
            failed_key: record.key.clone(),
            error_record,
            affected: BTreeSet::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::fixture;
    use vtnc_driver::FailureRule;
    use vtnc_store::{ConfigStatus, KeyType};

    fn portmap(name: &str, controller: &str) -> ConfigRecord {
        ConfigRecord::new(RecordKey::new(KeyType::PortMap, ["v1", "br", name]))
            .with_location(controller, "d1")
            .with_attr("logical_port", format!("PP-{name}"))
            .with_attr("label", 100)
    }

    #[test]
    fn second_failure_stops_the_phase() {
        let fx = fixture(&["c1", "c2", "c3"]);
        for (name, controller) in [("pm-a", "c1"), ("pm-b", "c2"), ("pm-c", "c3")] {
            fx.candidate(portmap(name, controller));
        }
        fx.driver.fail_on(FailureRule::Nth(2));

        let engine = CommitEngine::new(fx.ctx.clone());
        let report = engine.commit_phase(EntityType::PortMap, Operation::Create, 7).unwrap();
        assert_eq!(report.affected, BTreeSet::from(["c1".to_owned()]));
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.error_record.key.name(), "pm-b");
        assert_eq!(failure.code, ResultCode::Failed);
        assert_eq!(fx.driver.sent().len(), 2);
        assert!(fx.running(&portmap("pm-c", "c3").key).is_none());
        assert_eq!(fx.store.open_cursors(), 0);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.error_record().map(|r| r.key.name()), Some("pm-b"));
    }

    #[test]
    fn committing_twice_is_a_no_op() {
        let fx = fixture(&["c1"]);
        fx.candidate(ConfigRecord::new(RecordKey::new(KeyType::Vtn, ["v1"])));
        fx.candidate(portmap("pm-a", "c1"));
        let engine = CommitEngine::new(fx.ctx.clone());
        for entity in [EntityType::Vtn, EntityType::PortMap] {
            assert!(engine.commit(entity, 1).unwrap().is_success());
        }
        let vtn = fx.running(&RecordKey::new(KeyType::Vtn, ["v1"])).unwrap();
        assert_eq!(vtn.status, ConfigStatus::Applied);
        fx.driver.clear_sent();

        let again = engine.commit(EntityType::PortMap, 2).unwrap();
        assert!(again.is_success());
        assert!(again.affected.is_empty());
        assert!(fx.driver.sent().is_empty());
    }

    #[test]
    fn update_sends_delta_and_delete_removes_running() {
        let fx = fixture(&["c1"]);
        fx.candidate(portmap("pm-a", "c1"));
        let engine = CommitEngine::new(fx.ctx.clone());
        engine.commit(EntityType::PortMap, 1).unwrap();

        fx.candidate(portmap("pm-a", "c1").with_attr("label", 200));
        fx.driver.clear_sent();
        let report = engine.commit(EntityType::PortMap, 2).unwrap();
        assert_eq!(report.dispatched, 1);
        let sent = fx.driver.sent();
        assert_eq!(sent[0].op, Operation::Update);
        assert_eq!(sent[0].attrs.len(), 1);
        assert_eq!(sent[0].attrs["label"], serde_json::json!(200));

        fx.store
            .delete(Partition::Candidate, &portmap("pm-a", "c1").key)
            .unwrap();
        engine.commit(EntityType::PortMap, 3).unwrap();
        assert!(fx.running(&portmap("pm-a", "c1").key).is_none());
        assert!(fx.driver.config("c1").is_empty());
    }

    #[test]
    fn disconnected_controller_follows_policy() {
        let fx = fixture(&["c1"]);
        fx.driver.set_connected("c1", false);
        fx.candidate(portmap("pm-a", "c1"));
        let engine = CommitEngine::new(fx.ctx.clone());
        let report = engine.commit(EntityType::PortMap, 1).unwrap();
        assert!(report.is_success());
        assert!(report.affected.is_empty());
        assert_eq!(report.deferred, 1);
        let running = fx.running(&portmap("pm-a", "c1").key).unwrap();
        assert_eq!(running.status, ConfigStatus::NotApplied);

        let strict = fixture_with_policy(DisconnectedPolicy::Fail);
        strict.driver.set_connected("c1", false);
        strict.candidate(portmap("pm-a", "c1"));
        let report = CommitEngine::new(strict.ctx.clone())
            .commit(EntityType::PortMap, 1)
            .unwrap();
        assert_eq!(report.failure.unwrap().code, ResultCode::Unreachable);
    }

    #[test]
    fn derived_failure_is_reported_against_the_bridge() {
        let fx = fixture(&["c1"]);
        let bridge = ConfigRecord::new(RecordKey::new(KeyType::Vbridge, ["v1", "br"]))
            .with_attr("description", "edge");
        fx.candidate(bridge.clone());
        let leaf = ConfigRecord::new(RecordKey::new(KeyType::LeafBridge, ["v1", "br", "leaf-000001"]))
            .with_location("c1", "d1")
            .with_attr("label", 5);
        fx.candidate(leaf.clone());
        fx.driver.fail_on(FailureRule::Key(leaf.key.clone()));

        let report = CommitEngine::new(fx.ctx.clone())
            .commit_phase(EntityType::Vbridge, Operation::Create, 1)
            .unwrap();
        assert_eq!(report.promoted, 1);
        let failure = report.failure.unwrap();
        assert_eq!(failure.failed_key, leaf.key);
        assert_eq!(failure.error_record.key, bridge.key);
        assert_eq!(failure.error_record.attr_str("description"), Some("edge"));
    }

    #[test]
    fn metrics_count_promotions_and_failures() {
        let fx = fixture(&["c1"]);
        let metrics = crate::EngineMetrics::new(std::sync::Arc::new(prometheus::Registry::new())).unwrap();
        let engine = CommitEngine::new(fx.ctx.clone().with_metrics(metrics.clone()));
        fx.candidate(portmap("pm-a", "c1"));
        fx.candidate(portmap("pm-b", "c1"));
        fx.driver.fail_on(FailureRule::Key(portmap("pm-b", "c1").key));

        let report = engine.commit(EntityType::PortMap, 1).unwrap();
        assert!(!report.is_success());
        assert_eq!(metrics.commit_count("port_map", "create", "success"), 1);
        assert_eq!(metrics.commit_count("port_map", "create", "failed"), 1);
        assert_eq!(metrics.dispatch_failure_count("c1", "commit"), 1);
    }

    fn fixture_with_policy(policy: DisconnectedPolicy) -> crate::coordinator::tests::Fixture {
        let mut config = vtnc_common::AppConfig::default();
        config.commit.disconnected_policy = policy;
        crate::coordinator::tests::fixture_with(config, &["c1"])
    }
}
