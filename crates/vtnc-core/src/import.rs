//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Merge of configuration discovered on a controller into CANDIDATE.

use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::debug;
use vtnc_logging::{log_system_event, LogContext, SystemEventOutcome};
use vtnc_store::{
    ConfigRecord, ConfigStore, KeyClass, KeyType, Partition, RecordFlags, RecordKey, ScopeFilter,
    Validity, WriteOp,
};

use crate::coordinator::EngineContext;
use crate::translate::RenameTable;
use crate::{EngineError, Result};

/// Name a renamed VTN carries on its controller.
pub const ATTR_CONTROLLER_VTN: &str = "controller_vtn";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub created: usize,
    /// Records already present with the same values.
    pub skipped: usize,
    /// Records whose VTN name was substituted.
    pub renamed: usize,
}

/// Stages a controller's configuration in IMPORT and merges it into CANDIDATE.
#[derive(Debug, Clone)]
pub struct ImportEngine {
    ctx: EngineContext,
}

impl ImportEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Replace the controller's IMPORT records with what it currently holds.
    pub fn pull(&self, controller: &str) -> Result<usize> {
        let fetched = self.ctx.driver.fetch_running(controller)?;
        self.clear(controller)?;
        let mut staged = 0;
        for mut record in fetched {
            if !record.key.key_type.is_vtn_scoped() {
                continue;
            }
            record.controller = Some(controller.to_owned());
            self.ctx.store.write(Partition::Import, WriteOp::Upsert, record)?;
            staged += 1;
        }
        debug!(controller, staged, "controller configuration staged for import");
        Ok(staged)
    }

    /// Import the controller's `controller_vtn` under the name `unified_vtn`.
    pub fn rename(&self, controller: &str, domain: &str, controller_vtn: &str, unified_vtn: &str) -> Result<()> {
        let key = RecordKey::new(KeyType::Rename, [controller, domain, unified_vtn]);
        if !key.is_well_formed() || controller_vtn.is_empty() {
            return Err(EngineError::validation(&key, "rename needs non-empty names"));
        }
        let existing = self.ctx.store.read_all(
            Partition::Import,
            KeyType::Rename,
            &ScopeFilter::prefix([controller, domain]),
        )?;
        if let Some(clash) = existing.iter().find(|record| {
            record.attr_str(ATTR_CONTROLLER_VTN) == Some(controller_vtn) && record.key != key
        }) {
            return Err(EngineError::validation(
                &key,
                format!("{controller_vtn} is already imported as {}", clash.key.name()),
            ));
        }
        let record = ConfigRecord::new(key)
            .with_location(controller, domain)
            .with_attr(ATTR_CONTROLLER_VTN, controller_vtn)
            .with_flags(RecordFlags::USER_CONFIGURED);
        self.ctx.store.write(Partition::Import, WriteOp::Upsert, record)?;
        Ok(())
    }

    /// Merge the controller's IMPORT records into CANDIDATE.
    ///
    /// Every record is checked before anything is written; the first record
    /// that disagrees with CANDIDATE is returned in [`EngineError::MergeConflict`].
    pub fn merge(&self, controller: &str) -> Result<MergeReport> {
        let renames = self.ctx.store.read_all(
            Partition::Import,
            KeyType::Rename,
            &ScopeFilter::prefix([controller]),
        )?;
        let table = RenameTable::from_records(&renames);
        let mut report = MergeReport::default();
        let mut planned = Vec::new();

        for key_type in KeyType::iter().filter(|kt| kt.class() == KeyClass::Primary) {
            let filter = ScopeFilter::all().with_controller(controller);
            for mut record in self.ctx.store.read_all(Partition::Import, key_type, &filter)? {
                let domain = record.domain.clone().unwrap_or_default();
                let unified = table.to_unified_key(&record.key, controller, &domain);
                if unified != record.key {
                    record.key = unified;
                    record.flags |= RecordFlags::VTN_RENAMED;
                    report.renamed += 1;
                }
                match self.ctx.store.read(Partition::Candidate, &record.key)? {
                    None => planned.push(record),
                    Some(existing) if values_agree(&existing, &record) => report.skipped += 1,
                    Some(_) => {
                        log_system_event(
                            Some(&LogContext::new().with_controller(controller)),
                            "import_conflict",
                            &format!("{} differs from candidate", record.key),
                            SystemEventOutcome::Fault,
                        );
                        return Err(EngineError::MergeConflict {
                            record: Box::new(record),
                        });
                    }
                }
            }
        }

        for rename in renames {
            self.ctx.store.write(Partition::Candidate, WriteOp::Upsert, rename)?;
        }
        for record in planned {
            self.ctx.store.write(Partition::Candidate, WriteOp::Create, record)?;
            report.created += 1;
        }
        log_system_event(
            Some(&LogContext::new().with_controller(controller)),
            "import_merged",
            &format!(
                "{} created, {} skipped, {} renamed",
                report.created, report.skipped, report.renamed
            ),
            SystemEventOutcome::Success,
        );
        Ok(report)
    }

    /// Drop everything staged for the controller.
    pub fn clear(&self, controller: &str) -> Result<usize> {
        let filter = ScopeFilter::all().with_controller(controller);
        let mut removed = 0;
        for key_type in KeyType::iter() {
            removed += self.ctx.store.clear(Partition::Import, key_type, &filter)?;
        }
        Ok(removed)
    }
}

/// Attributes both records carry have the same value.
fn values_agree(existing: &ConfigRecord, imported: &ConfigRecord) -> bool {
    imported
        .attrs
        .iter()
        .filter(|(_, attr)| attr.valid == Validity::Valid)
        .all(|(name, attr)| match existing.attrs.get(name) {
            Some(ours) if ours.valid == Validity::Valid => ours.value == attr.value,
            _ => true,
        })
}
