//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Config-status bookkeeping applied when a record reaches RUNNING.
//!
//! Cleared (`ValidNoValue`) attributes are sent as clears and are treated as valid here.
//!
//! | outcome | valid attributes | row |
//! |---|---|---|
//! | dispatched | `APPLIED`, or `NOT_SUPPORTED` for unsupported ones; unchanged ones keep their prior status | aggregate |
//! | no owning controller | `APPLIED` | `APPLIED` |
//! | controller disconnected | `NOT_APPLIED` | `NOT_APPLIED` |
//! | audit dispatch failed | `INVALID` | `INVALID` |

use vtnc_store::{ConfigRecord, ConfigStatus};

use crate::translate::Translated;

pub fn mark_dispatched(record: &mut ConfigRecord, translated: &Translated, prior: Option<&ConfigRecord>) {
    for (name, attr) in record.attrs.iter_mut() {
        attr.status = if attr.valid.carries_status() {
            if translated.unsupported.contains(name) {
                ConfigStatus::NotSupported
            } else if translated.unchanged.contains(name) {
                prior
                    .and_then(|prior| prior.attrs.get(name))
                    .map_or(ConfigStatus::Applied, |before| before.status)
            } else {
                ConfigStatus::Applied
            }
        } else {
            ConfigStatus::Invalid
        };
    }
    record.status = ConfigStatus::Applied;
    record.status = record.aggregate_status();
}

pub fn mark_local(record: &mut ConfigRecord) {
    record.mark_all(ConfigStatus::Applied);
}

pub fn mark_not_applied(record: &mut ConfigRecord) {
    record.mark_all(ConfigStatus::NotApplied);
}

pub fn mark_invalid(record: &mut ConfigRecord) {
    record.mark_all(ConfigStatus::Invalid);
}
