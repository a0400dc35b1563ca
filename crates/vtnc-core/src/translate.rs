//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Stored representation to controller-facing representation, and back.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use serde_json::Value;
use vtnc_driver::{DomainTag, DriverRequest, Service};
use vtnc_store::{
    Attribute, ConfigRecord, ConfigStore, KeyType, Operation, Partition, RecordKey, ScopeFilter,
    Validity,
};

use crate::import::ATTR_CONTROLLER_VTN;
use crate::registry::{Capabilities, KeyTypeHandler};
use crate::Result;

/// Import-time VTN renames, per `(controller, domain)`.
#[derive(Debug, Clone, Default)]
pub struct RenameTable {
    to_controller: HashMap<(String, String, String), String>,
    to_unified: HashMap<(String, String, String), String>,
}

impl RenameTable {
    pub fn load(store: &dyn ConfigStore, partition: Partition) -> Result<Self> {
        let records = store.read_all(partition, KeyType::Rename, &ScopeFilter::all())?;
        Ok(Self::from_records(&records))
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ConfigRecord>) -> Self {
        let mut table = Self::default();
        for record in records {
            let (Some(controller), Some(domain), Some(unified)) =
                (record.key.part(0), record.key.part(1), record.key.part(2))
            else {
                continue;
            };
            let Some(original) = record.attr_str(ATTR_CONTROLLER_VTN) else {
                continue;
            };
            table.insert(controller, domain, original, unified);
        }
        table
    }

    pub fn insert(&mut self, controller: &str, domain: &str, controller_vtn: &str, unified_vtn: &str) {
        self.to_controller.insert(
            (controller.to_owned(), domain.to_owned(), unified_vtn.to_owned()),
            controller_vtn.to_owned(),
        );
        self.to_unified.insert(
            (controller.to_owned(), domain.to_owned(), controller_vtn.to_owned()),
            unified_vtn.to_owned(),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.to_controller.is_empty()
    }

    /// Key as the controller knows it.
    pub fn to_controller_key(&self, key: &RecordKey, controller: &str, domain: &str) -> RecordKey {
        Self::substitute(&self.to_controller, key, controller, domain)
    }

    /// Key as the coordinator knows it.
    pub fn to_unified_key(&self, key: &RecordKey, controller: &str, domain: &str) -> RecordKey {
        Self::substitute(&self.to_unified, key, controller, domain)
    }

    fn substitute(
        map: &HashMap<(String, String, String), String>,
        key: &RecordKey,
        controller: &str,
        domain: &str,
    ) -> RecordKey {
        let Some(vtn) = key.vtn() else {
            return key.clone();
        };
        match map.get(&(controller.to_owned(), domain.to_owned(), vtn.to_owned())) {
            Some(renamed) => {
                let mut key = key.clone();
                key.parts[0] = renamed.clone();
                key
            }
            None => key.clone(),
        }
    }
}

/// A record in controller-facing shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub controller: String,
    pub domain: DomainTag,
    /// Key under controller-local naming.
    pub key: RecordKey,
    /// Attributes to send; `Null` clears the value on the controller.
    pub attrs: IndexMap<String, Value>,
    /// Attributes suppressed because they match the prior value.
    pub unchanged: BTreeSet<String>,
    /// Attributes the controller cannot carry.
    pub unsupported: BTreeSet<String>,
}

impl Translated {
    pub fn request(&self, service: Service, op: Operation, session: Option<u32>) -> DriverRequest {
        DriverRequest {
            controller: self.controller.clone(),
            domain: self.domain.clone(),
            service,
            op,
            key: self.key.clone(),
            attrs: self.attrs.clone(),
            session,
        }
    }
}

fn visible(handler: &dyn KeyTypeHandler, caps: &Capabilities, controller: &str, name: &str) -> bool {
    !handler.hidden_attributes().contains(&name) && caps.supports(controller, handler.key_type(), name)
}

/// Controller view of `record`; `None` when the record has no owning controller.
///
/// For updates `prior` is the value the controller is assumed to hold.
pub fn translate(
    handler: &dyn KeyTypeHandler,
    caps: &Capabilities,
    renames: &RenameTable,
    record: &ConfigRecord,
    prior: Option<&ConfigRecord>,
    op: Operation,
) -> Option<Translated> {
    let (controller, domain) = record.location()?;
    let mut translated = Translated {
        controller: controller.to_owned(),
        domain: DomainTag::new(handler.domain_kind(), domain),
        key: renames.to_controller_key(&record.key, controller, domain),
        attrs: IndexMap::new(),
        unchanged: BTreeSet::new(),
        unsupported: BTreeSet::new(),
    };
    if op == Operation::Delete {
        return Some(translated);
    }

    let prior = prior.filter(|_| op == Operation::Update);
    for (name, attr) in &record.attrs {
        if handler.hidden_attributes().contains(&name.as_str()) {
            continue;
        }
        if !caps.supports(controller, handler.key_type(), name) {
            translated.unsupported.insert(name.clone());
            continue;
        }
        let before = prior.and_then(|prior| prior.attrs.get(name));
        match attr.valid {
            Validity::Valid => {
                let same = before
                    .map_or(false, |b| b.valid == Validity::Valid && b.value == attr.value);
                if same {
                    translated.unchanged.insert(name.clone());
                } else {
                    translated.attrs.insert(name.clone(), attr.value.clone());
                }
            }
            Validity::ValidNoValue => {
                let already_clear = prior.is_some()
                    && before.map_or(true, |b| b.valid != Validity::Valid);
                if already_clear {
                    translated.unchanged.insert(name.clone());
                } else {
                    translated.attrs.insert(name.clone(), Value::Null);
                }
            }
            _ => {}
        }
    }

    if let Some(prior) = prior {
        for (name, attr) in &prior.attrs {
            if attr.valid == Validity::Valid
                && !record.attrs.contains_key(name)
                && visible(handler, caps, controller, name)
            {
                translated.attrs.insert(name.clone(), Value::Null);
            }
        }
    }
    Some(translated)
}

/// Rebuild a record fetched from `controller` so it compares against RUNNING.
///
/// The key must already be in unified naming. Provenance flags and every
/// attribute the controller never receives are carried over from `running`.
pub fn rehydrate(
    handler: &dyn KeyTypeHandler,
    caps: &Capabilities,
    controller: &str,
    fetched: ConfigRecord,
    running: Option<&ConfigRecord>,
) -> ConfigRecord {
    let domain = fetched
        .domain
        .clone()
        .or_else(|| running.and_then(|r| r.domain.clone()));
    let mut record = ConfigRecord::new(fetched.key);
    record.controller = Some(controller.to_owned());
    record.domain = domain;
    for (name, attr) in fetched.attrs {
        record.attrs.insert(name, Attribute::valid(attr.value));
    }
    if let Some(running) = running {
        record.flags = running.flags;
        for (name, attr) in &running.attrs {
            let kept_locally =
                attr.valid != Validity::Valid || !visible(handler, caps, controller, name);
            if kept_locally && !record.attrs.contains_key(name) {
                let mut attr = attr.clone();
                attr.status = Default::default();
                record.attrs.insert(name.clone(), attr);
            }
        }
    }
    record
}
