//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Versioned configuration store and storage bindings."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fmt;

use bitflags::bitflags;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Named snapshot of the configuration schema.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Partition {
    /// User-writable working copy.
    Candidate,
    /// Last successfully committed state.
    Running,
    /// State restored on boot.
    Startup,
    /// Controller-asserted truth pulled during reconciliation.
    Audit,
    /// Externally discovered state awaiting merge.
    Import,
    /// Operational state.
    State,
}

/// Diff and dispatch operation kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Present in the source partition only.
    Create,
    /// Present in both partitions with differing configuration.
    Update,
    /// Present in the destination partition only.
    Delete,
}

/// How a key type participates in commit and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// User-visible configuration dispatched to controllers.
    Primary,
    /// Internally converted topology dispatched as leaf wiring.
    Derived,
    /// Configuration promoted to RUNNING without controller dispatch.
    Local,
    /// Counters owned by the label allocator and settled, never diffed.
    AllocatorOwned,
}

/// Table identity of a record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeyType {
    /// `[vtn]`
    Vtn,
    /// Unified bridge, `[vtn, vbr]`.
    Vbridge,
    /// Port-map intent, `[vtn, vbr, portmap]`.
    PortMap,
    /// `[vtn, vtunnel]`
    Vtunnel,
    /// `[vtn, vlink]`
    Vlink,
    /// Per-(controller, domain) bridge, `[vtn, vbr, leaf]`.
    LeafBridge,
    /// `[vtn, vbr, leaf, if]`
    LeafInterface,
    /// Shared cross-domain tunnel endpoint, `[vtn, hub]`.
    TunnelHub,
    /// `[vtn, hub, if]`
    TunnelInterface,
    /// `[vtn, link]`
    Link,
    /// `[spine]`
    SpineDomain,
    /// Capacity override for a pool scope, `[scope]`.
    PoolLimit,
    /// Label currently handed out from a pool, `[scope, label]`.
    LabelUsage,
    /// Monotonic name counter, `[prefix]`.
    NameSequence,
    /// Import-time rename, `[controller, domain, unified_vtn]`.
    Rename,
    /// Pool counter, `[scope]`.
    LabelPool,
}

impl KeyType {
    /// Number of key components a well-formed key carries.
    pub fn arity(&self) -> usize {
        match self {
            KeyType::Vtn
            | KeyType::SpineDomain
            | KeyType::PoolLimit
            | KeyType::NameSequence
            | KeyType::LabelPool => 1,
            KeyType::Vbridge
            | KeyType::Vtunnel
            | KeyType::Vlink
            | KeyType::TunnelHub
            | KeyType::Link
            | KeyType::LabelUsage => 2,
            KeyType::PortMap
            | KeyType::LeafBridge
            | KeyType::TunnelInterface
            | KeyType::Rename => 3,
            KeyType::LeafInterface => 4,
        }
    }

    pub fn class(&self) -> KeyClass {
        match self {
            KeyType::Vtn
            | KeyType::Vbridge
            | KeyType::PortMap
            | KeyType::Vtunnel
            | KeyType::Vlink => KeyClass::Primary,
            KeyType::LeafBridge
            | KeyType::LeafInterface
            | KeyType::TunnelHub
            | KeyType::TunnelInterface
            | KeyType::Link => KeyClass::Derived,
            KeyType::SpineDomain
            | KeyType::PoolLimit
            | KeyType::LabelUsage
            | KeyType::NameSequence
            | KeyType::Rename => KeyClass::Local,
            KeyType::LabelPool => KeyClass::AllocatorOwned,
        }
    }

    /// Key type whose key is a prefix of this one.
    pub fn parent(&self) -> Option<KeyType> {
        match self {
            KeyType::Vbridge | KeyType::Vtunnel | KeyType::Vlink => Some(KeyType::Vtn),
            KeyType::TunnelHub | KeyType::Link => Some(KeyType::Vtn),
            KeyType::PortMap | KeyType::LeafBridge => Some(KeyType::Vbridge),
            KeyType::LeafInterface => Some(KeyType::LeafBridge),
            KeyType::TunnelInterface => Some(KeyType::TunnelHub),
            _ => None,
        }
    }

    /// Whether the first key component names the owning VTN.
    pub fn is_vtn_scoped(&self) -> bool {
        matches!(self.class(), KeyClass::Primary | KeyClass::Derived)
    }
}

/// Fully qualified record identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub key_type: KeyType,
    pub parts: Vec<String>,
}

impl RecordKey {
    pub fn new<I, S>(key_type: KeyType, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_type,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.parts.len() == self.key_type.arity()
            && self.parts.iter().all(|part| !part.is_empty())
    }

    pub fn part(&self, index: usize) -> Option<&str> {
        self.parts.get(index).map(String::as_str)
    }

    /// Last key component, the record's own name.
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or("")
    }

    /// Owning VTN for VTN-scoped key types.
    pub fn vtn(&self) -> Option<&str> {
        if self.key_type.is_vtn_scoped() {
            self.part(0)
        } else {
            None
        }
    }

    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.parts.len() >= prefix.len() && self.parts[..prefix.len()] == *prefix
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.key_type, self.parts.join("/"))
    }
}

/// Per-attribute validity flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    Invalid,
    Valid,
    /// Explicitly cleared by the user.
    ValidNoValue,
    NotSupported,
    /// Unchanged relative to RUNNING; used in update deltas.
    ValueNotModified,
}

impl Validity {
    /// Whether the attribute is sent to controllers and so carries a config status.
    pub fn carries_status(self) -> bool {
        matches!(self, Validity::Valid | Validity::ValidNoValue)
    }
}

/// Whether configured values reached their owning controller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfigStatus {
    #[default]
    Invalid,
    Applied,
    NotApplied,
    PartiallyApplied,
    NotSupported,
}

impl ConfigStatus {
    /// Combine the status of two controllers hosting the same record.
    pub fn merge(self, other: ConfigStatus) -> ConfigStatus {
        use ConfigStatus::*;
        match (self, other) {
            (a, b) if a == b => a,
            (NotSupported, other) | (other, NotSupported) => other,
            (Invalid, other) | (other, Invalid) => other,
            _ => PartiallyApplied,
        }
    }
}

/// Single attribute of a record value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: Value,
    #[serde(default)]
    pub valid: Validity,
    #[serde(default)]
    pub status: ConfigStatus,
}

impl Attribute {
    pub fn valid(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            valid: Validity::Valid,
            status: ConfigStatus::Invalid,
        }
    }

    fn same_config(&self, other: &Attribute) -> bool {
        self.valid == other.valid && self.value == other.value
    }
}

bitflags! {
    /// Provenance markers carried by every record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RecordFlags: u8 {
        /// Created directly by an operator.
        const USER_CONFIGURED = 0b0001;
        /// Internally derived from user intents.
        const BOUNDARY = 0b0010;
        /// Owning VTN name was substituted during import.
        const VTN_RENAMED = 0b0100;
        /// Owning bridge name was substituted during import.
        const VBR_RENAMED = 0b1000;
    }
}

/// A record held by one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub key: RecordKey,
    #[serde(default)]
    pub attrs: IndexMap<String, Attribute>,
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub flags: RecordFlags,
    /// Row-level config status.
    #[serde(default)]
    pub status: ConfigStatus,
}

impl ConfigRecord {
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            attrs: IndexMap::new(),
            controller: None,
            domain: None,
            flags: RecordFlags::empty(),
            status: ConfigStatus::Invalid,
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_location(mut self, controller: impl Into<String>, domain: impl Into<String>) -> Self {
        self.controller = Some(controller.into());
        self.domain = Some(domain.into());
        self
    }

    pub fn with_flags(mut self, flags: RecordFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set a valid attribute value, keeping its status when the value is unchanged.
    pub fn set_attr(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.attrs.get_mut(name) {
            Some(attr) if attr.valid == Validity::Valid && attr.value == value => {}
            Some(attr) => {
                attr.value = value;
                attr.valid = Validity::Valid;
                attr.status = ConfigStatus::Invalid;
            }
            None => {
                self.attrs.insert(name.to_owned(), Attribute::valid(value));
            }
        }
    }

    /// Value of a valid attribute.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs
            .get(name)
            .filter(|attr| attr.valid == Validity::Valid)
            .map(|attr| &attr.value)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(Value::as_str)
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name).and_then(Value::as_u64)
    }

    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(Value::as_i64)
    }

    /// Owning (controller, domain) pair, when the record lives on a controller.
    pub fn location(&self) -> Option<(&str, &str)> {
        match (&self.controller, &self.domain) {
            (Some(controller), Some(domain)) => Some((controller.as_str(), domain.as_str())),
            _ => None,
        }
    }

    pub fn is_owned_by(&self, controller: &str) -> bool {
        self.controller.as_deref() == Some(controller)
    }

    /// Configuration equality, ignoring config status.
    pub fn same_config(&self, other: &ConfigRecord) -> bool {
        self.key == other.key
            && self.controller == other.controller
            && self.domain == other.domain
            && self.flags == other.flags
            && self.attrs.len() == other.attrs.len()
            && self.attrs.iter().all(|(name, attr)| {
                other
                    .attrs
                    .get(name)
                    .map_or(false, |theirs| attr.same_config(theirs))
            })
    }

    /// Set the row status and the status of every valid attribute.
    pub fn mark_all(&mut self, status: ConfigStatus) {
        self.status = status;
        for attr in self.attrs.values_mut() {
            if attr.valid.carries_status() {
                attr.status = status;
            }
        }
    }

    /// Row status derived from the attribute statuses.
    pub fn aggregate_status(&self) -> ConfigStatus {
        self.attrs
            .values()
            .filter(|attr| attr.valid.carries_status())
            .map(|attr| attr.status)
            .filter(|status| *status != ConfigStatus::NotSupported)
            .reduce(ConfigStatus::merge)
            .unwrap_or(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    #[test]
    fn arity_matches_parent_prefix() {
        for key_type in KeyType::iter() {
            if let Some(parent) = key_type.parent() {
                assert!(parent.arity() < key_type.arity(), "{key_type}");
            }
        }
    }

    #[test]
    fn key_type_names_round_trip_through_strum() {
        assert_eq!(KeyType::LeafInterface.to_string(), "leaf_interface");
        assert_eq!("port_map".parse::<KeyType>().unwrap(), KeyType::PortMap);
        assert_eq!(Partition::Candidate.as_ref(), "candidate");
    }

    #[test]
    fn same_config_ignores_status() {
        let key = RecordKey::new(KeyType::Vtn, ["v1"]);
        let mut a = ConfigRecord::new(key.clone()).with_attr("description", "x");
        let b = a.clone();
        a.mark_all(ConfigStatus::Applied);
        assert!(a.same_config(&b));

        let c = ConfigRecord::new(key).with_attr("description", "y");
        assert!(!a.same_config(&c));
    }

    #[test]
    fn set_attr_resets_status_only_on_change() {
        let key = RecordKey::new(KeyType::Vbridge, ["v1", "b1"]);
        let mut record = ConfigRecord::new(key).with_attr("description", "x");
        record.mark_all(ConfigStatus::Applied);
        record.set_attr("description", "x");
        assert_eq!(record.attrs["description"].status, ConfigStatus::Applied);
        record.set_attr("description", json!("y"));
        assert_eq!(record.attrs["description"].status, ConfigStatus::Invalid);
    }

    #[test]
    fn aggregate_status_reports_partial_application() {
        let key = RecordKey::new(KeyType::Vtn, ["v1"]);
        let mut record = ConfigRecord::new(key)
            .with_attr("description", "x")
            .with_attr("admin_status", "up");
        record.attrs["description"].status = ConfigStatus::Applied;
        record.attrs["admin_status"].status = ConfigStatus::NotApplied;
        assert_eq!(record.aggregate_status(), ConfigStatus::PartiallyApplied);
    }

    #[test]
    fn cleared_attributes_count_toward_the_aggregate() {
        let key = RecordKey::new(KeyType::Vtn, ["v1"]);
        let mut record = ConfigRecord::new(key)
            .with_attr("description", "x")
            .with_attr("admin_status", "up");
        record.attrs["admin_status"].valid = Validity::ValidNoValue;
        record.mark_all(ConfigStatus::Applied);
        assert_eq!(record.attrs["admin_status"].status, ConfigStatus::Applied);
        record.attrs["admin_status"].status = ConfigStatus::NotApplied;
        assert_eq!(record.aggregate_status(), ConfigStatus::PartiallyApplied);
    }

    #[test]
    fn vtn_is_only_reported_for_vtn_scoped_keys() {
        let leaf = RecordKey::new(KeyType::LeafBridge, ["v1", "b1", "leaf-000001"]);
        assert_eq!(leaf.vtn(), Some("v1"));
        assert_eq!(leaf.name(), "leaf-000001");
        let pool = RecordKey::new(KeyType::LabelPool, ["vtn:v1"]);
        assert_eq!(pool.vtn(), None);
    }
}
