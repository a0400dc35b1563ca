//! ---
//! vtnc_section: "06-reconciliation-engines"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Commit, audit and import engines and the transaction coordinator."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Per-key-type behaviour and the registry the engines are built with.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use vtnc_alloc::ATTR_CAPACITY;
use vtnc_common::ControllerConfig;
use vtnc_driver::DomainKind;
use vtnc_store::{ConfigRecord, KeyClass, KeyType, RecordKey};
use vtnc_topology::nodes::{
    ATTR_LABEL, ATTR_LABEL_SCOPE, ATTR_LEAF, ATTR_LOGICAL_PORT, ATTR_ORIGIN_VBR, ATTR_REF_COUNT,
    ATTR_VBR,
};

use crate::{EngineError, Result};

/// Free-text attribute kept by the coordinator only.
pub const ATTR_DESCRIPTION: &str = "description";

/// Capability interface implemented once per key type.
///
/// The engines depend only on this trait; the [`KeyTypeRegistry`] passed in
/// at construction decides which implementation serves which key type.
pub trait KeyTypeHandler: Send + Sync {
    fn key_type(&self) -> KeyType;

    fn validate_key(&self, key: &RecordKey) -> Result<()> {
        if key.key_type != self.key_type() {
            return Err(EngineError::validation(
                key,
                format!("handler for {} cannot validate this key", self.key_type()),
            ));
        }
        if !key.is_well_formed() {
            return Err(EngineError::validation(
                key,
                format!("expected {} non-empty key parts", key.key_type.arity()),
            ));
        }
        Ok(())
    }

    fn validate_value(&self, record: &ConfigRecord) -> Result<()>;

    /// Key of a record of this type named `name` under `parent`.
    fn build_child_key(&self, parent: &RecordKey, name: &str) -> Option<RecordKey> {
        let key_type = self.key_type();
        if key_type.parent() != Some(parent.key_type) || name.is_empty() {
            return None;
        }
        let mut parts = parent.parts.clone();
        parts.push(name.to_owned());
        Some(RecordKey::new(key_type, parts))
    }

    fn build_parent_key(&self, key: &RecordKey) -> Option<RecordKey> {
        let parent = key.key_type.parent()?;
        let parts = key.parts.get(..parent.arity())?;
        Some(RecordKey::new(parent, parts.iter().cloned()))
    }

    /// Attributes never sent to a controller.
    fn hidden_attributes(&self) -> &[&'static str] {
        &[]
    }

    /// Key of the user-visible record an error on `record` is reported against.
    fn user_visible_key(&self, record: &ConfigRecord) -> RecordKey {
        record.key.clone()
    }

    /// Domain kind the driver sees for this key type.
    fn domain_kind(&self) -> DomainKind {
        DomainKind::Default
    }
}

/// Table-driven handler covering the built-in key types.
#[derive(Debug, Clone)]
pub struct StandardHandler {
    key_type: KeyType,
    hidden: &'static [&'static str],
    required: &'static [&'static str],
    needs_location: bool,
}

impl StandardHandler {
    pub fn for_key_type(key_type: KeyType) -> Self {
        let (hidden, required, needs_location): (&'static [&'static str], &'static [&'static str], bool) =
            match key_type {
                KeyType::Vtn | KeyType::Vbridge | KeyType::Vtunnel | KeyType::Vlink => {
                    (&[ATTR_DESCRIPTION], &[], false)
                }
                KeyType::PortMap => (&[ATTR_DESCRIPTION, ATTR_LEAF], &[ATTR_LOGICAL_PORT], true),
                KeyType::LeafBridge => (&[ATTR_REF_COUNT, ATTR_LABEL_SCOPE], &[ATTR_LABEL], true),
                KeyType::TunnelHub => (
                    &[ATTR_REF_COUNT, ATTR_LABEL_SCOPE, ATTR_ORIGIN_VBR],
                    &[ATTR_LABEL],
                    true,
                ),
                KeyType::LeafInterface | KeyType::TunnelInterface | KeyType::Link => {
                    (&[], &[], true)
                }
                KeyType::SpineDomain => (&[], &[], true),
                KeyType::PoolLimit => (&[], &[ATTR_CAPACITY], false),
                KeyType::Rename => (&[], &[crate::ATTR_CONTROLLER_VTN], true),
                KeyType::LabelUsage | KeyType::NameSequence | KeyType::LabelPool => {
                    (&[], &[], false)
                }
            };
        Self {
            key_type,
            hidden,
            required,
            needs_location,
        }
    }
}

impl KeyTypeHandler for StandardHandler {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn validate_value(&self, record: &ConfigRecord) -> Result<()> {
        if self.needs_location && record.location().is_none() {
            return Err(EngineError::validation(&record.key, "record has no controller"));
        }
        if let Some(missing) = self.required.iter().find(|name| record.attr(name).is_none()) {
            return Err(EngineError::validation(
                &record.key,
                format!("attribute {missing} is required"),
            ));
        }
        if self.key_type == KeyType::PoolLimit && record.attr_u64(ATTR_CAPACITY) == Some(0) {
            return Err(EngineError::validation(&record.key, "capacity must be positive"));
        }
        Ok(())
    }

    fn hidden_attributes(&self) -> &[&'static str] {
        self.hidden
    }

    fn user_visible_key(&self, record: &ConfigRecord) -> RecordKey {
        let key = &record.key;
        let vtn = key.part(0).unwrap_or_default();
        let bridge = |vbr: Option<&str>| match vbr {
            Some(vbr) => RecordKey::new(KeyType::Vbridge, [vtn, vbr]),
            None => RecordKey::new(KeyType::Vtn, [vtn]),
        };
        match self.key_type {
            KeyType::LeafBridge | KeyType::LeafInterface => bridge(key.part(1)),
            KeyType::TunnelHub => bridge(record.attr_str(ATTR_ORIGIN_VBR)),
            KeyType::TunnelInterface | KeyType::Link => bridge(record.attr_str(ATTR_VBR)),
            _ => key.clone(),
        }
    }

    fn domain_kind(&self) -> DomainKind {
        match self.key_type {
            KeyType::LeafBridge | KeyType::LeafInterface | KeyType::Link => DomainKind::Leaf,
            KeyType::TunnelHub | KeyType::TunnelInterface => DomainKind::Spine,
            _ => DomainKind::Default,
        }
    }
}

/// Handlers keyed by key type, injected into every engine.
#[derive(Clone, Default)]
pub struct KeyTypeRegistry {
    handlers: HashMap<KeyType, Arc<dyn KeyTypeHandler>>,
}

impl KeyTypeRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with a [`StandardHandler`] for every key type.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for key_type in KeyType::iter() {
            registry.register(Arc::new(StandardHandler::for_key_type(key_type)));
        }
        registry
    }

    /// Install a handler, returning the one it replaces.
    pub fn register(&mut self, handler: Arc<dyn KeyTypeHandler>) -> Option<Arc<dyn KeyTypeHandler>> {
        self.handlers.insert(handler.key_type(), handler)
    }

    pub fn handler(&self, key_type: KeyType) -> Result<&Arc<dyn KeyTypeHandler>> {
        self.handlers
            .get(&key_type)
            .ok_or(EngineError::UnknownKeyType(key_type))
    }
}

impl std::fmt::Debug for KeyTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut key_types: Vec<_> = self.handlers.keys().collect();
        key_types.sort();
        f.debug_struct("KeyTypeRegistry")
            .field("key_types", &key_types)
            .finish()
    }
}

/// Unit of commit and audit: a primary key type with its derived tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Rename,
    SpineDomain,
    PoolLimit,
    LabelUsage,
    NameSequence,
    Vtn,
    Vbridge,
    Vtunnel,
    Vlink,
    PortMap,
}

impl EntityType {
    /// CREATE and UPDATE order; DELETE runs in reverse.
    pub const COMMIT_ORDER: [EntityType; 10] = [
        EntityType::Rename,
        EntityType::SpineDomain,
        EntityType::PoolLimit,
        EntityType::LabelUsage,
        EntityType::NameSequence,
        EntityType::Vtn,
        EntityType::Vbridge,
        EntityType::Vtunnel,
        EntityType::Vlink,
        EntityType::PortMap,
    ];

    pub fn primary(&self) -> KeyType {
        match self {
            EntityType::Rename => KeyType::Rename,
            EntityType::SpineDomain => KeyType::SpineDomain,
            EntityType::PoolLimit => KeyType::PoolLimit,
            EntityType::LabelUsage => KeyType::LabelUsage,
            EntityType::NameSequence => KeyType::NameSequence,
            EntityType::Vtn => KeyType::Vtn,
            EntityType::Vbridge => KeyType::Vbridge,
            EntityType::Vtunnel => KeyType::Vtunnel,
            EntityType::Vlink => KeyType::Vlink,
            EntityType::PortMap => KeyType::PortMap,
        }
    }

    pub fn derived(&self) -> &'static [KeyType] {
        match self {
            EntityType::Vbridge => &[KeyType::LeafBridge, KeyType::LeafInterface],
            EntityType::Vtunnel => &[KeyType::TunnelHub, KeyType::TunnelInterface],
            EntityType::Vlink => &[KeyType::Link],
            _ => &[],
        }
    }

    /// Primary table first, then the derived tables.
    pub fn key_types(&self) -> impl Iterator<Item = KeyType> {
        std::iter::once(self.primary()).chain(self.derived().iter().copied())
    }

    /// Committed without dispatch and never audited.
    pub fn is_local(&self) -> bool {
        self.primary().class() == KeyClass::Local
    }
}

/// Attributes each controller cannot carry, per key type.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    unsupported: HashMap<(String, KeyType), BTreeSet<String>>,
}

impl Capabilities {
    /// Build the table from configuration, rejecting unknown key-type names.
    pub fn from_config(controllers: &IndexMap<String, ControllerConfig>) -> Result<Self> {
        let mut unsupported = HashMap::new();
        for (controller, config) in controllers {
            for (name, attrs) in &config.unsupported_attributes {
                let key_type = KeyType::from_str(name).map_err(|_| {
                    EngineError::Config(format!(
                        "controller '{controller}' lists unsupported attributes for unknown key type '{name}'"
                    ))
                })?;
                unsupported
                    .entry((controller.clone(), key_type))
                    .or_insert_with(BTreeSet::new)
                    .extend(attrs.iter().cloned());
            }
        }
        Ok(Self { unsupported })
    }

    pub fn supports(&self, controller: &str, key_type: KeyType, attr: &str) -> bool {
        self.unsupported
            .get(&(controller.to_owned(), key_type))
            .map_or(true, |attrs| !attrs.contains(attr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtnc_common::ControllerKind;

    fn handler(key_type: KeyType) -> StandardHandler {
        StandardHandler::for_key_type(key_type)
    }

    #[test]
    fn standard_registry_covers_every_key_type() {
        let registry = KeyTypeRegistry::standard();
        for key_type in KeyType::iter() {
            assert_eq!(registry.handler(key_type).unwrap().key_type(), key_type);
        }
        assert!(matches!(
            KeyTypeRegistry::empty().handler(KeyType::Vtn),
            Err(EngineError::UnknownKeyType(KeyType::Vtn))
        ));
    }

    #[test]
    fn child_and_parent_keys_follow_the_key_hierarchy() {
        let bridge = RecordKey::new(KeyType::Vbridge, ["v1", "br"]);
        let leaf = handler(KeyType::LeafBridge)
            .build_child_key(&bridge, "leaf-000001")
            .unwrap();
        assert_eq!(leaf, RecordKey::new(KeyType::LeafBridge, ["v1", "br", "leaf-000001"]));
        assert!(handler(KeyType::LeafInterface).build_child_key(&bridge, "x").is_none());

        let iface = RecordKey::new(KeyType::TunnelInterface, ["v1", "hub-000001", "tif-000002"]);
        assert_eq!(
            handler(KeyType::TunnelInterface).build_parent_key(&iface),
            Some(RecordKey::new(KeyType::TunnelHub, ["v1", "hub-000001"]))
        );
        assert!(handler(KeyType::Vtn)
            .build_parent_key(&RecordKey::new(KeyType::Vtn, ["v1"]))
            .is_none());
    }

    #[test]
    fn validation_checks_shape_location_and_required_attributes() {
        let portmap = handler(KeyType::PortMap);
        assert!(portmap
            .validate_key(&RecordKey::new(KeyType::PortMap, ["v1", "br"]))
            .is_err());
        let record = ConfigRecord::new(RecordKey::new(KeyType::PortMap, ["v1", "br", "pm"]));
        assert!(portmap.validate_value(&record).is_err());
        let record = record.with_location("c1", "d1");
        assert!(portmap.validate_value(&record).is_err());
        let record = record.with_attr(ATTR_LOGICAL_PORT, "PP-1");
        assert!(portmap.validate_value(&record).is_ok());

        let limit = ConfigRecord::new(RecordKey::new(KeyType::PoolLimit, ["vtn:v1"]))
            .with_attr(ATTR_CAPACITY, 0);
        assert!(handler(KeyType::PoolLimit).validate_value(&limit).is_err());
    }

    #[test]
    fn derived_records_map_back_to_their_bridge() {
        let leaf_if = ConfigRecord::new(RecordKey::new(
            KeyType::LeafInterface,
            ["v1", "br", "leaf-000001", "lif-000002"],
        ));
        assert_eq!(
            handler(KeyType::LeafInterface).user_visible_key(&leaf_if),
            RecordKey::new(KeyType::Vbridge, ["v1", "br"])
        );
        let link = ConfigRecord::new(RecordKey::new(KeyType::Link, ["v1", "link-000003"]))
            .with_attr(ATTR_VBR, "br2");
        assert_eq!(
            handler(KeyType::Link).user_visible_key(&link),
            RecordKey::new(KeyType::Vbridge, ["v1", "br2"])
        );
        let hub = ConfigRecord::new(RecordKey::new(KeyType::TunnelHub, ["v1", "hub-000001"]));
        assert_eq!(
            handler(KeyType::TunnelHub).user_visible_key(&hub),
            RecordKey::new(KeyType::Vtn, ["v1"])
        );
        assert_eq!(handler(KeyType::Link).domain_kind(), DomainKind::Leaf);
        assert_eq!(handler(KeyType::TunnelHub).domain_kind(), DomainKind::Spine);
    }

    #[test]
    fn entity_types_list_primary_before_derived() {
        let tables: Vec<_> = EntityType::Vbridge.key_types().collect();
        assert_eq!(tables, vec![KeyType::Vbridge, KeyType::LeafBridge, KeyType::LeafInterface]);
        assert!(EntityType::Rename.is_local());
        assert!(!EntityType::Vlink.is_local());
        assert_eq!(EntityType::iter().count(), EntityType::COMMIT_ORDER.len());
    }

    #[test]
    fn capabilities_reject_unknown_key_types() {
        let mut controllers = IndexMap::new();
        let mut config = ControllerConfig {
            kind: ControllerKind::Odc,
            domains: vec!["d1".into()],
            unsupported_attributes: IndexMap::new(),
        };
        config
            .unsupported_attributes
            .insert("vbridge".into(), vec![ATTR_DESCRIPTION.into()]);
        controllers.insert("c1".to_owned(), config.clone());
        let caps = Capabilities::from_config(&controllers).unwrap();
        assert!(!caps.supports("c1", KeyType::Vbridge, ATTR_DESCRIPTION));
        assert!(caps.supports("c1", KeyType::Vtn, ATTR_DESCRIPTION));
        assert!(caps.supports("c2", KeyType::Vbridge, ATTR_DESCRIPTION));

        config.unsupported_attributes.insert("bridge".into(), vec!["age".into()]);
        controllers.insert("c2".to_owned(), config);
        assert!(matches!(
            Capabilities::from_config(&controllers),
            Err(EngineError::Config(_))
        ));
    }
}
