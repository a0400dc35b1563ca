//! ---
//! vtnc_section: "04-topology-conversion"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Port-map intent conversion into leaf and tunnel topology."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Record shapes of the derived topology nodes.
//!
//! | key type | key | notable attributes |
//! |---|---|---|
//! | `LeafBridge` | `[vtn, vbr, leaf]` | `label`, `label_scope`, `ref_count` |
//! | `LeafInterface` | `[vtn, vbr, leaf, if]` | `hub`, `tunnel_interface`, `link` |
//! | `TunnelHub` | `[vtn, hub]` | `label`, `label_scope`, `ref_count`, `origin_vbr`, `spine` |
//! | `TunnelInterface` | `[vtn, hub, if]` | `vbr`, `leaf`, `link` |
//! | `Link` | `[vtn, link]` | `vbr`, `leaf`, `leaf_interface`, `hub`, `tunnel_interface` |

use serde::{Deserialize, Serialize};
use vtnc_alloc::{Allocation, Label};
use vtnc_store::{ConfigRecord, KeyType, RecordFlags, RecordKey};

pub const ATTR_LABEL: &str = "label";
pub const ATTR_LABEL_SCOPE: &str = "label_scope";
pub const ATTR_REF_COUNT: &str = "ref_count";
pub const ATTR_ORIGIN_VBR: &str = "origin_vbr";
pub const ATTR_SPINE: &str = "spine";
pub const ATTR_LOGICAL_PORT: &str = "logical_port";
pub const ATTR_VBR: &str = "vbr";
pub const ATTR_LEAF: &str = "leaf";
pub const ATTR_HUB: &str = "hub";
pub const ATTR_LEAF_INTERFACE: &str = "leaf_interface";
pub const ATTR_TUNNEL_INTERFACE: &str = "tunnel_interface";
pub const ATTR_LINK: &str = "link";

pub(crate) const LEAF_PREFIX: &str = "leaf";
pub(crate) const LEAF_IF_PREFIX: &str = "lif";
pub(crate) const HUB_PREFIX: &str = "hub";
pub(crate) const TUNNEL_IF_PREFIX: &str = "tif";
pub(crate) const LINK_PREFIX: &str = "link";

/// Conversion state of one unified bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    Empty,
    SingleLeaf,
    MultiLeaf,
}

impl BridgeState {
    pub fn from_leaf_count(leaves: usize) -> Self {
        match leaves {
            0 => BridgeState::Empty,
            1 => BridgeState::SingleLeaf,
            _ => BridgeState::MultiLeaf,
        }
    }
}

pub fn ref_count(record: &ConfigRecord) -> u64 {
    record.attr_u64(ATTR_REF_COUNT).unwrap_or(0)
}

pub fn set_ref_count(record: &mut ConfigRecord, count: u64) {
    record.set_attr(ATTR_REF_COUNT, count);
}

/// Label and pool of a leaf bridge or tunnel hub.
pub fn allocation_of(record: &ConfigRecord) -> Option<Allocation> {
    Some(Allocation {
        scope: record.attr_str(ATTR_LABEL_SCOPE)?.to_owned(),
        label: Label::from_attr(record.attr(ATTR_LABEL)?)?,
    })
}

pub(crate) fn leaf_bridge(
    vtn: &str,
    vbr: &str,
    leaf: &str,
    location: (&str, &str),
    allocation: &Allocation,
) -> ConfigRecord {
    ConfigRecord::new(RecordKey::new(KeyType::LeafBridge, [vtn, vbr, leaf]))
        .with_location(location.0, location.1)
        .with_attr(ATTR_LABEL, allocation.label.to_attr())
        .with_attr(ATTR_LABEL_SCOPE, allocation.scope.as_str())
        .with_attr(ATTR_REF_COUNT, 1u64)
        .with_flags(RecordFlags::BOUNDARY)
}

pub(crate) fn tunnel_hub(
    vtn: &str,
    hub: &str,
    spine: &str,
    location: (&str, &str),
    allocation: &Allocation,
    origin_vbr: &str,
) -> ConfigRecord {
    ConfigRecord::new(RecordKey::new(KeyType::TunnelHub, [vtn, hub]))
        .with_location(location.0, location.1)
        .with_attr(ATTR_LABEL, allocation.label.to_attr())
        .with_attr(ATTR_LABEL_SCOPE, allocation.scope.as_str())
        .with_attr(ATTR_REF_COUNT, 0u64)
        .with_attr(ATTR_ORIGIN_VBR, origin_vbr)
        .with_attr(ATTR_SPINE, spine)
        .with_flags(RecordFlags::BOUNDARY)
}

/// Names of the three records wiring one leaf to a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attachment {
    pub leaf_interface: String,
    pub tunnel_interface: String,
    pub link: String,
}

pub(crate) fn attachment_records(
    leaf: &ConfigRecord,
    hub: &ConfigRecord,
    names: &Attachment,
) -> [ConfigRecord; 3] {
    let vtn = leaf.key.part(0).unwrap_or_default();
    let vbr = leaf.key.part(1).unwrap_or_default();
    let leaf_name = leaf.key.name();
    let hub_name = hub.key.name();
    let leaf_loc = leaf.location().unwrap_or_default();
    let hub_loc = hub.location().unwrap_or_default();

    let leaf_if = ConfigRecord::new(RecordKey::new(
        KeyType::LeafInterface,
        [vtn, vbr, leaf_name, names.leaf_interface.as_str()],
    ))
    .with_location(leaf_loc.0, leaf_loc.1)
    .with_attr(ATTR_HUB, hub_name)
    .with_attr(ATTR_TUNNEL_INTERFACE, names.tunnel_interface.as_str())
    .with_attr(ATTR_LINK, names.link.as_str())
    .with_flags(RecordFlags::BOUNDARY);

    let tunnel_if = ConfigRecord::new(RecordKey::new(
        KeyType::TunnelInterface,
        [vtn, hub_name, names.tunnel_interface.as_str()],
    ))
    .with_location(hub_loc.0, hub_loc.1)
    .with_attr(ATTR_VBR, vbr)
    .with_attr(ATTR_LEAF, leaf_name)
    .with_attr(ATTR_LINK, names.link.as_str())
    .with_flags(RecordFlags::BOUNDARY);

    let link = ConfigRecord::new(RecordKey::new(KeyType::Link, [vtn, names.link.as_str()]))
        .with_location(leaf_loc.0, leaf_loc.1)
        .with_attr(ATTR_VBR, vbr)
        .with_attr(ATTR_LEAF, leaf_name)
        .with_attr(ATTR_LEAF_INTERFACE, names.leaf_interface.as_str())
        .with_attr(ATTR_HUB, hub_name)
        .with_attr(ATTR_TUNNEL_INTERFACE, names.tunnel_interface.as_str())
        .with_flags(RecordFlags::BOUNDARY);

    [leaf_if, tunnel_if, link]
}

/// Keys of the tunnel interface and link hanging off a leaf interface.
pub(crate) fn attachment_peers(leaf_if: &ConfigRecord) -> Option<(RecordKey, RecordKey, String)> {
    let vtn = leaf_if.key.part(0)?;
    let hub = leaf_if.attr_str(ATTR_HUB)?;
    let tunnel_if = leaf_if.attr_str(ATTR_TUNNEL_INTERFACE)?;
    let link = leaf_if.attr_str(ATTR_LINK)?;
    Some((
        RecordKey::new(KeyType::TunnelInterface, [vtn, hub, tunnel_if]),
        RecordKey::new(KeyType::Link, [vtn, link]),
        hub.to_owned(),
    ))
}
