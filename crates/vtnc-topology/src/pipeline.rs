//! ---
//! vtnc_section: "04-topology-conversion"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Port-map intent conversion into leaf and tunnel topology."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::sync::Arc;

use serde::Serialize;
use vtnc_alloc::{spine_of_scope, LabelAllocator, PoolKind};
use vtnc_logging::{vtnc_info, vtnc_warn, LogContext};
use vtnc_store::{ConfigRecord, KeyType, Partition, RecordKey, ScopeFilter};

use crate::builder::TopologyBuilder;
use crate::intent::PortMapIntent;
use crate::nodes::{
    allocation_of, attachment_peers, attachment_records, leaf_bridge, ref_count, set_ref_count,
    tunnel_hub, Attachment, BridgeState, ATTR_LEAF, HUB_PREFIX, LEAF_IF_PREFIX, LEAF_PREFIX,
    LINK_PREFIX, TUNNEL_IF_PREFIX,
};
use crate::{Result, TopologyError};

/// Effect of one apply/retract call on its bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyChange {
    pub before: BridgeState,
    pub after: BridgeState,
    /// Leaf bridge serving the intent.
    pub leaf: String,
    /// The VTN's tunnel hub after the call.
    pub hub: Option<String>,
}

/// Converts port-map intents into derived topology in CANDIDATE.
pub struct ConversionPipeline {
    allocator: Arc<LabelAllocator>,
}

impl ConversionPipeline {
    pub fn new(allocator: Arc<LabelAllocator>) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &Arc<LabelAllocator> {
        &self.allocator
    }

    /// Leaf bridges of a unified bridge in CANDIDATE.
    pub fn leaves(&self, vtn: &str, vbr: &str) -> Result<Vec<ConfigRecord>> {
        Ok(self.allocator.store().read_all(
            Partition::Candidate,
            KeyType::LeafBridge,
            &ScopeFilter::prefix([vtn, vbr]),
        )?)
    }

    /// The VTN's tunnel hub in CANDIDATE.
    pub fn hub(&self, vtn: &str) -> Result<Option<ConfigRecord>> {
        Ok(self
            .allocator
            .store()
            .read_all(Partition::Candidate, KeyType::TunnelHub, &ScopeFilter::prefix([vtn]))?
            .into_iter()
            .next())
    }

    pub fn bridge_state(&self, vtn: &str, vbr: &str) -> Result<BridgeState> {
        Ok(BridgeState::from_leaf_count(self.leaves(vtn, vbr)?.len()))
    }

    /// Bind a unified bridge to a controller port, extending its topology.
    pub fn apply_intent(&self, intent: &PortMapIntent) -> Result<TopologyChange> {
        intent.validate()?;
        let ctx = LogContext::new().with_vtn(&intent.vtn).with_controller(&intent.controller);
        let mut builder = TopologyBuilder::new(&self.allocator);
        match stage_apply(&mut builder, intent) {
            Ok(change) => {
                builder.commit()?;
                vtnc_info!(
                    context = ctx,
                    "port map {} applied on {}: {:?} -> {:?}",
                    intent.portmap_id,
                    intent.vbr,
                    change.before,
                    change.after
                );
                Ok(change)
            }
            Err(err) => {
                builder.abandon();
                vtnc_warn!(context = ctx, "port map {} rejected: {}", intent.portmap_id, err);
                Err(err)
            }
        }
    }

    /// Remove a port map and tear down topology nothing else depends on.
    ///
    /// Only the intent's key is consulted; location and label come from the
    /// stored record.
    pub fn retract_intent(&self, intent: &PortMapIntent) -> Result<TopologyChange> {
        let ctx = LogContext::new().with_vtn(&intent.vtn).with_controller(&intent.controller);
        let mut builder = TopologyBuilder::new(&self.allocator);
        match stage_retract(&mut builder, intent) {
            Ok(change) => {
                builder.commit()?;
                vtnc_info!(
                    context = ctx,
                    "port map {} retracted from {}: {:?} -> {:?}",
                    intent.portmap_id,
                    intent.vbr,
                    change.before,
                    change.after
                );
                Ok(change)
            }
            Err(err) => {
                builder.abandon();
                vtnc_warn!(context = ctx, "port map {} not retracted: {}", intent.portmap_id, err);
                Err(err)
            }
        }
    }
}

fn is_transparent(record: &ConfigRecord) -> bool {
    allocation_of(record).map_or(false, |allocation| allocation.label.is_transparent())
}

fn stage_apply(builder: &mut TopologyBuilder<'_>, intent: &PortMapIntent) -> Result<TopologyChange> {
    let (vtn, vbr) = (intent.vtn.as_str(), intent.vbr.as_str());
    for parent in [
        RecordKey::new(KeyType::Vtn, [vtn]),
        RecordKey::new(KeyType::Vbridge, [vtn, vbr]),
    ] {
        if builder.read(&parent)?.is_none() {
            return Err(TopologyError::ParentMissing(parent));
        }
    }
    let key = intent.key();
    if builder.read(&key)?.is_some() {
        return Err(TopologyError::IntentExists(key));
    }

    let leaves = builder.read_all(KeyType::LeafBridge, &[vtn, vbr])?;
    let before = BridgeState::from_leaf_count(leaves.len());
    let location = (intent.controller.as_str(), intent.domain.as_str());

    let leaf_name = match leaves.iter().find(|leaf| leaf.location() == Some(location)) {
        Some(existing) => {
            let transparent = is_transparent(existing);
            if transparent != intent.label.is_transparent() {
                return Err(TopologyError::LabelKindConflict {
                    leaf: existing.key.name().to_owned(),
                    existing: if transparent { "transparent" } else { "value" },
                });
            }
            let mut leaf = existing.clone();
            set_ref_count(&mut leaf, ref_count(existing) + 1);
            builder.put(leaf);
            existing.key.name().to_owned()
        }
        None => {
            let allocation = if intent.label.is_transparent() {
                if leaves.iter().any(is_transparent) {
                    return Err(TopologyError::TransparentLabelInUse {
                        vtn: vtn.to_owned(),
                        vbr: vbr.to_owned(),
                    });
                }
                builder.transparent(vtn)
            } else {
                builder.allocate(&PoolKind::bridge(vtn), vtn)?
            };
            let name = builder.next_name(LEAF_PREFIX)?;
            let leaf = leaf_bridge(vtn, vbr, &name, location, &allocation);
            builder.put(leaf.clone());

            if !leaves.is_empty() {
                let mut hub = ensure_hub(builder, vtn, vbr)?;
                if let [only] = leaves.as_slice() {
                    attach(builder, only, &mut hub)?;
                }
                attach(builder, &leaf, &mut hub)?;
                builder.put(hub);
            }
            name
        }
    };
    builder.put(intent.to_record(&leaf_name));

    summarize(builder, vtn, vbr, before, leaf_name)
}

fn stage_retract(builder: &mut TopologyBuilder<'_>, intent: &PortMapIntent) -> Result<TopologyChange> {
    let (vtn, vbr) = (intent.vtn.as_str(), intent.vbr.as_str());
    let key = intent.key();
    let Some(portmap) = builder.read(&key)? else {
        return Err(TopologyError::IntentNotFound(key));
    };
    let leaf_name = portmap
        .attr_str(ATTR_LEAF)
        .ok_or_else(|| TopologyError::Inconsistent(format!("{key} names no leaf bridge")))?
        .to_owned();

    let leaves = builder.read_all(KeyType::LeafBridge, &[vtn, vbr])?;
    let before = BridgeState::from_leaf_count(leaves.len());
    let Some(leaf) = leaves.iter().find(|leaf| leaf.key.name() == leaf_name) else {
        return Err(TopologyError::Inconsistent(format!(
            "{key} references missing leaf bridge {leaf_name}"
        )));
    };
    builder.remove(key);

    let remaining = ref_count(leaf).saturating_sub(1);
    if remaining > 0 {
        let mut leaf = leaf.clone();
        set_ref_count(&mut leaf, remaining);
        builder.put(leaf);
        return summarize(builder, vtn, vbr, before, leaf_name);
    }

    let mut hub = builder
        .read_all(KeyType::TunnelHub, &[vtn])?
        .into_iter()
        .next();
    detach(builder, leaf, &mut hub)?;
    builder.remove(leaf.key.clone());
    let allocation = allocation_of(leaf).ok_or_else(|| {
        TopologyError::Inconsistent(format!("{} carries no label", leaf.key))
    })?;
    builder.release(allocation, vtn)?;

    let others: Vec<&ConfigRecord> = leaves.iter().filter(|other| other.key != leaf.key).collect();
    if let [last] = others.as_slice() {
        detach(builder, last, &mut hub)?;
    }

    if let Some(hub) = hub {
        if ref_count(&hub) == 0 {
            let allocation = allocation_of(&hub).ok_or_else(|| {
                TopologyError::Inconsistent(format!("{} carries no label", hub.key))
            })?;
            builder.remove(hub.key.clone());
            builder.release(allocation, vtn)?;
        } else {
            builder.put(hub);
        }
    }

    summarize(builder, vtn, vbr, before, leaf_name)
}

fn summarize(
    builder: &TopologyBuilder<'_>,
    vtn: &str,
    vbr: &str,
    before: BridgeState,
    leaf: String,
) -> Result<TopologyChange> {
    let after = BridgeState::from_leaf_count(builder.read_all(KeyType::LeafBridge, &[vtn, vbr])?.len());
    let hub = builder
        .read_all(KeyType::TunnelHub, &[vtn])?
        .into_iter()
        .next()
        .map(|hub| hub.key.name().to_owned());
    Ok(TopologyChange {
        before,
        after,
        leaf,
        hub,
    })
}

/// The VTN's hub, or a new one on the spine domain with the most tunnel-label headroom.
fn ensure_hub(builder: &mut TopologyBuilder<'_>, vtn: &str, vbr: &str) -> Result<ConfigRecord> {
    if let Some(hub) = builder.read_all(KeyType::TunnelHub, &[vtn])?.into_iter().next() {
        return Ok(hub);
    }
    let allocation = builder.allocate(&PoolKind::Tunnel, vtn)?;
    let spine = spine_of_scope(&allocation.scope)
        .ok_or_else(|| TopologyError::Inconsistent(format!("{} is not a spine pool", allocation.scope)))?
        .to_owned();
    let spine_key = RecordKey::new(KeyType::SpineDomain, [spine.as_str()]);
    let spine_record = builder
        .read(&spine_key)?
        .ok_or_else(|| TopologyError::Inconsistent(format!("{spine_key} vanished")))?;
    let location = spine_record
        .location()
        .ok_or_else(|| TopologyError::Inconsistent(format!("{spine_key} has no location")))?;
    let name = builder.next_name(HUB_PREFIX)?;
    Ok(tunnel_hub(vtn, &name, &spine, location, &allocation, vbr))
}

fn attach(builder: &mut TopologyBuilder<'_>, leaf: &ConfigRecord, hub: &mut ConfigRecord) -> Result<()> {
    let names = Attachment {
        leaf_interface: builder.next_name(LEAF_IF_PREFIX)?,
        tunnel_interface: builder.next_name(TUNNEL_IF_PREFIX)?,
        link: builder.next_name(LINK_PREFIX)?,
    };
    for record in attachment_records(leaf, hub, &names) {
        builder.put(record);
    }
    set_ref_count(hub, ref_count(hub) + 1);
    Ok(())
}

fn detach(
    builder: &mut TopologyBuilder<'_>,
    leaf: &ConfigRecord,
    hub: &mut Option<ConfigRecord>,
) -> Result<()> {
    let prefix = [
        leaf.key.part(0).unwrap_or_default(),
        leaf.key.part(1).unwrap_or_default(),
        leaf.key.name(),
    ];
    for leaf_if in builder.read_all(KeyType::LeafInterface, &prefix)? {
        let (tunnel_if, link, hub_name) = attachment_peers(&leaf_if).ok_or_else(|| {
            TopologyError::Inconsistent(format!("{} has incomplete wiring", leaf_if.key))
        })?;
        let Some(hub) = hub.as_mut().filter(|hub| hub.key.name() == hub_name) else {
            return Err(TopologyError::Inconsistent(format!(
                "{} references unknown hub {hub_name}",
                leaf_if.key
            )));
        };
        set_ref_count(hub, ref_count(hub).saturating_sub(1));
        builder.remove(leaf_if.key.clone());
        builder.remove(tunnel_if);
        builder.remove(link);
    }
    Ok(())
}
