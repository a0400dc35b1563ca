//! ---
//! vtnc_section: "04-topology-conversion"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Port-map intent conversion into leaf and tunnel topology."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vtnc_store::{ConfigRecord, KeyType, RecordFlags, RecordKey};

use crate::nodes::{ATTR_LABEL, ATTR_LEAF, ATTR_LOGICAL_PORT};
use crate::{Result, TopologyError};

const MAX_VLAN: u16 = 4095;

/// Traffic label a port map binds on the controller's logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortLabel {
    Vlan(u16),
    Transparent,
}

impl PortLabel {
    pub fn is_transparent(&self) -> bool {
        matches!(self, PortLabel::Transparent)
    }

    fn to_attr(self) -> Value {
        match self {
            PortLabel::Vlan(id) => Value::from(id),
            PortLabel::Transparent => Value::from("transparent"),
        }
    }
}

/// Binding of a unified bridge to one controller logical port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapIntent {
    pub vtn: String,
    pub vbr: String,
    pub portmap_id: String,
    pub controller: String,
    pub domain: String,
    pub logical_port: String,
    pub label: PortLabel,
}

impl PortMapIntent {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            KeyType::PortMap,
            [self.vtn.as_str(), self.vbr.as_str(), self.portmap_id.as_str()],
        )
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("vtn", &self.vtn),
            ("vbr", &self.vbr),
            ("portmap_id", &self.portmap_id),
            ("controller", &self.controller),
            ("domain", &self.domain),
            ("logical_port", &self.logical_port),
        ] {
            if value.trim().is_empty() {
                return Err(TopologyError::InvalidIntent(format!("{field} is empty")));
            }
        }
        if let PortLabel::Vlan(id) = self.label {
            if id == 0 || id > MAX_VLAN {
                return Err(TopologyError::InvalidIntent(format!(
                    "vlan {id} outside 1..={MAX_VLAN}"
                )));
            }
        }
        Ok(())
    }

    /// The user-visible PortMap record; `leaf` names the leaf bridge serving it.
    pub(crate) fn to_record(&self, leaf: &str) -> ConfigRecord {
        ConfigRecord::new(self.key())
            .with_location(self.controller.as_str(), self.domain.as_str())
            .with_attr(ATTR_LOGICAL_PORT, self.logical_port.as_str())
            .with_attr(ATTR_LABEL, self.label.to_attr())
            .with_attr(ATTR_LEAF, leaf)
            .with_flags(RecordFlags::USER_CONFIGURED)
    }
}
