//! ---
//! vtnc_section: "02-resource-allocation"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Two-phase label allocator over bounded pools."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const TRANSPARENT: &str = "transparent";

/// A label handed out by a pool, or the reserved transparent sentinel.
///
/// "No label" is `Option::<Label>::None`; transparent is a value of its own and
/// never touches pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Value(u32),
    Transparent,
}

impl Label {
    pub fn is_transparent(&self) -> bool {
        matches!(self, Label::Transparent)
    }

    pub fn value(&self) -> Option<u32> {
        match self {
            Label::Value(value) => Some(*value),
            Label::Transparent => None,
        }
    }

    /// Attribute encoding: a number, or the string `"transparent"`.
    pub fn to_attr(&self) -> Value {
        match self {
            Label::Value(value) => Value::from(*value),
            Label::Transparent => Value::from(TRANSPARENT),
        }
    }

    pub fn from_attr(value: &Value) -> Option<Label> {
        match value {
            Value::String(s) if s == TRANSPARENT => Some(Label::Transparent),
            other => other
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Label::Value),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Value(value) => write!(f, "{value}"),
            Label::Transparent => f.write_str(TRANSPARENT),
        }
    }
}
