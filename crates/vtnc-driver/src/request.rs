//! ---
//! vtnc_section: "05-controller-dispatch"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Controller RPC contract and in-process driver."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};
use vtnc_store::{ConfigRecord, KeyType, Operation, RecordKey};

/// Distinguishes leaf wiring from ordinary configuration on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DomainKind {
    Default,
    Leaf,
    Spine,
}

/// Controller domain together with its kind prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainTag {
    pub kind: DomainKind,
    pub domain: String,
}

impl DomainTag {
    pub fn new(kind: DomainKind, domain: impl Into<String>) -> Self {
        Self {
            kind,
            domain: domain.into(),
        }
    }
}

impl fmt::Display for DomainTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DomainKind::Default => f.write_str(&self.domain),
            kind => write!(f, "{}:{}", kind, self.domain),
        }
    }
}

/// Service a request is addressed to on the controller side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Service {
    Commit,
    Audit,
}

/// One translated record addressed to `(controller, domain)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRequest {
    pub controller: String,
    pub domain: DomainTag,
    pub service: Service,
    pub op: Operation,
    pub key: RecordKey,
    /// Controller-facing attributes; for updates only the changed ones.
    pub attrs: IndexMap<String, Value>,
    pub session: Option<u32>,
}

impl DriverRequest {
    pub fn key_type(&self) -> KeyType {
        self.key.key_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultCode {
    Success,
    /// The controller rejected the request.
    Failed,
    /// The controller could not be reached.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub code: ResultCode,
    #[serde(default)]
    pub message: Option<String>,
    /// Controller's view of the record after the request.
    #[serde(default)]
    pub record: Option<ConfigRecord>,
}

impl DriverResponse {
    pub fn success(record: Option<ConfigRecord>) -> Self {
        Self {
            code: ResultCode::Success,
            message: None,
            record,
        }
    }

    pub fn failure(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            record: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}
