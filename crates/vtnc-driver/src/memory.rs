//! ---
//! vtnc_section: "05-controller-dispatch"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Controller RPC contract and in-process driver."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vtnc_store::{Attribute, ConfigRecord, Operation, RecordKey};

use crate::driver::ControllerDriver;
use crate::request::{DriverRequest, DriverResponse, ResultCode};
use crate::{DriverError, Result};

/// Scripted dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureRule {
    /// Reject every request for this key.
    Key(RecordKey),
    /// Reject the n-th request (1-based) seen by the driver.
    Nth(usize),
}

#[derive(Debug, Default)]
struct Controller {
    connected: bool,
    config: BTreeMap<RecordKey, ConfigRecord>,
}

#[derive(Debug, Default)]
struct State {
    controllers: BTreeMap<String, Controller>,
    sent: Vec<DriverRequest>,
    failures: Vec<FailureRule>,
}

/// In-process driver keeping a ground-truth configuration per controller.
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    state: Mutex<State>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected controller with an empty configuration.
    pub fn add_controller(&self, controller: &str) {
        self.state
            .lock()
            .controllers
            .entry(controller.to_owned())
            .or_default()
            .connected = true;
    }

    pub fn set_connected(&self, controller: &str, connected: bool) {
        if let Some(entry) = self.state.lock().controllers.get_mut(controller) {
            entry.connected = connected;
        }
    }

    pub fn fail_on(&self, rule: FailureRule) {
        self.state.lock().failures.push(rule);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Place a record directly into a controller's configuration.
    pub fn seed(&self, controller: &str, record: ConfigRecord) {
        self.state
            .lock()
            .controllers
            .entry(controller.to_owned())
            .or_default()
            .config
            .insert(record.key.clone(), record);
    }

    /// Drop a record from a controller's configuration behind the engines' back.
    pub fn forget(&self, controller: &str, key: &RecordKey) {
        if let Some(entry) = self.state.lock().controllers.get_mut(controller) {
            entry.config.remove(key);
        }
    }

    pub fn config(&self, controller: &str) -> Vec<ConfigRecord> {
        self.state
            .lock()
            .controllers
            .get(controller)
            .map(|entry| entry.config.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every request seen so far, including rejected ones.
    pub fn sent(&self) -> Vec<DriverRequest> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

impl ControllerDriver for InMemoryDriver {
    fn send(&self, request: DriverRequest) -> DriverResponse {
        let mut state = self.state.lock();
        state.sent.push(request.clone());
        let ordinal = state.sent.len();

        let scripted = state.failures.iter().any(|rule| match rule {
            FailureRule::Key(key) => *key == request.key,
            FailureRule::Nth(n) => *n == ordinal,
        });
        if scripted {
            warn!(controller = %request.controller, key = %request.key, "scripted dispatch failure");
            return DriverResponse::failure(ResultCode::Failed, format!("{} rejected", request.key));
        }

        let Some(controller) = state
            .controllers
            .get_mut(&request.controller)
            .filter(|entry| entry.connected)
        else {
            return DriverResponse::failure(
                ResultCode::Unreachable,
                format!("controller {} is unreachable", request.controller),
            );
        };

        debug!(
            controller = %request.controller,
            domain = %request.domain,
            op = %request.op,
            key = %request.key,
            "request applied"
        );
        match request.op {
            Operation::Delete => {
                controller.config.remove(&request.key);
                DriverResponse::success(None)
            }
            Operation::Create | Operation::Update => {
                let record = controller.config.entry(request.key.clone()).or_insert_with(|| {
                    ConfigRecord::new(request.key.clone())
                        .with_location(request.controller.as_str(), request.domain.domain.as_str())
                });
                for (name, value) in request.attrs {
                    if value.is_null() {
                        record.attrs.shift_remove(&name);
                    } else {
                        record.attrs.insert(name, Attribute::valid(value));
                    }
                }
                DriverResponse::success(Some(record.clone()))
            }
        }
    }

    fn is_connected(&self, controller: &str) -> bool {
        self.state
            .lock()
            .controllers
            .get(controller)
            .map_or(false, |entry| entry.connected)
    }

    fn fetch_running(&self, controller: &str) -> Result<Vec<ConfigRecord>> {
        let state = self.state.lock();
        match state.controllers.get(controller) {
            None => Err(DriverError::UnknownController(controller.to_owned())),
            Some(entry) if !entry.connected => Err(DriverError::Unreachable(controller.to_owned())),
            Some(entry) => Ok(entry.config.values().cloned().collect()),
        }
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
