//! ---
//! vtnc_section: "05-controller-dispatch"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Controller RPC contract and in-process driver."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use vtnc_store::ConfigRecord;

use crate::request::{DriverRequest, DriverResponse};
use crate::Result;

/// Driver abstraction used by the commit and audit engines.
pub trait ControllerDriver: Send + Sync {
    /// Dispatch one record and block until the controller answers.
    fn send(&self, request: DriverRequest) -> DriverResponse;
    fn is_connected(&self, controller: &str) -> bool;
    /// Configuration the controller currently holds.
    fn fetch_running(&self, controller: &str) -> Result<Vec<ConfigRecord>>;
    /// Human-readable driver name for logging.
    fn name(&self) -> &'static str;
}
