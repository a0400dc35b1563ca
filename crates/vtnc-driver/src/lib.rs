//! ---
//! vtnc_section: "05-controller-dispatch"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Controller RPC contract and in-process driver."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Contract between the engines and the remote network element controllers.
//!
//! Per-record dispatch failures are reported through [`ResultCode`] in the
//! response; [`DriverError`] is reserved for whole-controller operations such
//! as fetching the running configuration during audit.

mod driver;
mod memory;
mod request;

pub use driver::ControllerDriver;
pub use memory::{FailureRule, InMemoryDriver};
pub use request::{DomainKind, DomainTag, DriverRequest, DriverResponse, ResultCode, Service};

/// Result alias for whole-controller driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("controller {0} is unreachable")]
    Unreachable(String),
    #[error("controller {0} is not known to the driver")]
    UnknownController(String),
}
