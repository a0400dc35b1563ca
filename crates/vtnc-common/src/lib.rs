//! ---
//! vtnc_section: "01-core-functionality"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Shared primitives and utilities for the reconciliation core."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Shared primitives for the VTN coordinator workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the engines and the operator binary.

pub mod config;
pub mod logging;

pub use config::{
    AllocatorConfig, AppConfig, AuditConfig, CommitConfig, ControllerConfig, ControllerKind,
    DisconnectedPolicy, LoadedAppConfig, LoggingConfig, StoreConfig,
};
pub use logging::{init_tracing, LogFormat};
