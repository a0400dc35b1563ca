//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Structured logging adapters and sinks."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Structured logging context shared by the commit, audit and topology components.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

#[doc(hidden)]
pub use tracing as __tracing;

/// Initialize a baseline tracing subscriber suitable for tests and development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_test_writer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// VTN the event concerns.
    pub vtn: Option<&'a str>,
    /// Controller the event concerns.
    pub controller: Option<&'a str>,
    /// Key type (table) being processed.
    pub key_type: Option<&'a str>,
    /// Configuration session driving the transaction.
    pub session: Option<u32>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a VTN name.
    pub fn with_vtn(mut self, vtn: &'a str) -> Self {
        self.vtn = Some(vtn);
        self
    }

    /// Attach a controller identifier.
    pub fn with_controller(mut self, controller: &'a str) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Attach a key-type name.
    pub fn with_key_type(mut self, key_type: &'a str) -> Self {
        self.key_type = Some(key_type);
        self
    }

    /// Attach a session identifier.
    pub fn with_session(mut self, session: u32) -> Self {
        self.session = Some(session);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation was stopped before completion without failing.
    Cancelled,
    /// The operation failed.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Cancelled => "cancelled",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (commit pass, audit pass, settlement).
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let default_ctx = LogContext::default();
    let ctx = context.unwrap_or(&default_ctx);
    // `tracing::event!` needs a constant level per callsite.
    match outcome {
        SystemEventOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            vtn = ctx.vtn.unwrap_or(""),
            controller = ctx.controller.unwrap_or(""),
            key_type = ctx.key_type.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %message
        ),
        SystemEventOutcome::Cancelled => tracing::event!(
            Level::WARN,
            event,
            outcome = outcome.as_str(),
            vtn = ctx.vtn.unwrap_or(""),
            controller = ctx.controller.unwrap_or(""),
            key_type = ctx.key_type.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            vtn = ctx.vtn.unwrap_or(""),
            controller = ctx.controller.unwrap_or(""),
            key_type = ctx.key_type.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %message
        ),
    }
}
