//! ---
//! vtnc_section: "03-persistence-logging"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Structured logging adapters and sinks."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
//! Context-enriched logging macros.

#[doc(hidden)]
#[macro_export]
macro_rules! __vtnc_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        $crate::__tracing::event!(
            $level,
            vtn = ctx.vtn.unwrap_or(""),
            controller = ctx.controller.unwrap_or(""),
            key_type = ctx.key_type.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with reconciliation context.
#[macro_export]
macro_rules! vtnc_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with reconciliation context.
#[macro_export]
macro_rules! vtnc_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with reconciliation context.
#[macro_export]
macro_rules! vtnc_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with reconciliation context.
#[macro_export]
macro_rules! vtnc_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__vtnc_event!($crate::__tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
