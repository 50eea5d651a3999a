//! Logging infrastructure for resource-manager observability.
//!
//! All events use `tracing` with target "tablet_resource" and include an
//! `event` field for filtering.
//!
//! ## Library Integration
//!
//! This crate never initializes a global subscriber. Applications configure
//! tracing via `tracing_subscriber` or similar.
//!
//! ## Conventions
//!
//! - `event`: snake_case event name (required)
//! - `component`: subsystem (e.g., "pool", "memory", "hold")
//! - Use `%` for Display, `?` for Debug formatting

/// Target for all resource-manager log events.
pub(crate) const LOG_TARGET: &str = "tablet_resource";

/// Macro for info-level log events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "pool",
///     event = "pool_resized",
///     pool = %name,
///     max = new_max,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::LOG_TARGET, $($field)*)
    };
}

/// Macro for debug-level log events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::LOG_TARGET, $($field)*)
    };
}

/// Macro for warn-level log events.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::LOG_TARGET, $($field)*)
    };
}

/// Macro for error-level log events.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::LOG_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
