//! DAP capabilities tracking.

use crate::protocol::Capabilities;

/// Resolved capabilities of the debug adapter, stored as plain booleans.
///
/// Built from the merged protocol [`Capabilities`] of a session, so it
/// reflects both the `initialize` response and later `capabilities` events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DapCapabilities {
    /// Whether the adapter supports `configurationDone`.
    pub configuration_done: bool,
    /// Whether the adapter supports conditional breakpoints.
    pub conditional_breakpoints: bool,
    /// Whether the adapter supports hit-count breakpoints.
    pub hit_conditional_breakpoints: bool,
    /// Whether the adapter supports log points.
    pub log_points: bool,
    /// Whether the adapter supports setting variable values.
    pub set_variable: bool,
    /// Whether the adapter supports the `completions` request.
    pub completions: bool,
    /// Whether the adapter supports `evaluate` for hovers.
    pub evaluate_for_hovers: bool,
    /// Whether the adapter supports the `terminate` request.
    pub terminate: bool,
}

impl From<&Capabilities> for DapCapabilities {
    fn from(caps: &Capabilities) -> Self {
        Self {
            configuration_done: caps.supports_configuration_done_request.unwrap_or(false),
            conditional_breakpoints: caps.supports_conditional_breakpoints.unwrap_or(false),
            hit_conditional_breakpoints: caps
                .supports_hit_conditional_breakpoints
                .unwrap_or(false),
            log_points: caps.supports_log_points.unwrap_or(false),
            set_variable: caps.supports_set_variable.unwrap_or(false),
            completions: caps.supports_completions_request.unwrap_or(false),
            evaluate_for_hovers: caps.supports_evaluate_for_hovers.unwrap_or(false),
            terminate: caps.supports_terminate_request.unwrap_or(false),
        }
    }
}
