//! Per-session models of adapter-reported state.
//!
//! Sources, stack frames, threads and variable trees all belong to exactly
//! one session and reach the adapter through the session's shared
//! [`SessionContext`].

pub mod frame;
pub mod source;
pub mod thread;
pub mod variables;

use std::time::Duration;

use crate::connection::Connection;

pub use frame::{DebugScope, DebugStackFrame};
pub use source::{DebugSource, Position, Selection, SourceOpener, SourceRegistry};
pub use thread::{DebugThread, StoppedDetails};
pub use variables::{
    DebugVariable, ExpressionContainer, ExpressionItem, ValueKind, VariableNode, VariableRange,
};

/// What every model of one session shares.
#[derive(Debug)]
pub struct SessionContext {
    /// Session id, used in log records.
    pub session_id: String,
    /// The session's adapter connection.
    pub connection: Connection,
    /// Sources seen in this session, keyed by URI.
    pub sources: SourceRegistry,
    /// Coalescing window for per-thread stack refreshes.
    pub stack_refresh_delay: Duration,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        connection: Connection,
        stack_refresh_delay: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sources: SourceRegistry::new(connection.clone()),
            connection,
            stack_refresh_delay,
        }
    }
}
