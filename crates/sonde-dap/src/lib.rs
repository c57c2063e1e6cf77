//! sonde-dap: client-side runtime for the Debug Adapter Protocol.
//!
//! This crate talks to out-of-process debug adapters and keeps the state
//! they report (threads, frames, variables, breakpoints) consistent across
//! interleaved events. A [`DebugSessionManager`] owns every live
//! [`DebugSession`] and derives the current session, thread and frame.

pub mod adapter;
pub mod breakpoint;
pub mod capabilities;
pub mod commands;
pub mod configuration;
pub mod connection;
pub mod emitter;
pub mod error;
pub mod manager;
pub mod marker;
pub mod model;
pub mod protocol;
pub mod refresh;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience.
pub use adapter::{
    AdapterCommand, DebugAdapterProvider, ProcessTerminalLauncher, StdioAdapterProvider,
    TerminalLauncher, TerminalRequest,
};
pub use breakpoint::{Breakpoint, BreakpointFilter, BreakpointStore, DebugBreakpoint};
pub use capabilities::DapCapabilities;
pub use commands::DebugCommand;
pub use configuration::{DebugConfiguration, RequestKind};
pub use connection::{AdapterEndpoint, AdapterSender, Connection};
pub use emitter::{Emitter, Subscription};
pub use error::DapError;
pub use manager::{
    DebugSessionFactory, DebugSessionManager, DefaultSessionFactory, SessionArgs,
    SessionNotification,
};
pub use model::{
    DebugSource, DebugStackFrame, DebugThread, DebugVariable, ExpressionContainer,
    ExpressionItem, SourceOpener, VariableNode,
};
pub use session::{DebugSession, SessionOptions, SessionState};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
