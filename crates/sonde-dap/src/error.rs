//! DAP error types.

use thiserror::Error;

/// Errors from debug session operations.
#[derive(Debug, Error)]
pub enum DapError {
    /// Adapter process failed to start.
    #[error("adapter failed to start: {0}")]
    AdapterSpawnFailed(#[from] std::io::Error),

    /// Transport-level communication error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Adapter answered a request with an error response.
    #[error("adapter rejected '{command}': {message}")]
    Rejected {
        /// The command the adapter rejected.
        command: String,
        /// The rejection message from the adapter.
        message: String,
    },

    /// Adapter sent an invalid or unparseable message.
    #[error("adapter sent invalid response: {0}")]
    InvalidResponse(String),

    /// The configuration's `request` is neither `launch` nor `attach`.
    #[error("unsupported request '{0}' type")]
    UnsupportedRequest(String),

    /// A source carries neither a path nor a source reference.
    #[error("unrecognized source type: {0}")]
    InvalidSource(String),

    /// The source content cannot be fetched from the adapter.
    #[error("source is not available: {0}")]
    SourceUnavailable(String),

    /// The connection to the adapter has been disposed.
    #[error("debug session already terminated")]
    Terminated,
}

impl DapError {
    /// The message shown to the user for this error.
    ///
    /// Adapter rejections carry their own message; everything else
    /// falls back to the error's display form.
    pub fn user_message(&self) -> String {
        match self {
            DapError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
