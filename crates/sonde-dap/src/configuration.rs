//! Launch configurations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DapError;

/// Which handshake request a configuration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Start the debuggee.
    Launch,
    /// Connect to a running debuggee.
    Attach,
}

impl RequestKind {
    /// The protocol command for this kind.
    pub fn command(self) -> &'static str {
        match self {
            RequestKind::Launch => "launch",
            RequestKind::Attach => "attach",
        }
    }
}

/// A debug configuration: the adapter type, a display name, the
/// `launch`/`attach` request and any adapter-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugConfiguration {
    /// Debug type, selects the adapter and the session factory.
    #[serde(rename = "type")]
    pub debug_type: String,
    /// Human-readable name.
    pub name: String,
    /// `"launch"` or `"attach"`.
    pub request: String,
    /// Adapter-specific fields, forwarded verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DebugConfiguration {
    pub fn new(
        debug_type: impl Into<String>,
        name: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            debug_type: debug_type.into(),
            name: name.into(),
            request: request.into(),
            fields: Map::new(),
        }
    }

    /// Add an adapter-specific field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Resolve the `request` field.
    pub fn request_kind(&self) -> Result<RequestKind, DapError> {
        match self.request.as_str() {
            "launch" => Ok(RequestKind::Launch),
            "attach" => Ok(RequestKind::Attach),
            other => Err(DapError::UnsupportedRequest(other.to_string())),
        }
    }

    /// Arguments of the `launch`/`attach` request.
    ///
    /// The whole configuration is forwarded, plus `__restart` (the restart
    /// data, or `false`) and, for launches, `noDebug: false`.
    pub fn request_arguments(&self, kind: RequestKind, restart: Option<&Value>) -> Value {
        let mut args = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        args.insert(
            "__restart".into(),
            restart.cloned().unwrap_or(Value::Bool(false)),
        );
        if kind == RequestKind::Launch {
            args.insert("noDebug".into(), Value::Bool(false));
        }
        Value::Object(args)
    }
}
