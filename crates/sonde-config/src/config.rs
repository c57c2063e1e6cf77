use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Log verbosity level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug messages.
    Debug,
    /// Informational messages (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// The level as a `tracing` filter directive.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log verbosity level.
    #[serde(default)]
    pub level: LogLevel,
    /// Log file. Defaults to `<data dir>/logs/sonde.log`.
    pub file: Option<PathBuf>,
}

/// Session timing and the client identity sent in `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Coalescing window for thread list refreshes.
    #[serde(default = "default_delay")]
    pub thread_refresh_delay_ms: u64,
    /// Coalescing window for stack trace refreshes.
    #[serde(default = "default_delay")]
    pub stack_refresh_delay_ms: u64,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_delay() -> u64 {
    100
}

fn default_client_id() -> String {
    "sonde".to_string()
}

fn default_client_name() -> String {
    "Sonde".to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thread_refresh_delay_ms: default_delay(),
            stack_refresh_delay_ms: default_delay(),
            client_id: default_client_id(),
            client_name: default_client_name(),
            locale: default_locale(),
        }
    }
}

/// How to spawn the adapter for one debug type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// The adapter executable.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the adapter process.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One launch configuration.
///
/// Keys other than `type`, `name` and `request` are adapter specific and
/// are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(rename = "type")]
    pub debug_type: String,
    pub name: String,
    pub request: String,
    #[serde(flatten)]
    pub fields: toml::Table,
}

/// Top-level sonde configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Adapters keyed by debug type.
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
    /// Launch configurations, in file order.
    #[serde(default)]
    pub configurations: Vec<LaunchConfig>,
}

impl Config {
    /// The launch configuration called `name`.
    pub fn configuration(&self, name: &str) -> Option<&LaunchConfig> {
        self.configurations.iter().find(|c| c.name == name)
    }
}
