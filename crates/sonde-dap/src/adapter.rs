//! Debug adapter processes and terminals.
//!
//! A [`DebugAdapterProvider`] hands out one [`Connection`] per session and
//! tears the adapter down again on [`DebugAdapterProvider::stop`]. The
//! [`StdioAdapterProvider`] spawns the adapter as a child process and speaks
//! the framed protocol over its stdin/stdout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc;

use crate::configuration::DebugConfiguration;
use crate::connection::Connection;
use crate::error::DapError;
use crate::lock;
use crate::protocol::RunInTerminalRequestArguments;
use crate::transport::{encode_message, read_message};

/// Starts and stops debug adapters.
#[async_trait]
pub trait DebugAdapterProvider: Send + Sync {
    /// Start an adapter for `config` and connect to it.
    async fn start(
        &self,
        session_id: &str,
        config: &DebugConfiguration,
    ) -> Result<Connection, DapError>;

    /// Stop the adapter of `session_id`. Unknown ids are ignored.
    async fn stop(&self, session_id: &str) -> Result<(), DapError>;
}

/// How to run the adapter for one debug type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterCommand {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl AdapterCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Runs adapters as child processes talking over stdio.
#[derive(Debug, Default)]
pub struct StdioAdapterProvider {
    commands: HashMap<String, AdapterCommand>,
    children: Mutex<HashMap<String, Child>>,
}

impl StdioAdapterProvider {
    /// A provider for the given debug types.
    pub fn new(commands: HashMap<String, AdapterCommand>) -> Self {
        Self {
            commands,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an adapter is known for `debug_type`.
    pub fn supports(&self, debug_type: &str) -> bool {
        self.commands.contains_key(debug_type)
    }

    /// Number of adapter processes still owned by the provider.
    pub fn running(&self) -> usize {
        lock(&self.children).len()
    }
}

#[async_trait]
impl DebugAdapterProvider for StdioAdapterProvider {
    async fn start(
        &self,
        session_id: &str,
        config: &DebugConfiguration,
    ) -> Result<Connection, DapError> {
        let adapter_command = self.commands.get(&config.debug_type).ok_or_else(|| {
            DapError::AdapterSpawnFailed(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no adapter configured for type '{}'", config.debug_type),
            ))
        })?;

        let mut command = TokioCommand::new(&adapter_command.command);
        command
            .args(&adapter_command.args)
            .envs(&adapter_command.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &adapter_command.cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(|e| {
            DapError::AdapterSpawnFailed(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", adapter_command.command),
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DapError::Transport("could not capture adapter stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DapError::Transport("could not capture adapter stdout".into()))?;
        let stderr = child.stderr.take();

        let (to_adapter, mut outgoing) = mpsc::unbounded_channel::<Value>();
        let (to_client, incoming) = mpsc::unbounded_channel::<Value>();

        tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                if stdin.write_all(&encode_message(&message)).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let label = session_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        if to_client.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(session = %label, "adapter stream failed: {e}");
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            let label = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session = %label, "adapter stderr: {line}");
                }
            });
        }

        tracing::info!(session = %session_id, command = %adapter_command.command, "adapter started");
        lock(&self.children).insert(session_id.to_string(), child);
        Ok(Connection::new(session_id, to_adapter, incoming))
    }

    async fn stop(&self, session_id: &str) -> Result<(), DapError> {
        let child = lock(&self.children).remove(session_id);
        if let Some(mut child) = child {
            child
                .kill()
                .await
                .map_err(|e| DapError::Transport(format!("cannot stop adapter: {e}")))?;
            tracing::info!(session = %session_id, "adapter stopped");
        }
        Ok(())
    }
}

/// A `runInTerminal` request as handed to a [`TerminalLauncher`].
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalRequest {
    pub title: Option<String>,
    pub cwd: String,
    /// The program, the first element of the adapter's command line.
    pub command: String,
    pub args: Vec<String>,
    /// `None` values unset the variable.
    pub env: HashMap<String, Option<String>>,
}

impl TryFrom<RunInTerminalRequestArguments> for TerminalRequest {
    type Error = DapError;

    fn try_from(raw: RunInTerminalRequestArguments) -> Result<Self, Self::Error> {
        let mut args = raw.args.into_iter();
        let command = args
            .next()
            .ok_or_else(|| DapError::InvalidResponse("runInTerminal without a command".into()))?;
        Ok(Self {
            title: raw.title,
            cwd: raw.cwd,
            command,
            args: args.collect(),
            env: raw.env.unwrap_or_default(),
        })
    }
}

/// Runs commands on behalf of the adapter.
#[async_trait]
pub trait TerminalLauncher: Send + Sync {
    /// Start the command and return its process id.
    async fn run(&self, request: TerminalRequest) -> Result<i64, DapError>;
}

/// Starts `runInTerminal` commands as detached child processes.
#[derive(Debug, Default)]
pub struct ProcessTerminalLauncher;

#[async_trait]
impl TerminalLauncher for ProcessTerminalLauncher {
    async fn run(&self, request: TerminalRequest) -> Result<i64, DapError> {
        let mut command = TokioCommand::new(&request.command);
        command
            .args(&request.args)
            .current_dir(&request.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        for (key, value) in &request.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| DapError::Transport(format!("{} exited immediately", request.command)))?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(i64::from(pid))
    }
}
