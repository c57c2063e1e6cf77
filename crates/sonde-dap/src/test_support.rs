//! A scripted debug adapter for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::DebugAdapterProvider;
use crate::configuration::DebugConfiguration;
use crate::connection::{AdapterEndpoint, AdapterSender, Connection};
use crate::error::DapError;

type Script = dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync;

/// Sits on the far side of an in-memory connection, records every request
/// and answers it through the script.
#[derive(Clone)]
pub(crate) struct ScriptedAdapter {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    responses: Arc<Mutex<Vec<Value>>>,
    sender: AdapterSender,
}

impl ScriptedAdapter {
    pub(crate) fn spawn<F>(endpoint: AdapterEndpoint, script: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let (mut incoming, sender) = endpoint.split();
        let adapter = Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(Vec::new())),
            sender: sender.clone(),
        };
        let script: Arc<Script> = Arc::new(script);
        let requests = adapter.requests.clone();
        let responses = adapter.responses.clone();
        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                if message["type"] == "response" {
                    responses.lock().unwrap().push(message);
                    continue;
                }
                let command = message["command"].as_str().unwrap_or_default().to_string();
                let arguments = message.get("arguments").cloned().unwrap_or(Value::Null);
                requests
                    .lock()
                    .unwrap()
                    .push((command.clone(), arguments.clone()));
                match script(&command, &arguments) {
                    Ok(body) => sender.respond(&message, body),
                    Err(error) => sender.reject(&message, &error),
                };
            }
        });
        adapter
    }

    /// Arguments of every `command` request, in arrival order.
    pub(crate) fn requests(&self, command: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub(crate) fn count(&self, command: &str) -> usize {
        self.requests(command).len()
    }

    /// Every command received, in arrival order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Responses the client sent to adapter-initiated requests.
    pub(crate) fn responses(&self) -> Vec<Value> {
        self.responses.lock().unwrap().clone()
    }

    pub(crate) fn event(&self, event: &str, body: Value) {
        self.sender.event(event, body);
    }

    pub(crate) fn reverse_request(&self, command: &str, arguments: Value) {
        self.sender.request(command, arguments);
    }
}

/// Hands out in-memory connections answered by [`ScriptedAdapter`]s.
pub(crate) struct ScriptedProvider {
    script: Arc<Script>,
    close_after_launch: bool,
    adapters: Mutex<Vec<ScriptedAdapter>>,
    stopped: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub(crate) fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Arc::new(script),
            close_after_launch: false,
            adapters: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        })
    }

    /// Adapters that answer everything with an empty body and hang up
    /// right after `launch`.
    pub(crate) fn closing() -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(|_, _| Ok(json!({}))),
            close_after_launch: true,
            adapters: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        })
    }

    /// The adapter of the `index`th started session.
    pub(crate) fn adapter(&self, index: usize) -> ScriptedAdapter {
        self.adapters.lock().unwrap()[index].clone()
    }

    pub(crate) fn started(&self) -> usize {
        self.adapters.lock().unwrap().len()
    }

    /// Session ids passed to `stop`, in order.
    pub(crate) fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl DebugAdapterProvider for ScriptedProvider {
    async fn start(
        &self,
        session_id: &str,
        _config: &DebugConfiguration,
    ) -> Result<Connection, DapError> {
        let (connection, endpoint) = Connection::in_memory(session_id);
        if self.close_after_launch {
            let (mut incoming, sender) = endpoint.split();
            tokio::spawn(async move {
                while let Some(message) = incoming.recv().await {
                    sender.respond(&message, json!({}));
                    if message["command"] == "launch" {
                        break;
                    }
                }
            });
            return Ok(connection);
        }
        let script = Arc::clone(&self.script);
        let adapter = ScriptedAdapter::spawn(endpoint, move |c, a| script(c, a));
        self.adapters.lock().unwrap().push(adapter);
        Ok(connection)
    }

    async fn stop(&self, session_id: &str) -> Result<(), DapError> {
        self.stopped.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

/// Let spawned tasks and coalescing windows run to completion.
pub(crate) async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
}
