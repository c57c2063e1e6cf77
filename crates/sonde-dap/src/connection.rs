//! Duplex message channel to a debug adapter.
//!
//! A [`Connection`] tracks pending requests by sequence number, routes
//! responses to waiting callers via oneshot channels, fans events out to
//! per-kind listener registries and answers adapter-initiated requests
//! (`runInTerminal`) through registered handlers.
//!
//! The connection works on decoded JSON values; byte framing lives in
//! [`crate::transport`] and is applied by whoever owns the adapter's pipes
//! (see [`crate::adapter::StdioAdapterProvider`]).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::emitter::{Emitter, Subscription};
use crate::error::DapError;
use crate::lock;
use crate::protocol::{Event, Request, Response};

/// Handler for a request initiated by the adapter.
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, DapError>> + Send + Sync>;

struct Inner {
    label: String,
    outgoing: mpsc::UnboundedSender<Value>,
    seq: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Response>>>,
    events: Mutex<HashMap<String, Emitter<Event>>>,
    handlers: Mutex<HashMap<String, RequestHandler>>,
    disposed: AtomicBool,
    closed: Emitter<()>,
}

/// A cheaply clonable handle to one adapter conversation.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap a pair of message channels and start dispatching `incoming`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        label: impl Into<String>,
        outgoing: mpsc::UnboundedSender<Value>,
        incoming: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        let inner = Arc::new(Inner {
            label: label.into(),
            outgoing,
            seq: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            closed: Emitter::new(),
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), incoming));
        Self { inner }
    }

    /// A connection whose far end is an in-process [`AdapterEndpoint`].
    pub fn in_memory(label: impl Into<String>) -> (Self, AdapterEndpoint) {
        let (to_adapter, from_client) = mpsc::unbounded_channel();
        let (to_client, from_adapter) = mpsc::unbounded_channel();
        let connection = Self::new(label, to_adapter, from_adapter);
        let endpoint = AdapterEndpoint {
            incoming: from_client,
            sender: AdapterSender {
                outgoing: to_client,
                seq: Arc::new(AtomicI64::new(0)),
            },
        };
        (connection, endpoint)
    }

    /// Label used in log records, usually the session id.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Send a request and wait for the adapter's response body.
    ///
    /// A missing body is returned as `Value::Null`. An error response
    /// becomes [`DapError::Rejected`].
    pub async fn send_request<A: Serialize>(
        &self,
        command: &str,
        arguments: A,
    ) -> Result<Value, DapError> {
        if self.is_disposed() {
            return Err(DapError::Terminated);
        }
        let arguments = serde_json::to_value(arguments)
            .map_err(|e| DapError::Transport(format!("cannot encode '{command}' arguments: {e}")))?;
        let seq = self.inner.next_seq();
        let request = Request {
            seq,
            message_type: "request".into(),
            command: command.to_string(),
            arguments: (!arguments.is_null()).then_some(arguments),
        };
        let message = serde_json::to_value(&request)
            .map_err(|e| DapError::Transport(format!("cannot encode '{command}': {e}")))?;

        let rx = {
            let (tx, rx) = oneshot::channel();
            lock(&self.inner.pending).insert(seq, tx);
            rx
        };
        tracing::debug!(session = %self.inner.label, command, seq, "sending request");
        if self.inner.outgoing.send(message).is_err() {
            lock(&self.inner.pending).remove(&seq);
            return Err(DapError::Transport("adapter channel closed".into()));
        }

        let response = rx.await.map_err(|_| DapError::Terminated)?;
        if response.success {
            Ok(response.body.unwrap_or(Value::Null))
        } else {
            Err(DapError::Rejected {
                command: command.to_string(),
                message: response.failure_message(),
            })
        }
    }

    /// Send a request and decode the response body.
    ///
    /// A missing body decodes as an empty object.
    pub async fn request<A: Serialize, R: DeserializeOwned>(
        &self,
        command: &str,
        arguments: A,
    ) -> Result<R, DapError> {
        let body = match self.send_request(command, arguments).await? {
            Value::Null => Value::Object(serde_json::Map::new()),
            body => body,
        };
        serde_json::from_value(body)
            .map_err(|e| DapError::InvalidResponse(format!("'{command}' body: {e}")))
    }

    /// Listen to events of one kind, e.g. `"stopped"`.
    pub fn on_event<F>(&self, kind: &str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let emitter = lock(&self.inner.events)
            .entry(kind.to_string())
            .or_default()
            .clone();
        emitter.subscribe(listener)
    }

    /// Answer adapter-initiated requests for `command`.
    pub fn on_request<F, Fut>(&self, command: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DapError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |args| handler(args).boxed());
        lock(&self.inner.handlers).insert(command.to_string(), handler);
    }

    /// Fires once when the adapter side goes away without a `dispose`.
    pub fn on_close<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.closed.subscribe(listener)
    }

    /// Whether the connection has been disposed or has closed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// How many requests are waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Stop dispatching. Pending requests fail with [`DapError::Terminated`].
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown();
        tracing::debug!(session = %self.inner.label, "connection disposed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.inner.label)
            .field("disposed", &self.is_disposed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Inner {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn shutdown(&self) {
        lock(&self.pending).clear();
        let emitters: Vec<Emitter<Event>> = lock(&self.events).drain().map(|(_, e)| e).collect();
        for emitter in emitters {
            emitter.clear();
        }
        lock(&self.handlers).clear();
    }

    fn dispatch(self: &Arc<Self>, message: Value) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        match message.get("type").and_then(Value::as_str) {
            Some("response") => match serde_json::from_value::<Response>(message) {
                Ok(response) => {
                    let sender = lock(&self.pending).remove(&response.request_seq);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(response);
                        }
                        None => tracing::warn!(
                            session = %self.label,
                            "received response for unknown request seq: {}",
                            response.request_seq
                        ),
                    }
                }
                Err(e) => tracing::warn!(session = %self.label, "malformed response: {e}"),
            },
            Some("event") => match serde_json::from_value::<Event>(message) {
                Ok(event) => {
                    tracing::debug!(session = %self.label, event = %event.event, "received event");
                    let emitter = lock(&self.events).get(&event.event).cloned();
                    if let Some(emitter) = emitter {
                        emitter.fire(&event);
                    }
                }
                Err(e) => tracing::warn!(session = %self.label, "malformed event: {e}"),
            },
            Some("request") => match serde_json::from_value::<Request>(message) {
                Ok(request) => self.answer(request),
                Err(e) => tracing::warn!(session = %self.label, "malformed request: {e}"),
            },
            other => {
                tracing::warn!(session = %self.label, "unknown message type: {:?}", other);
            }
        }
    }

    fn answer(self: &Arc<Self>, request: Request) {
        let handler = lock(&self.handlers).get(&request.command).cloned();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => handler(request.arguments).await,
                None => Err(DapError::Transport(format!(
                    "unrecognized request '{}'",
                    request.command
                ))),
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut response = json!({
                "seq": inner.next_seq(),
                "type": "response",
                "request_seq": request.seq,
                "command": request.command,
                "success": result.is_ok(),
            });
            match result {
                Ok(body) => response["body"] = body,
                Err(e) => {
                    tracing::warn!(session = %inner.label, command = %request.command, "reverse request failed: {e}");
                    response["message"] = Value::String(e.user_message());
                }
            }
            let _ = inner.outgoing.send(response);
        });
    }
}

async fn read_loop(inner: Weak<Inner>, mut incoming: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(message);
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner.disposed.swap(true, Ordering::SeqCst) {
        return;
    }
    tracing::info!(session = %inner.label, "adapter connection closed");
    inner.shutdown();
    inner.closed.fire(&());
    inner.closed.clear();
}

/// The adapter's side of an in-memory [`Connection`].
#[derive(Debug)]
pub struct AdapterEndpoint {
    incoming: mpsc::UnboundedReceiver<Value>,
    sender: AdapterSender,
}

impl AdapterEndpoint {
    /// Next message sent by the client, `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.incoming.recv().await
    }

    /// A clonable handle for sending messages to the client.
    pub fn sender(&self) -> AdapterSender {
        self.sender.clone()
    }

    /// Split into the client-message stream and a sender.
    pub fn split(self) -> (mpsc::UnboundedReceiver<Value>, AdapterSender) {
        (self.incoming, self.sender)
    }
}

/// Sends adapter-side messages to the client.
#[derive(Debug, Clone)]
pub struct AdapterSender {
    outgoing: mpsc::UnboundedSender<Value>,
    seq: Arc<AtomicI64>,
}

impl AdapterSender {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send a raw message. Returns false once the client side is gone.
    pub fn send(&self, message: Value) -> bool {
        self.outgoing.send(message).is_ok()
    }

    /// Send an event.
    pub fn event(&self, event: &str, body: Value) -> bool {
        self.send(json!({
            "seq": self.next_seq(),
            "type": "event",
            "event": event,
            "body": body,
        }))
    }

    /// Answer `request` successfully.
    pub fn respond(&self, request: &Value, body: Value) -> bool {
        self.send(json!({
            "seq": self.next_seq(),
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": true,
            "body": body,
        }))
    }

    /// Answer `request` with an error.
    pub fn reject(&self, request: &Value, message: &str) -> bool {
        self.send(json!({
            "seq": self.next_seq(),
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": false,
            "message": message,
        }))
    }

    /// Send an adapter-initiated request.
    pub fn request(&self, command: &str, arguments: Value) -> bool {
        self.send(json!({
            "seq": self.next_seq(),
            "type": "request",
            "command": command,
            "arguments": arguments,
        }))
    }
}
