//! One conversation with a debug adapter.
//!
//! A [`DebugSession`] reacts to the adapter's events, keeps the thread list
//! and the installed breakpoints of its adapter, and derives its
//! [`SessionState`] from them. Event handlers only schedule work: thread
//! refreshes go through a [`Coalescer`], breakpoint pushes are spawned and
//! serialized per URI.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use url::Url;

use crate::adapter::{TerminalLauncher, TerminalRequest};
use crate::breakpoint::{BreakpointFilter, BreakpointStore, DebugBreakpoint};
use crate::capabilities::DapCapabilities;
use crate::configuration::DebugConfiguration;
use crate::connection::Connection;
use crate::emitter::{Emitter, Subscription};
use crate::error::DapError;
use crate::lock;
use crate::model::{DebugStackFrame, DebugThread, SessionContext};
use crate::protocol::{
    self, Capabilities, CapabilitiesEventBody, CompletionItem, CompletionsArguments,
    CompletionsResponseBody, ContinuedEventBody, DisconnectArguments, EvaluateArguments,
    EvaluateResponseBody, Event, InitializeRequestArguments, OutputEventBody,
    RunInTerminalRequestArguments, RunInTerminalResponseBody, SetBreakpointsArguments,
    SetBreakpointsResponseBody, StoppedEventBody, ThreadEventBody, ThreadsResponseBody,
};
use crate::refresh::{Coalescer, Ticket, DEFAULT_REFRESH_DELAY};

/// Tunables of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Coalescing window of the `threads` refresh.
    pub thread_refresh_delay: Duration,
    /// Coalescing window of per-thread `stackTrace` refreshes.
    pub stack_refresh_delay: Duration,
    pub client_id: String,
    pub client_name: String,
    pub locale: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            thread_refresh_delay: DEFAULT_REFRESH_DELAY,
            stack_refresh_delay: DEFAULT_REFRESH_DELAY,
            client_id: "sonde".into(),
            client_name: "Sonde".into(),
            locale: "en-US".into(),
        }
    }
}

/// Derived state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The connection is gone.
    Inactive,
    Running,
    Stopped,
}

#[derive(Default)]
struct SessionData {
    capabilities: Capabilities,
    threads: Vec<Arc<DebugThread>>,
    current_thread: Option<Arc<DebugThread>>,
    current_thread_sub: Option<Subscription>,
    breakpoints: BTreeMap<Url, Vec<DebugBreakpoint>>,
    initialized: bool,
    disposed: bool,
}

/// A debug session.
pub struct DebugSession {
    id: String,
    configuration: DebugConfiguration,
    ctx: Arc<SessionContext>,
    store: Arc<BreakpointStore>,
    terminal: Option<Arc<dyn TerminalLauncher>>,
    options: SessionOptions,
    weak: Weak<DebugSession>,
    data: Mutex<SessionData>,
    subscriptions: Mutex<Vec<Subscription>>,
    thread_refresh: Coalescer<Vec<StoppedEventBody>>,
    breakpoint_locks: Mutex<HashMap<Url, Arc<tokio::sync::Mutex<()>>>>,
    did_change: Emitter<()>,
    did_change_breakpoints: Emitter<Url>,
    output: Emitter<OutputEventBody>,
}

impl DebugSession {
    /// Create a session on an established connection and start listening
    /// to its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: impl Into<String>,
        configuration: DebugConfiguration,
        connection: Connection,
        store: Arc<BreakpointStore>,
        terminal: Option<Arc<dyn TerminalLauncher>>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let id = id.into();
        let ctx = Arc::new(SessionContext::new(
            id.clone(),
            connection,
            options.stack_refresh_delay,
        ));
        let session = Arc::new_cyclic(|weak: &Weak<DebugSession>| {
            let job_weak = weak.clone();
            let thread_refresh = Coalescer::new(
                options.thread_refresh_delay,
                move |stops: Vec<StoppedEventBody>, ticket| {
                    let weak = job_weak.clone();
                    async move {
                        if let Some(session) = weak.upgrade() {
                            session.refresh_threads(stops, ticket).await;
                        }
                    }
                    .boxed()
                },
            );
            Self {
                id,
                configuration,
                ctx,
                store,
                terminal,
                options,
                weak: weak.clone(),
                data: Mutex::new(SessionData::default()),
                subscriptions: Mutex::new(Vec::new()),
                thread_refresh,
                breakpoint_locks: Mutex::new(HashMap::new()),
                did_change: Emitter::new(),
                did_change_breakpoints: Emitter::new(),
                output: Emitter::new(),
            }
        });
        session.wire();
        session
    }

    fn wire(self: &Arc<Self>) {
        let subscriptions = vec![
            self.listen("initialized", |session, _: Value| {
                lock(&session.data).initialized = true;
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    if let Err(e) = session.configure().await {
                        tracing::warn!(session = %session.id, "configuration failed: {e}");
                    }
                });
            }),
            self.listen("stopped", |session, body: StoppedEventBody| {
                session.thread_refresh.request_with(|pending| {
                    let mut stops = pending.unwrap_or_default();
                    stops.push(body);
                    stops
                });
            }),
            self.listen("continued", |session, body: ContinuedEventBody| {
                if body.all_threads_continued == Some(false) {
                    session
                        .thread_refresh
                        .update_pending(|stops| stops.retain(|s| s.thread_id != Some(body.thread_id)));
                    session.clear_thread(body.thread_id);
                } else {
                    session.thread_refresh.invalidate();
                    session.clear_threads();
                }
            }),
            self.listen("thread", |session, body: ThreadEventBody| {
                match body.reason.as_str() {
                    "started" => session.request_thread_refresh(),
                    "exited" => session.clear_thread(body.thread_id),
                    _ => {}
                }
            }),
            self.listen("capabilities", |session, body: CapabilitiesEventBody| {
                lock(&session.data).capabilities.merge(&body.capabilities);
                session.did_change.fire(&());
            }),
            self.listen("output", |session, body: OutputEventBody| {
                session.output.fire(&body);
            }),
            self.store.on_did_change({
                let weak = Arc::downgrade(self);
                move |uri: &Url| {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    if !lock(&session.data).initialized {
                        return;
                    }
                    let Ok(handle) = tokio::runtime::Handle::try_current() else {
                        tracing::warn!(session = %session.id, %uri, "breakpoint change outside a runtime not pushed");
                        return;
                    };
                    let uri = uri.clone();
                    handle.spawn(async move {
                        session.update_breakpoints(Some(&uri), true).await;
                    });
                }
            }),
        ];
        *lock(&self.subscriptions) = subscriptions;

        let terminal = self.terminal.clone();
        self.ctx
            .connection
            .on_request("runInTerminal", move |arguments| {
                let terminal = terminal.clone();
                async move {
                    let terminal = terminal.ok_or_else(|| {
                        DapError::Transport("no terminal available for runInTerminal".into())
                    })?;
                    let raw: RunInTerminalRequestArguments =
                        serde_json::from_value(arguments.unwrap_or(Value::Null)).map_err(|e| {
                            DapError::InvalidResponse(format!("runInTerminal arguments: {e}"))
                        })?;
                    let process_id = terminal.run(TerminalRequest::try_from(raw)?).await?;
                    serde_json::to_value(RunInTerminalResponseBody {
                        process_id: Some(process_id),
                        shell_process_id: None,
                    })
                    .map_err(|e| DapError::Transport(e.to_string()))
                }
            });
    }

    fn listen<B, F>(self: &Arc<Self>, kind: &str, handler: F) -> Subscription
    where
        B: DeserializeOwned,
        F: Fn(&Arc<DebugSession>, B) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        self.ctx.connection.on_event(kind, move |event| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            match event.parse_body::<B>() {
                Ok(body) => handler(&session, body),
                Err(e) => {
                    tracing::warn!(session = %session.id, event = %event.event, "malformed event body: {e}")
                }
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn configuration(&self) -> &DebugConfiguration {
        &self.configuration
    }

    pub fn connection(&self) -> &Connection {
        &self.ctx.connection
    }

    pub(crate) fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    /// Capabilities negotiated so far.
    pub fn capabilities(&self) -> Capabilities {
        lock(&self.data).capabilities.clone()
    }

    pub fn features(&self) -> DapCapabilities {
        DapCapabilities::from(&lock(&self.data).capabilities)
    }

    pub fn state(&self) -> SessionState {
        if self.ctx.connection.is_disposed() {
            return SessionState::Inactive;
        }
        let data = lock(&self.data);
        let stopped = match &data.current_thread {
            Some(thread) => thread.is_stopped(),
            None => data.threads.iter().any(|t| t.is_stopped()),
        };
        if stopped {
            SessionState::Stopped
        } else {
            SessionState::Running
        }
    }

    // -- handshake ---------------------------------------------------------

    /// Send `initialize` and take the adapter's capabilities.
    pub async fn initialize(&self) -> Result<(), DapError> {
        lock(&self.data).initialized = false;
        let arguments = InitializeRequestArguments {
            client_id: Some(self.options.client_id.clone()),
            client_name: Some(self.options.client_name.clone()),
            adapter_id: self.configuration.debug_type.clone(),
            locale: Some(self.options.locale.clone()),
            lines_start_at1: Some(true),
            columns_start_at1: Some(true),
            path_format: Some("path".into()),
            supports_variable_type: Some(false),
            supports_variable_paging: Some(false),
            supports_run_in_terminal_request: Some(true),
        };
        let capabilities: Capabilities =
            self.ctx.connection.request("initialize", arguments).await?;
        lock(&self.data).capabilities.merge(&capabilities);
        Ok(())
    }

    /// Initialize, then send the configuration's `launch` or `attach`.
    ///
    /// `restart` is the adapter's restart data when the session restarts.
    pub async fn launch_or_attach(&self, restart: Option<&Value>) -> Result<(), DapError> {
        let kind = self.configuration.request_kind()?;
        self.initialize().await?;
        tracing::info!(session = %self.id, request = kind.command(), "starting debuggee");
        self.ctx
            .connection
            .send_request(kind.command(), self.configuration.request_arguments(kind, restart))
            .await?;
        Ok(())
    }

    /// Push every breakpoint, finish configuration and load the threads.
    pub async fn configure(&self) -> Result<(), DapError> {
        self.update_breakpoints(None, false).await;
        self.ctx
            .connection
            .send_request("configurationDone", json!({}))
            .await?;
        self.request_thread_refresh();
        Ok(())
    }

    /// Ask the adapter to end the session. A no-op once inactive.
    pub async fn disconnect(&self, arguments: DisconnectArguments) -> Result<(), DapError> {
        if self.state() == SessionState::Inactive {
            return Ok(());
        }
        self.ctx.connection.send_request("disconnect", arguments).await?;
        Ok(())
    }

    /// Detach every listener, drop threads and breakpoints, then close the
    /// connection. Calling it again is a no-op.
    pub fn dispose(&self) {
        {
            let mut data = lock(&self.data);
            if std::mem::replace(&mut data.disposed, true) {
                return;
            }
        }
        self.did_change.clear();
        self.did_change_breakpoints.clear();
        self.output.clear();

        self.clear_breakpoints();
        self.thread_refresh.invalidate();
        let (threads, sub) = {
            let mut data = lock(&self.data);
            data.current_thread = None;
            (
                std::mem::take(&mut data.threads),
                data.current_thread_sub.take(),
            )
        };
        drop(sub);
        for thread in threads {
            thread.clear();
        }

        self.ctx.connection.dispose();
        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        drop(subscriptions);
        tracing::debug!(session = %self.id, "session disposed");
    }

    // -- threads -----------------------------------------------------------

    /// Threads in the order the adapter listed them.
    pub fn threads(&self) -> Vec<Arc<DebugThread>> {
        lock(&self.data).threads.clone()
    }

    pub fn thread(&self, id: i64) -> Option<Arc<DebugThread>> {
        lock(&self.data)
            .threads
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    pub fn running_threads(&self) -> Vec<Arc<DebugThread>> {
        self.threads().into_iter().filter(|t| !t.is_stopped()).collect()
    }

    pub fn stopped_threads(&self) -> Vec<Arc<DebugThread>> {
        self.threads().into_iter().filter(|t| t.is_stopped()).collect()
    }

    /// The focused thread. Only a stopped thread is ever current.
    pub fn current_thread(&self) -> Option<Arc<DebugThread>> {
        lock(&self.data).current_thread.clone()
    }

    pub fn current_frame(&self) -> Option<Arc<DebugStackFrame>> {
        self.current_thread().and_then(|t| t.current_frame())
    }

    /// Focus a stopped thread. Returns false, leaving the focus alone, when
    /// `id` is unknown or running.
    pub fn select_thread(&self, id: i64) -> bool {
        let Some(thread) = self.thread(id).filter(|t| t.is_stopped()) else {
            return false;
        };
        self.set_current_thread(Some(thread));
        true
    }

    /// Focus a frame of the current thread.
    pub fn select_frame(&self, frame_id: i64) -> bool {
        self.current_thread()
            .is_some_and(|t| t.select_frame(frame_id))
    }

    fn request_thread_refresh(&self) {
        self.thread_refresh
            .request_with(|pending| pending.unwrap_or_default());
    }

    async fn refresh_threads(&self, stops: Vec<StoppedEventBody>, ticket: Ticket) {
        let result: Result<ThreadsResponseBody, DapError> =
            self.ctx.connection.request("threads", ()).await;
        match result {
            Ok(body) => {
                // Stops superseded by a `continued` while the request was out.
                let stops = if ticket.is_current() { stops } else { Vec::new() };
                self.update_threads(body.threads, stops);
            }
            Err(e) => tracing::warn!(session = %self.id, "threads request failed: {e}"),
        }
    }

    fn update_threads(&self, raws: Vec<protocol::Thread>, stops: Vec<StoppedEventBody>) {
        let threads = {
            let mut data = lock(&self.data);
            if data.disposed {
                return;
            }
            let mut previous: HashMap<i64, Arc<DebugThread>> =
                data.threads.drain(..).map(|t| (t.id(), t)).collect();
            data.threads = raws
                .into_iter()
                .map(|raw| match previous.remove(&raw.id) {
                    Some(thread) => {
                        thread.update(raw);
                        thread
                    }
                    None => DebugThread::new(Arc::clone(&self.ctx), raw),
                })
                .collect();
            data.threads.clone()
        };
        for stop in &stops {
            if stop.all_threads_stopped == Some(true) {
                for thread in &threads {
                    thread.set_stopped(stop.clone());
                }
            } else if let Some(thread) = threads.iter().find(|t| Some(t.id()) == stop.thread_id) {
                thread.set_stopped(stop.clone());
            }
        }
        self.update_current_thread(stops.last());
    }

    fn update_current_thread(&self, stop: Option<&StoppedEventBody>) {
        let thread = {
            let data = lock(&self.data);
            let mut id = data.current_thread.as_ref().map(|t| t.id());
            if let Some(stop) = stop {
                if stop.preserve_focus_hint != Some(true) && stop.thread_id.is_some() {
                    id = stop.thread_id;
                }
            }
            id.and_then(|id| data.threads.iter().find(|t| t.id() == id))
                .filter(|t| t.is_stopped())
                .or_else(|| data.threads.iter().find(|t| t.is_stopped()))
                .cloned()
        };
        self.set_current_thread(thread);
    }

    fn set_current_thread(&self, thread: Option<Arc<DebugThread>>) {
        let thread = thread.filter(|t| t.is_stopped());
        let sub = thread.as_ref().map(|t| {
            let weak = self.weak.clone();
            t.on_did_change(move |_| {
                if let Some(session) = weak.upgrade() {
                    session.did_change.fire(&());
                }
            })
        });
        let previous = {
            let mut data = lock(&self.data);
            if data.disposed {
                return;
            }
            data.current_thread = thread.clone();
            std::mem::replace(&mut data.current_thread_sub, sub)
        };
        drop(previous);
        self.did_change.fire(&());
        if let Some(thread) = thread {
            thread.resolve_frames();
        }
    }

    fn clear_threads(&self) {
        for thread in self.threads() {
            thread.clear();
        }
        self.update_current_thread(None);
    }

    fn clear_thread(&self, id: i64) {
        if let Some(thread) = self.thread(id) {
            thread.clear();
        }
        self.update_current_thread(None);
    }

    /// Pause every running thread. Failures are logged per thread.
    pub async fn pause_all(&self) {
        let threads = self.running_threads();
        join_all(threads.iter().map(|thread| async move {
            if let Err(e) = thread.pause().await {
                tracing::warn!(session = %self.id, thread = thread.id(), "pause failed: {e}");
            }
        }))
        .await;
    }

    /// Resume every stopped thread. Failures are logged per thread.
    pub async fn continue_all(&self) {
        let threads = self.stopped_threads();
        join_all(threads.iter().map(|thread| async move {
            if let Err(e) = thread.continue_execution().await {
                tracing::warn!(session = %self.id, thread = thread.id(), "continue failed: {e}");
            }
        }))
        .await;
    }

    // -- evaluation --------------------------------------------------------

    /// Evaluate `expression` in the current frame.
    pub async fn evaluate(
        &self,
        expression: &str,
        context: &str,
    ) -> Result<EvaluateResponseBody, DapError> {
        let arguments = EvaluateArguments {
            expression: expression.to_string(),
            frame_id: self.current_frame().map(|f| f.id()),
            context: Some(context.to_string()),
        };
        self.ctx.connection.request("evaluate", arguments).await
    }

    /// Completion proposals for `text` at `column`. Empty when the adapter
    /// has no completions support.
    pub async fn completions(
        &self,
        text: &str,
        column: i64,
        line: Option<i64>,
    ) -> Result<Vec<CompletionItem>, DapError> {
        if !self.features().completions {
            return Ok(Vec::new());
        }
        let arguments = CompletionsArguments {
            frame_id: self.current_frame().map(|f| f.id()),
            text: text.to_string(),
            column,
            line,
        };
        let body: CompletionsResponseBody =
            self.ctx.connection.request("completions", arguments).await?;
        Ok(body.targets)
    }

    // -- breakpoints -------------------------------------------------------

    /// Installed breakpoints, of one URI or of all.
    pub fn breakpoints(&self, uri: Option<&Url>) -> Vec<DebugBreakpoint> {
        let data = lock(&self.data);
        match uri {
            Some(uri) => data.breakpoints.get(uri).cloned().unwrap_or_default(),
            None => data.breakpoints.values().flatten().cloned().collect(),
        }
    }

    /// URIs this session has pushed breakpoints for.
    pub fn breakpoint_uris(&self) -> Vec<Url> {
        lock(&self.data).breakpoints.keys().cloned().collect()
    }

    /// Push the enabled breakpoints of `uri`, or of every URI in the store.
    /// Failures are logged per URI.
    pub async fn update_breakpoints(&self, uri: Option<&Url>, source_modified: bool) {
        let uris = match uri {
            Some(uri) => vec![uri.clone()],
            None => self.store.uris(),
        };
        for uri in uris {
            if let Err(e) = self.push_breakpoints(&uri, source_modified).await {
                tracing::warn!(session = %self.id, %uri, "setBreakpoints failed: {e}");
            }
        }
    }

    async fn push_breakpoints(&self, uri: &Url, source_modified: bool) -> Result<(), DapError> {
        let gate = Arc::clone(lock(&self.breakpoint_locks).entry(uri.clone()).or_default());
        let _guard = gate.lock().await;

        let breakpoints = self
            .store
            .list(&BreakpointFilter::uri(uri.clone()).enabled(true));
        let arguments = SetBreakpointsArguments {
            source: self.ctx.sources.to_source(uri),
            breakpoints: Some(breakpoints.iter().map(|bp| bp.raw.clone()).collect()),
            source_modified: Some(source_modified),
        };
        let body: SetBreakpointsResponseBody =
            self.ctx.connection.request("setBreakpoints", arguments).await?;

        let mut verdicts = body.breakpoints.into_iter();
        let installed: Vec<DebugBreakpoint> = breakpoints
            .into_iter()
            .map(|data| match verdicts.next() {
                Some(raw) => DebugBreakpoint::installed(data, raw),
                None => DebugBreakpoint::uninstalled(data),
            })
            .collect();
        {
            let mut data = lock(&self.data);
            if data.disposed {
                return Ok(());
            }
            data.breakpoints.insert(uri.clone(), installed);
        }
        self.did_change_breakpoints.fire(uri);
        Ok(())
    }

    fn clear_breakpoints(&self) {
        let uris: Vec<Url> = std::mem::take(&mut lock(&self.data).breakpoints)
            .into_keys()
            .collect();
        for uri in &uris {
            self.did_change_breakpoints.fire(uri);
        }
    }

    // -- listeners ---------------------------------------------------------

    /// Fires when threads, the current thread or its frames change.
    pub fn on_did_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.did_change.subscribe(listener)
    }

    /// Fires with the URI whose installed breakpoints changed.
    pub fn on_did_change_breakpoints<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Url) + Send + Sync + 'static,
    {
        self.did_change_breakpoints.subscribe(listener)
    }

    /// Debuggee and adapter output.
    pub fn on_output<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OutputEventBody) + Send + Sync + 'static,
    {
        self.output.subscribe(listener)
    }

    /// Raw adapter events of one kind.
    pub fn on_event<F>(&self, kind: &str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.ctx.connection.on_event(kind, listener)
    }

    /// Fires when the adapter's channel closes on its own.
    pub fn on_close<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.ctx.connection.on_close(listener)
    }
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.id)
            .field("configuration", &self.configuration.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::breakpoint::Breakpoint;
    use crate::test_support::{settle, ScriptedAdapter};

    fn default_script(command: &str, args: &Value) -> Result<Value, String> {
        match command {
            "initialize" => Ok(json!({"supportsConfigurationDoneRequest": true})),
            "threads" => Ok(json!({"threads": [
                {"id": 1, "name": "main"},
                {"id": 2, "name": "worker"}
            ]})),
            "stackTrace" => {
                let thread = args["threadId"].as_i64().unwrap_or_default();
                Ok(json!({"stackFrames": [
                    {"id": thread * 100, "name": "top", "line": 3, "column": 1},
                    {"id": thread * 100 + 1, "name": "caller", "line": 9, "column": 1}
                ]}))
            }
            "setBreakpoints" => {
                let count = args["breakpoints"].as_array().map_or(0, Vec::len);
                let verdicts: Vec<Value> = (0..count)
                    .map(|i| json!({"id": i + 1, "verified": i != 1}))
                    .collect();
                Ok(json!({"breakpoints": verdicts}))
            }
            "evaluate" => Ok(json!({"result": "42", "type": "int", "variablesReference": 0})),
            "pause" if args["threadId"] == 2 => Err("cannot pause worker".into()),
            _ => Ok(json!({})),
        }
    }

    fn session_with<F>(
        store: Arc<BreakpointStore>,
        terminal: Option<Arc<dyn TerminalLauncher>>,
        script: F,
    ) -> (Arc<DebugSession>, ScriptedAdapter)
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let (connection, endpoint) = Connection::in_memory("1");
        let adapter = ScriptedAdapter::spawn(endpoint, script);
        let session = DebugSession::new(
            "1",
            DebugConfiguration::new("node", "app", "launch")
                .with_field("program", json!("/work/app.js")),
            connection,
            store,
            terminal,
            SessionOptions::default(),
        );
        (session, adapter)
    }

    fn session() -> (Arc<DebugSession>, ScriptedAdapter) {
        session_with(Arc::new(BreakpointStore::new()), None, default_script)
    }

    fn stopped(thread_id: i64) -> Value {
        json!({"reason": "breakpoint", "threadId": thread_id})
    }

    fn uri(path: &str) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn session_initialized_pushes_breakpoints_then_configures() {
        let store = Arc::new(BreakpointStore::new());
        let file = uri("/work/file.ts");
        store.set_all(
            &file,
            vec![
                Breakpoint::new(file.clone(), 3),
                Breakpoint::new(file.clone(), 5).with_enabled(false),
                Breakpoint::new(file.clone(), 8),
                Breakpoint::new(file.clone(), 13),
            ],
        );
        let (session, adapter) = session_with(store, None, default_script);
        adapter.event("initialized", json!({}));
        settle().await;

        assert_eq!(
            adapter.commands(),
            vec!["setBreakpoints", "configurationDone", "threads"]
        );
        let sent = &adapter.requests("setBreakpoints")[0];
        assert_eq!(sent["source"]["path"], "/work/file.ts");
        assert_eq!(sent["sourceModified"], false);
        assert_eq!(
            sent["breakpoints"],
            json!([{"line": 3}, {"line": 8}, {"line": 13}])
        );

        let installed = session.breakpoints(Some(&file));
        let verified: Vec<(i64, bool)> =
            installed.iter().map(|bp| (bp.line(), bp.verified())).collect();
        assert_eq!(verified, vec![(3, true), (8, false), (13, true)]);
        assert_eq!(session.breakpoint_uris(), vec![file]);
        assert_eq!(session.threads().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_stop_burst_refreshes_threads_once() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        adapter.event("stopped", stopped(2));
        settle().await;

        assert_eq!(adapter.count("threads"), 1);
        let current = session.current_thread().unwrap();
        assert_eq!(current.id(), 2);
        assert!(session.thread(1).unwrap().is_stopped());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(adapter.requests("stackTrace")[0]["threadId"], 2);
        assert_eq!(session.current_frame().unwrap().id(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn session_preserve_focus_hint_keeps_current_thread() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        settle().await;
        adapter.event(
            "stopped",
            json!({"reason": "step", "threadId": 2, "preserveFocusHint": true}),
        );
        settle().await;
        assert_eq!(session.current_thread().unwrap().id(), 1);
        assert!(session.thread(2).unwrap().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn session_focus_falls_back_to_a_stopped_thread() {
        let (session, adapter) = session();
        adapter.event(
            "stopped",
            json!({"reason": "step", "threadId": 2, "preserveFocusHint": true}),
        );
        settle().await;
        // Thread 1 comes first but is running.
        assert!(!session.thread(1).unwrap().is_stopped());
        assert_eq!(session.current_thread().unwrap().id(), 2);
        assert_eq!(session.current_frame().unwrap().id(), 200);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn session_all_threads_stopped_marks_every_thread() {
        let (session, adapter) = session();
        adapter.event(
            "stopped",
            json!({"reason": "pause", "threadId": 1, "allThreadsStopped": true}),
        );
        settle().await;
        assert_eq!(session.stopped_threads().len(), 2);
        assert!(session.running_threads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_thread_identity_survives_refresh() {
        let (session, adapter) = session();
        adapter.event("thread", json!({"reason": "started", "threadId": 1}));
        settle().await;
        let first = session.thread(1).unwrap();
        adapter.event("thread", json!({"reason": "started", "threadId": 2}));
        settle().await;
        assert_eq!(adapter.count("threads"), 2);
        assert!(Arc::ptr_eq(&first, &session.thread(1).unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn session_continued_clears_all_threads() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        settle().await;
        let thread = session.current_thread().unwrap();
        adapter.event("continued", json!({"threadId": 1}));
        settle().await;
        assert!(session.current_thread().is_none());
        assert!(!thread.is_stopped());
        assert!(session.stopped_threads().is_empty());
        assert!(thread.frames().is_empty());
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn session_continued_inside_window_drops_stop() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        adapter.event("continued", json!({"threadId": 1}));
        settle().await;
        assert_eq!(adapter.count("threads"), 0);
        assert!(session.current_thread().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_single_thread_continued() {
        let (session, adapter) = session();
        adapter.event(
            "stopped",
            json!({"reason": "pause", "threadId": 1, "allThreadsStopped": true}),
        );
        settle().await;
        adapter.event(
            "continued",
            json!({"threadId": 1, "allThreadsContinued": false}),
        );
        settle().await;
        assert!(!session.thread(1).unwrap().is_stopped());
        assert!(session.thread(2).unwrap().is_stopped());
        // A resumed thread loses focus; the other stopped thread still
        // makes the session stopped.
        assert!(session.current_thread().is_none());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn session_thread_exited_clears_it() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        settle().await;
        adapter.event("thread", json!({"reason": "exited", "threadId": 1}));
        settle().await;
        assert!(!session.thread(1).unwrap().is_stopped());
        assert!(session.current_thread().is_none());
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn session_change_fires_for_thread_updates() {
        let (session, adapter) = session();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let _sub = session.on_did_change(move |_| *h.lock().unwrap() += 1);
        adapter.event("stopped", stopped(1));
        settle().await;
        assert!(*hits.lock().unwrap() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_capabilities_event_merges() {
        let (session, adapter) = session();
        session.initialize().await.unwrap();
        adapter.event(
            "capabilities",
            json!({"capabilities": {"supportsCompletionsRequest": true}}),
        );
        settle().await;
        let features = session.features();
        assert!(features.configuration_done);
        assert!(features.completions);
    }

    #[tokio::test]
    async fn session_initialize_arguments() {
        let (session, adapter) = session();
        session.initialize().await.unwrap();
        let args = &adapter.requests("initialize")[0];
        assert_eq!(args["clientID"], "sonde");
        assert_eq!(args["clientName"], "Sonde");
        assert_eq!(args["adapterID"], "node");
        assert_eq!(args["locale"], "en-US");
        assert_eq!(args["linesStartAt1"], true);
        assert_eq!(args["columnsStartAt1"], true);
        assert_eq!(args["pathFormat"], "path");
        assert_eq!(args["supportsRunInTerminalRequest"], true);
        assert!(session.capabilities().supports_configuration_done_request == Some(true));
    }

    #[tokio::test]
    async fn session_launch_sends_configuration() {
        let (session, adapter) = session();
        session.launch_or_attach(None).await.unwrap();
        assert_eq!(adapter.commands(), vec!["initialize", "launch"]);
        let args = &adapter.requests("launch")[0];
        assert_eq!(args["program"], "/work/app.js");
        assert_eq!(args["__restart"], false);
        assert_eq!(args["noDebug"], false);
    }

    #[tokio::test]
    async fn session_launch_failure_is_reported() {
        let (session, _adapter) = session_with(
            Arc::new(BreakpointStore::new()),
            None,
            |command, args| match command {
                "launch" => Err("program does not exist".into()),
                _ => default_script(command, args),
            },
        );
        let err = session.launch_or_attach(None).await.unwrap_err();
        assert_eq!(err.user_message(), "program does not exist");
    }

    #[tokio::test]
    async fn session_unsupported_request_sends_nothing() {
        let (connection, endpoint) = Connection::in_memory("1");
        let adapter = ScriptedAdapter::spawn(endpoint, default_script);
        let session = DebugSession::new(
            "1",
            DebugConfiguration::new("node", "app", "restart"),
            connection,
            Arc::new(BreakpointStore::new()),
            None,
            SessionOptions::default(),
        );
        let err = session.launch_or_attach(None).await.unwrap_err();
        assert!(matches!(err, DapError::UnsupportedRequest(_)));
        assert!(adapter.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_store_edits_push_after_initialized() {
        let store = Arc::new(BreakpointStore::new());
        let (_session, adapter) = session_with(store.clone(), None, default_script);
        let file = uri("/work/file.ts");

        store.toggle(&file, 4, None);
        settle().await;
        assert_eq!(adapter.count("setBreakpoints"), 0);

        adapter.event("initialized", json!({}));
        settle().await;
        store.toggle(&file, 6, None);
        settle().await;
        let pushes = adapter.requests("setBreakpoints");
        let last = pushes.last().unwrap();
        assert_eq!(last["sourceModified"], true);
        assert_eq!(last["breakpoints"], json!([{"line": 4}, {"line": 6}]));
    }

    #[tokio::test(start_paused = true)]
    async fn session_breakpoint_pushes_apply_in_order() {
        let store = Arc::new(BreakpointStore::new());
        let (session, adapter) = session_with(store.clone(), None, default_script);
        adapter.event("initialized", json!({}));
        settle().await;
        let file = uri("/work/file.ts");
        store.toggle(&file, 1, None);
        store.toggle(&file, 2, None);
        store.toggle(&file, 1, None);
        settle().await;
        let lines: Vec<i64> = session
            .breakpoints(Some(&file))
            .iter()
            .map(DebugBreakpoint::line)
            .collect();
        assert_eq!(lines, vec![2]);
        assert_eq!(adapter.count("setBreakpoints"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn session_breakpoint_push_waits_for_slow_response() {
        let (connection, endpoint) = Connection::in_memory("1");
        let (mut incoming, sender) = endpoint.split();
        let events = sender.clone();
        let pushes: Arc<Mutex<Vec<Value>>> = Arc::default();
        let seen = pushes.clone();
        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                let command = message["command"].as_str().unwrap_or_default().to_string();
                let args = message.get("arguments").cloned().unwrap_or(Value::Null);
                let body = default_script(&command, &args).unwrap_or_else(|_| json!({}));
                if command != "setBreakpoints" {
                    sender.respond(&message, body);
                    continue;
                }
                let first = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(args);
                    seen.len() == 1
                };
                let sender = sender.clone();
                tokio::spawn(async move {
                    if first {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    sender.respond(&message, body);
                });
            }
        });

        let store = Arc::new(BreakpointStore::new());
        let session = DebugSession::new(
            "1",
            DebugConfiguration::new("node", "app", "launch"),
            connection,
            store.clone(),
            None,
            SessionOptions::default(),
        );
        events.event("initialized", json!({}));
        settle().await;

        let file = uri("/work/file.ts");
        store.toggle(&file, 1, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.toggle(&file, 2, None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pushes.lock().unwrap().len(), 1);
        assert!(session.breakpoints(Some(&file)).is_empty());

        settle().await;
        let pushed = pushes.lock().unwrap().clone();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0]["breakpoints"], json!([{"line": 1}]));
        assert_eq!(pushed[1]["breakpoints"], json!([{"line": 1}, {"line": 2}]));
        let installed: Vec<i64> = session
            .breakpoints(Some(&file))
            .iter()
            .map(DebugBreakpoint::line)
            .collect();
        let stored: Vec<i64> = store
            .list(&BreakpointFilter::uri(file.clone()))
            .iter()
            .map(|bp| bp.line())
            .collect();
        assert_eq!(installed, stored);
        assert_eq!(installed, vec![1, 2]);
    }

    #[tokio::test]
    async fn session_evaluate_without_frame() {
        let (session, adapter) = session();
        let body = session.evaluate("x * 2", "repl").await.unwrap();
        assert_eq!(body.result, "42");
        assert_eq!(
            adapter.requests("evaluate"),
            vec![json!({"expression": "x * 2", "context": "repl"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_evaluate_in_current_frame() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        settle().await;
        session.evaluate("x", "watch").await.unwrap();
        assert_eq!(adapter.requests("evaluate")[0]["frameId"], 100);

        assert!(session.select_frame(101));
        session.evaluate("x", "watch").await.unwrap();
        assert_eq!(adapter.requests("evaluate")[1]["frameId"], 101);
        assert!(!session.select_frame(999));
    }

    #[tokio::test]
    async fn session_completions_need_capability() {
        let (session, adapter) = session();
        assert!(session.completions("pro", 3, None).await.unwrap().is_empty());
        assert_eq!(adapter.count("completions"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_pause_all_logs_failures() {
        let (session, adapter) = session();
        adapter.event("thread", json!({"reason": "started", "threadId": 1}));
        settle().await;
        session.pause_all().await;
        let paused: Vec<Value> = adapter.requests("pause");
        assert_eq!(paused.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_select_thread_moves_focus() {
        let (session, adapter) = session();
        adapter.event("stopped", stopped(1));
        settle().await;
        // Running threads cannot take focus.
        assert!(!session.select_thread(2));
        assert_eq!(session.current_thread().unwrap().id(), 1);

        adapter.event(
            "stopped",
            json!({"reason": "pause", "threadId": 1, "allThreadsStopped": true}),
        );
        settle().await;
        assert!(session.select_thread(2));
        settle().await;
        assert_eq!(session.current_thread().unwrap().id(), 2);
        assert_eq!(session.current_frame().unwrap().id(), 200);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.select_thread(9));
        assert_eq!(session.current_thread().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn session_dispose_is_quiet_and_final() {
        let store = Arc::new(BreakpointStore::new());
        let (session, adapter) = session_with(store.clone(), None, default_script);
        let file = uri("/work/file.ts");
        store.toggle(&file, 4, None);
        session.update_breakpoints(None, false).await;

        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = fired.clone();
        let _sub = session.on_did_change_breakpoints(move |uri| f.lock().unwrap().push(uri.clone()));
        session.dispose();
        session.dispose();

        assert!(fired.lock().unwrap().is_empty());
        assert!(session.breakpoint_uris().is_empty());
        assert_eq!(session.state(), SessionState::Inactive);
        assert!(session.disconnect(DisconnectArguments::default()).await.is_ok());
        assert_eq!(adapter.count("disconnect"), 0);
    }

    #[tokio::test]
    async fn session_disconnect_sends_arguments() {
        let (session, adapter) = session();
        session
            .disconnect(DisconnectArguments {
                restart: Some(true),
                ..DisconnectArguments::default()
            })
            .await
            .unwrap();
        assert_eq!(adapter.requests("disconnect"), vec![json!({"restart": true})]);
    }

    struct FixedTerminal;

    #[async_trait]
    impl TerminalLauncher for FixedTerminal {
        async fn run(&self, request: TerminalRequest) -> Result<i64, DapError> {
            if request.command == "node" && request.args == ["app.js"] {
                Ok(4242)
            } else {
                Err(DapError::Transport("unexpected command".into()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_run_in_terminal_reports_process_id() {
        let (_session, adapter) = session_with(
            Arc::new(BreakpointStore::new()),
            Some(Arc::new(FixedTerminal)),
            default_script,
        );
        adapter.reverse_request(
            "runInTerminal",
            json!({"cwd": "/work", "args": ["node", "app.js"], "title": "app"}),
        );
        settle().await;
        let responses = adapter.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["success"], true);
        assert_eq!(responses[0]["body"]["processId"], 4242);
    }

    #[tokio::test(start_paused = true)]
    async fn session_run_in_terminal_without_terminal_fails() {
        let (_session, adapter) = session();
        adapter.reverse_request(
            "runInTerminal",
            json!({"cwd": "/work", "args": ["node"]}),
        );
        settle().await;
        let responses = adapter.responses();
        assert_eq!(responses[0]["success"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn session_forwards_output() {
        let (session, adapter) = session();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let l = lines.clone();
        let _sub = session.on_output(move |body| l.lock().unwrap().push(body.output.clone()));
        adapter.event("output", json!({"category": "stdout", "output": "hello\n"}));
        settle().await;
        assert_eq!(*lines.lock().unwrap(), vec!["hello\n".to_string()]);
    }
}
