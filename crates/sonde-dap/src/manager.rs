//! The set of live debug sessions.
//!
//! The [`DebugSessionManager`] starts sessions through a
//! [`DebugAdapterProvider`], tears them down on `exited` or when their
//! adapter goes away, and derives the current session from the sessions'
//! current threads every time one of them changes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use url::Url;

use crate::adapter::{DebugAdapterProvider, TerminalLauncher};
use crate::breakpoint::{BreakpointFilter, BreakpointStore, DebugBreakpoint};
use crate::configuration::DebugConfiguration;
use crate::connection::Connection;
use crate::emitter::{Emitter, Subscription};
use crate::error::DapError;
use crate::lock;
use crate::protocol::ExitedEventBody;
use crate::model::{DebugStackFrame, DebugThread};
use crate::protocol::{DisconnectArguments, TerminatedEventBody};
use crate::session::{DebugSession, SessionOptions, SessionState};

/// Shown when a failed handshake carries no message of its own.
pub const INITIALIZATION_FAILED: &str =
    "Debug session initialization failed. See console for details.";

/// Everything a factory needs to build a session.
#[derive(Clone)]
pub struct SessionArgs {
    pub id: String,
    pub configuration: DebugConfiguration,
    pub connection: Connection,
    pub store: Arc<BreakpointStore>,
    pub terminal: Option<Arc<dyn TerminalLauncher>>,
    pub options: SessionOptions,
}

/// Builds sessions for one debug type.
pub trait DebugSessionFactory: Send + Sync {
    fn create(&self, args: SessionArgs) -> Arc<DebugSession>;
}

/// Builds a plain [`DebugSession`].
#[derive(Debug, Default)]
pub struct DefaultSessionFactory;

impl DebugSessionFactory for DefaultSessionFactory {
    fn create(&self, args: SessionArgs) -> Arc<DebugSession> {
        DebugSession::new(
            args.id,
            args.configuration,
            args.connection,
            args.store,
            args.terminal,
            args.options,
        )
    }
}

/// A message for the user about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotification {
    pub session_id: String,
    pub message: String,
}

/// Previous and new current session.
pub type ActiveSessionChange = (Option<Arc<DebugSession>>, Option<Arc<DebugSession>>);

#[derive(Default)]
struct ManagerState {
    sessions: Vec<Arc<DebugSession>>,
    session_subs: HashMap<String, Vec<Subscription>>,
    current: Option<Arc<DebugSession>>,
    current_sub: Option<Subscription>,
    next_id: u64,
}

struct ManagerInner {
    provider: Arc<dyn DebugAdapterProvider>,
    store: Arc<BreakpointStore>,
    terminal: Option<Arc<dyn TerminalLauncher>>,
    options: SessionOptions,
    factories: Mutex<HashMap<String, Arc<dyn DebugSessionFactory>>>,
    default_factory: Arc<dyn DebugSessionFactory>,
    state: Mutex<ManagerState>,
    store_sub: Mutex<Option<Subscription>>,
    created: Emitter<Arc<DebugSession>>,
    destroyed: Emitter<Arc<DebugSession>>,
    active_changed: Emitter<ActiveSessionChange>,
    breakpoints_changed: Emitter<Url>,
    notifications: Emitter<SessionNotification>,
}

/// Owns every live [`DebugSession`].
#[derive(Clone)]
pub struct DebugSessionManager {
    inner: Arc<ManagerInner>,
}

impl DebugSessionManager {
    pub fn new(
        provider: Arc<dyn DebugAdapterProvider>,
        store: Arc<BreakpointStore>,
        terminal: Option<Arc<dyn TerminalLauncher>>,
        options: SessionOptions,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            provider,
            store,
            terminal,
            options,
            factories: Mutex::new(HashMap::new()),
            default_factory: Arc::new(DefaultSessionFactory),
            state: Mutex::new(ManagerState {
                next_id: 1,
                ..ManagerState::default()
            }),
            store_sub: Mutex::new(None),
            created: Emitter::new(),
            destroyed: Emitter::new(),
            active_changed: Emitter::new(),
            breakpoints_changed: Emitter::new(),
            notifications: Emitter::new(),
        });
        let weak = Arc::downgrade(&inner);
        let sub = inner.store.on_did_change(move |uri| {
            if let Some(inner) = weak.upgrade() {
                inner.breakpoints_changed.fire(uri);
            }
        });
        *lock(&inner.store_sub) = Some(sub);
        Self { inner }
    }

    /// Use `factory` for sessions of `debug_type`.
    pub fn register_factory(&self, debug_type: impl Into<String>, factory: Arc<dyn DebugSessionFactory>) {
        lock(&self.inner.factories).insert(debug_type.into(), factory);
    }

    pub fn store(&self) -> &Arc<BreakpointStore> {
        &self.inner.store
    }

    /// Start an adapter for `configuration` and create its session.
    ///
    /// Returns once the session is wired; `initialize` and `launch`/`attach`
    /// run in the background. A configuration whose `request` is neither
    /// `launch` nor `attach` is rejected before anything starts.
    pub async fn create(
        &self,
        configuration: DebugConfiguration,
    ) -> Result<Arc<DebugSession>, DapError> {
        configuration.request_kind()?;
        let inner = &self.inner;
        let id = {
            let mut state = lock(&inner.state);
            let id = state.next_id;
            state.next_id += 1;
            id.to_string()
        };
        let connection = inner.provider.start(&id, &configuration).await?;
        let factory = lock(&inner.factories)
            .get(&configuration.debug_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&inner.default_factory));
        let session = factory.create(SessionArgs {
            id: id.clone(),
            configuration,
            connection,
            store: Arc::clone(&inner.store),
            terminal: inner.terminal.clone(),
            options: inner.options.clone(),
        });
        tracing::info!(session = %id, name = %session.configuration().name, "debug session created");

        lock(&inner.state).sessions.push(Arc::clone(&session));
        inner.created.fire(&session);

        let subs = inner.wire(&session);
        lock(&inner.state).session_subs.insert(id, subs);

        let launching = Arc::clone(inner);
        let target = Arc::clone(&session);
        tokio::spawn(async move {
            launching.launch_or_attach(target, None).await;
        });
        Ok(session)
    }

    pub fn sessions(&self) -> Vec<Arc<DebugSession>> {
        lock(&self.inner.state).sessions.clone()
    }

    pub fn session(&self, id: &str) -> Option<Arc<DebugSession>> {
        lock(&self.inner.state)
            .sessions
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub fn current_session(&self) -> Option<Arc<DebugSession>> {
        self.inner.current_session()
    }

    pub fn current_thread(&self) -> Option<Arc<DebugThread>> {
        self.current_session().and_then(|s| s.current_thread())
    }

    pub fn current_frame(&self) -> Option<Arc<DebugStackFrame>> {
        self.current_thread().and_then(|t| t.current_frame())
    }

    /// State of the current session, `Inactive` without one.
    pub fn state(&self) -> SessionState {
        self.current_session()
            .map_or(SessionState::Inactive, |s| s.state())
    }

    /// Destroy one session, or every session when `session_id` is `None`.
    pub async fn destroy(&self, session_id: Option<&str>) {
        self.inner.destroy(session_id).await;
    }

    /// Breakpoints as seen by `session` (default: the current session).
    ///
    /// While the session is live this is the store's disabled breakpoints
    /// followed by the session's installed ones; otherwise the store's
    /// breakpoints, none of them installed.
    pub fn get_breakpoints(&self, session: Option<&Arc<DebugSession>>) -> Vec<DebugBreakpoint> {
        self.merged_breakpoints(None, session)
    }

    /// [`Self::get_breakpoints`] restricted to one source.
    pub fn get_breakpoints_for_uri(
        &self,
        uri: &Url,
        session: Option<&Arc<DebugSession>>,
    ) -> Vec<DebugBreakpoint> {
        self.merged_breakpoints(Some(uri), session)
    }

    fn merged_breakpoints(
        &self,
        uri: Option<&Url>,
        session: Option<&Arc<DebugSession>>,
    ) -> Vec<DebugBreakpoint> {
        let filter = BreakpointFilter {
            uri: uri.cloned(),
            enabled: None,
        };
        let session = session
            .cloned()
            .or_else(|| self.current_session())
            .filter(|s| s.state() != SessionState::Inactive);
        let store = &self.inner.store;
        match session {
            Some(session) => store
                .list(&filter.enabled(false))
                .into_iter()
                .map(DebugBreakpoint::uninstalled)
                .chain(session.breakpoints(uri))
                .collect(),
            None => store
                .list(&filter)
                .into_iter()
                .map(DebugBreakpoint::uninstalled)
                .collect(),
        }
    }

    pub fn on_did_create_session<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<DebugSession>) + Send + Sync + 'static,
    {
        self.inner.created.subscribe(listener)
    }

    pub fn on_did_destroy_session<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<DebugSession>) + Send + Sync + 'static,
    {
        self.inner.destroyed.subscribe(listener)
    }

    /// Fires with the previous and the new current session.
    pub fn on_did_change_active_session<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ActiveSessionChange) + Send + Sync + 'static,
    {
        self.inner.active_changed.subscribe(listener)
    }

    /// Fires with every URI whose merged breakpoint view may have changed.
    pub fn on_did_change_breakpoints<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Url) + Send + Sync + 'static,
    {
        self.inner.breakpoints_changed.subscribe(listener)
    }

    /// Messages meant for the user, e.g. a failed launch.
    pub fn on_notification<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionNotification) + Send + Sync + 'static,
    {
        self.inner.notifications.subscribe(listener)
    }
}

impl std::fmt::Debug for DebugSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("DebugSessionManager")
            .field("sessions", &state.sessions.len())
            .field("current", &state.current.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

impl ManagerInner {
    fn current_session(&self) -> Option<Arc<DebugSession>> {
        lock(&self.state).current.clone()
    }

    fn wire(self: &Arc<Self>, session: &Arc<DebugSession>) -> Vec<Subscription> {
        let on_change = {
            let manager = Arc::downgrade(self);
            let target = Arc::downgrade(session);
            session.on_did_change(move |_| {
                if let (Some(manager), Some(session)) = (manager.upgrade(), target.upgrade()) {
                    manager.update_current_session(Some(&session));
                }
            })
        };
        let on_terminated = {
            let manager = Arc::downgrade(self);
            let target = Arc::downgrade(session);
            session.on_event("terminated", move |event| {
                let (Some(manager), Some(session)) = (manager.upgrade(), target.upgrade()) else {
                    return;
                };
                let body: TerminatedEventBody = event.parse_body().unwrap_or_default();
                let restart = body.restart_data().cloned();
                tokio::spawn(async move {
                    manager.disconnect(session, restart).await;
                });
            })
        };
        let on_exited = {
            let manager = Arc::downgrade(self);
            let id = session.id().to_string();
            session.on_event("exited", move |event| {
                if let Ok(body) = event.parse_body::<ExitedEventBody>() {
                    tracing::info!(session = %id, exit_code = body.exit_code, "debuggee exited");
                }
                if let Some(manager) = manager.upgrade() {
                    let id = id.clone();
                    tokio::spawn(async move {
                        manager.destroy(Some(&id)).await;
                    });
                }
            })
        };
        let on_close = {
            let manager = Arc::downgrade(self);
            let id = session.id().to_string();
            session.on_close(move |_| {
                if let Some(manager) = manager.upgrade() {
                    tracing::info!(session = %id, "adapter went away");
                    let id = id.clone();
                    tokio::spawn(async move {
                        manager.destroy(Some(&id)).await;
                    });
                }
            })
        };
        vec![on_change, on_terminated, on_exited, on_close]
    }

    async fn disconnect(self: Arc<Self>, session: Arc<DebugSession>, restart: Option<Value>) {
        let Some(restart) = restart else {
            if let Err(e) = session.disconnect(DisconnectArguments::default()).await {
                tracing::warn!(session = %session.id(), "disconnect failed: {e}");
            }
            return;
        };
        tracing::info!(session = %session.id(), "restarting");
        let arguments = DisconnectArguments {
            restart: Some(true),
            ..DisconnectArguments::default()
        };
        if let Err(e) = session.disconnect(arguments).await {
            tracing::warn!(session = %session.id(), "disconnect before restart failed: {e}");
        }
        self.launch_or_attach(session, Some(restart)).await;
    }

    async fn launch_or_attach(self: Arc<Self>, session: Arc<DebugSession>, restart: Option<Value>) {
        let Err(e) = session.launch_or_attach(restart.as_ref()).await else {
            return;
        };
        tracing::error!(session = %session.id(), "debug session initialization failed: {e}");
        let message = match &e {
            DapError::Rejected { message, .. } if !message.is_empty() => message.clone(),
            _ => INITIALIZATION_FAILED.to_string(),
        };
        if self.do_destroy(session.id()).await {
            self.notifications.fire(&SessionNotification {
                session_id: session.id().to_string(),
                message,
            });
        }
    }

    async fn destroy(self: &Arc<Self>, session_id: Option<&str>) {
        match session_id {
            Some(id) => {
                self.do_destroy(id).await;
            }
            None => {
                let ids: Vec<String> = lock(&self.state)
                    .sessions
                    .iter()
                    .map(|s| s.id().to_string())
                    .collect();
                for id in ids {
                    self.do_destroy(&id).await;
                }
            }
        }
    }

    /// Returns false when the session was already gone.
    async fn do_destroy(self: &Arc<Self>, session_id: &str) -> bool {
        let (session, subs) = {
            let mut state = lock(&self.state);
            let Some(index) = state.sessions.iter().position(|s| s.id() == session_id) else {
                return false;
            };
            let session = state.sessions.remove(index);
            let subs = state.session_subs.remove(session_id).unwrap_or_default();
            (session, subs)
        };
        drop(subs);
        if let Err(e) = self.provider.stop(session_id).await {
            tracing::warn!(session = %session_id, "stopping adapter failed: {e}");
        }
        let uris = session.breakpoint_uris();
        session.dispose();

        let was_current = self
            .current_session()
            .is_some_and(|current| Arc::ptr_eq(&current, &session));
        if was_current {
            self.update_current_session(None);
            // Disposal detached the listeners before dropping the installed
            // breakpoints.
            for uri in &uris {
                self.breakpoints_changed.fire(uri);
            }
        }
        tracing::info!(session = %session_id, "debug session destroyed");
        self.destroyed.fire(&session);
        true
    }

    fn update_current_session(self: &Arc<Self>, session: Option<&Arc<DebugSession>>) {
        let next = match session {
            Some(session) if session.current_thread().is_some() => Some(Arc::clone(session)),
            _ => {
                let sessions = lock(&self.state).sessions.clone();
                sessions.into_iter().find(|s| s.current_thread().is_some())
            }
        };
        self.set_current_session(next);
    }

    fn set_current_session(self: &Arc<Self>, next: Option<Arc<DebugSession>>) {
        let sub = next.as_ref().map(|session| {
            let manager = Arc::downgrade(self);
            session.on_did_change_breakpoints(move |uri| {
                if let Some(manager) = manager.upgrade() {
                    manager.breakpoints_changed.fire(uri);
                }
            })
        });
        let (previous, old_sub) = {
            let mut state = lock(&self.state);
            let unchanged = match (&state.current, &next) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return;
            }
            let previous = std::mem::replace(&mut state.current, next.clone());
            (previous, std::mem::replace(&mut state.current_sub, sub))
        };
        drop(old_sub);
        tracing::debug!(
            previous = ?previous.as_ref().map(|s| s.id().to_string()),
            current = ?next.as_ref().map(|s| s.id().to_string()),
            "current session changed"
        );
        self.active_changed.fire(&(previous.clone(), next.clone()));

        let mut seen = HashSet::new();
        for session in previous.iter().chain(next.iter()) {
            for uri in session.breakpoint_uris() {
                if seen.insert(uri.clone()) {
                    self.breakpoints_changed.fire(&uri);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::breakpoint::Breakpoint;
    use crate::commands::DebugCommand;
    use crate::test_support::{settle, ScriptedProvider};

    fn default_script(command: &str, args: &Value) -> Result<Value, String> {
        match command {
            "initialize" => Ok(json!({"supportsConfigurationDoneRequest": true})),
            "threads" => Ok(json!({"threads": [{"id": 1, "name": "main"}]})),
            "stackTrace" => {
                let thread = args["threadId"].as_i64().unwrap_or_default();
                Ok(json!({"stackFrames": [
                    {"id": thread * 100, "name": "top", "line": 3, "column": 1}
                ]}))
            }
            "setBreakpoints" => {
                let count = args["breakpoints"].as_array().map_or(0, Vec::len);
                let verdicts: Vec<Value> = (0..count)
                    .map(|i| json!({"id": i + 1, "verified": true}))
                    .collect();
                Ok(json!({"breakpoints": verdicts}))
            }
            _ => Ok(json!({})),
        }
    }

    fn manager(provider: Arc<ScriptedProvider>) -> DebugSessionManager {
        manager_with_store(provider, Arc::new(BreakpointStore::new()))
    }

    fn manager_with_store(
        provider: Arc<ScriptedProvider>,
        store: Arc<BreakpointStore>,
    ) -> DebugSessionManager {
        DebugSessionManager::new(provider, store, None, SessionOptions::default())
    }

    fn launch(debug_type: &str) -> DebugConfiguration {
        DebugConfiguration::new(debug_type, "app", "launch")
            .with_field("program", json!("/work/app.js"))
    }

    fn stopped(thread_id: i64) -> Value {
        json!({"reason": "breakpoint", "threadId": thread_id})
    }

    fn ids(change: &ActiveSessionChange) -> (Option<String>, Option<String>) {
        (
            change.0.as_ref().map(|s| s.id().to_string()),
            change.1.as_ref().map(|s| s.id().to_string()),
        )
    }

    fn uri(path: &str) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn manager_create_launches_and_follows_stops() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        let _sub = manager.on_did_change_active_session(move |change| {
            c.lock().unwrap().push(ids(change));
        });

        let session = manager.create(launch("node")).await.unwrap();
        settle().await;
        let adapter = provider.adapter(0);
        assert_eq!(adapter.commands(), vec!["initialize", "launch"]);
        assert_eq!(adapter.requests("launch")[0]["program"], "/work/app.js");
        assert!(manager.current_session().is_none());
        assert_eq!(manager.state(), SessionState::Inactive);

        adapter.event("stopped", stopped(1));
        settle().await;
        let current = manager.current_session().unwrap();
        assert!(Arc::ptr_eq(&current, &session));
        assert_eq!(manager.state(), SessionState::Stopped);
        assert_eq!(manager.current_thread().unwrap().id(), 1);
        assert_eq!(manager.current_frame().unwrap().id(), 100);
        assert_eq!(
            *changes.lock().unwrap(),
            vec![(None, Some("1".to_string()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manager_rejects_unsupported_request_before_starting() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        let config = DebugConfiguration::new("node", "app", "debug");
        let err = manager.create(config).await.unwrap_err();
        assert!(matches!(err, DapError::UnsupportedRequest(_)));
        assert_eq!(provider.started(), 0);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_launch_failure_destroys_and_notifies() {
        let provider = ScriptedProvider::new(|command, args| match command {
            "launch" => Err("program not found".into()),
            _ => default_script(command, args),
        });
        let manager = manager(provider.clone());
        let notes = Arc::new(Mutex::new(Vec::new()));
        let n = notes.clone();
        let _notes = manager.on_notification(move |note| n.lock().unwrap().push(note.clone()));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let d = destroyed.clone();
        let _destroyed = manager.on_did_destroy_session(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let session = manager.create(launch("node")).await.unwrap();
        settle().await;
        assert_eq!(
            *notes.lock().unwrap(),
            vec![SessionNotification {
                session_id: "1".into(),
                message: "program not found".into(),
            }]
        );
        assert!(manager.sessions().is_empty());
        assert_eq!(provider.stopped(), vec!["1"]);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_launch_failure_without_message_uses_default() {
        let provider = ScriptedProvider::new(|command, args| match command {
            "initialize" => Err(String::new()),
            _ => default_script(command, args),
        });
        let manager = manager(provider);
        let notes = Arc::new(Mutex::new(Vec::new()));
        let n = notes.clone();
        let _notes = manager.on_notification(move |note| n.lock().unwrap().push(note.message.clone()));
        manager.create(launch("node")).await.unwrap();
        settle().await;
        assert_eq!(*notes.lock().unwrap(), vec![INITIALIZATION_FAILED]);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_exited_destroys_session() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        let _sub = manager.on_did_change_active_session(move |change| {
            c.lock().unwrap().push(ids(change));
        });
        let session = manager.create(launch("node")).await.unwrap();
        settle().await;
        provider.adapter(0).event("stopped", stopped(1));
        settle().await;

        provider.adapter(0).event("exited", json!({"exitCode": 0}));
        settle().await;
        assert!(manager.sessions().is_empty());
        assert!(manager.current_session().is_none());
        assert_eq!(manager.state(), SessionState::Inactive);
        assert_eq!(session.state(), SessionState::Inactive);
        assert!(session.threads().is_empty());
        assert_eq!(provider.stopped(), vec!["1"]);
        assert_eq!(
            changes.lock().unwrap().last().cloned(),
            Some((Some("1".to_string()), None))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manager_terminated_disconnects() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        manager.create(launch("node")).await.unwrap();
        settle().await;
        provider.adapter(0).event("terminated", json!({}));
        settle().await;
        let adapter = provider.adapter(0);
        assert_eq!(adapter.requests("disconnect"), vec![json!({})]);
        assert_eq!(adapter.count("initialize"), 1);
        assert_eq!(manager.sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_terminated_with_restart_relaunches() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        manager.create(launch("node")).await.unwrap();
        settle().await;
        provider
            .adapter(0)
            .event("terminated", json!({"restart": {"token": 7}}));
        settle().await;
        let adapter = provider.adapter(0);
        assert_eq!(adapter.requests("disconnect"), vec![json!({"restart": true})]);
        assert_eq!(adapter.count("initialize"), 2);
        let launches = adapter.requests("launch");
        assert_eq!(launches[0]["__restart"], false);
        assert_eq!(launches[1]["__restart"], json!({"token": 7}));
    }

    #[tokio::test(start_paused = true)]
    async fn manager_adapter_close_destroys_session() {
        let provider = ScriptedProvider::closing();
        let manager = manager(provider.clone());
        let notes = Arc::new(AtomicUsize::new(0));
        let n = notes.clone();
        let _notes = manager.on_notification(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });
        let session = manager.create(launch("node")).await.unwrap();
        settle().await;
        assert!(manager.sessions().is_empty());
        assert!(session.connection().is_disposed());
        assert_eq!(provider.stopped(), vec!["1"]);
        assert_eq!(notes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_breakpoints_merge_store_and_session() {
        let store = Arc::new(BreakpointStore::new());
        let file = uri("/work/file.ts");
        store.set_all(
            &file,
            vec![
                Breakpoint::new(file.clone(), 3),
                Breakpoint::new(file.clone(), 5).with_enabled(false),
                Breakpoint::new(file.clone(), 8),
            ],
        );
        let provider = ScriptedProvider::new(default_script);
        let manager = manager_with_store(provider.clone(), store);

        let idle: Vec<(i64, bool)> = manager
            .get_breakpoints(None)
            .iter()
            .map(|bp| (bp.line(), bp.is_installed()))
            .collect();
        assert_eq!(idle, vec![(3, false), (5, false), (8, false)]);

        let session = manager.create(launch("node")).await.unwrap();
        settle().await;
        provider.adapter(0).event("initialized", json!({}));
        settle().await;

        let live: Vec<(i64, bool)> = manager
            .get_breakpoints_for_uri(&file, Some(&session))
            .iter()
            .map(|bp| (bp.line(), bp.is_installed()))
            .collect();
        assert_eq!(live, vec![(5, false), (3, true), (8, true)]);
        // Nothing is stopped, so the session is not current yet.
        assert!(manager.current_session().is_none());
        assert!(manager.get_breakpoints(None).iter().all(|bp| !bp.is_installed()));
        assert_eq!(manager.state(), SessionState::Inactive);

        provider.adapter(0).event("stopped", stopped(1));
        settle().await;
        assert!(Arc::ptr_eq(&manager.current_session().unwrap(), &session));
        let current: Vec<(i64, bool)> = manager
            .get_breakpoints(None)
            .iter()
            .map(|bp| (bp.line(), bp.is_installed()))
            .collect();
        assert_eq!(current, vec![(5, false), (3, true), (8, true)]);
        assert_eq!(manager.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_running_session_does_not_take_focus() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        let first = manager.create(launch("node")).await.unwrap();
        manager.create(launch("node")).await.unwrap();
        settle().await;
        provider.adapter(0).event("stopped", stopped(1));
        settle().await;
        assert!(Arc::ptr_eq(&manager.current_session().unwrap(), &first));

        provider
            .adapter(1)
            .event("thread", json!({"reason": "started", "threadId": 1}));
        settle().await;
        assert_eq!(provider.adapter(1).count("threads"), 1);
        assert!(Arc::ptr_eq(&manager.current_session().unwrap(), &first));
        assert_eq!(manager.state(), SessionState::Stopped);
        assert!(DebugCommand::StepOver.is_enabled(&manager));
    }

    #[tokio::test(start_paused = true)]
    async fn manager_store_changes_are_forwarded() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider);
        let changed = Arc::new(Mutex::new(Vec::new()));
        let c = changed.clone();
        let _sub = manager.on_did_change_breakpoints(move |uri| c.lock().unwrap().push(uri.clone()));
        let file = uri("/work/file.ts");
        manager.store().toggle(&file, 4, None);
        assert_eq!(*changed.lock().unwrap(), vec![file]);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_current_session_falls_back_on_destroy() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        let first = manager.create(launch("node")).await.unwrap();
        let second = manager.create(launch("node")).await.unwrap();
        settle().await;
        provider.adapter(0).event("stopped", stopped(1));
        settle().await;
        assert!(Arc::ptr_eq(&manager.current_session().unwrap(), &first));

        provider.adapter(1).event("stopped", stopped(1));
        settle().await;
        assert!(Arc::ptr_eq(&manager.current_session().unwrap(), &second));

        manager.destroy(Some(second.id())).await;
        assert!(Arc::ptr_eq(&manager.current_session().unwrap(), &first));
        assert_eq!(manager.sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_destroy_all() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider.clone());
        manager.create(launch("node")).await.unwrap();
        manager.create(launch("node")).await.unwrap();
        settle().await;
        manager.destroy(None).await;
        assert!(manager.sessions().is_empty());
        assert_eq!(provider.stopped(), vec!["1", "2"]);
        manager.destroy(Some("1")).await;
        assert_eq!(provider.stopped().len(), 2);
    }

    struct CountingFactory(AtomicUsize);

    impl DebugSessionFactory for CountingFactory {
        fn create(&self, args: SessionArgs) -> Arc<DebugSession> {
            self.0.fetch_add(1, Ordering::SeqCst);
            DefaultSessionFactory.create(args)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manager_uses_factory_registered_for_type() {
        let provider = ScriptedProvider::new(default_script);
        let manager = manager(provider);
        let factory = Arc::new(CountingFactory(AtomicUsize::new(0)));
        manager.register_factory("python", factory.clone());
        manager.create(launch("node")).await.unwrap();
        assert_eq!(factory.0.load(Ordering::SeqCst), 0);
        let session = manager.create(launch("python")).await.unwrap();
        assert_eq!(factory.0.load(Ordering::SeqCst), 1);
        assert_eq!(session.configuration().debug_type, "python");
        assert!(manager.session(session.id()).is_some());
    }
}
