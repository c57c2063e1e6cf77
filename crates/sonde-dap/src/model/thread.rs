//! Threads and their stacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;

use crate::emitter::{Emitter, Subscription};
use crate::error::DapError;
use crate::lock;
use crate::model::frame::DebugStackFrame;
use crate::model::SessionContext;
use crate::protocol::{
    self, ContinueResponseBody, StackFrameFormat, StackTraceArguments, StackTraceResponseBody,
    StoppedEventBody, ThreadArguments,
};
use crate::refresh::{Coalescer, Ticket};

/// Why and how a thread stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedDetails {
    /// The `stopped` event that stopped the thread.
    pub event: StoppedEventBody,
    /// Set when the stack could not be fetched.
    pub frames_error_message: Option<String>,
}

impl From<StoppedEventBody> for StoppedDetails {
    fn from(event: StoppedEventBody) -> Self {
        Self {
            event,
            frames_error_message: None,
        }
    }
}

struct ThreadState {
    raw: protocol::Thread,
    stopped_details: Option<StoppedDetails>,
    frames: Vec<Arc<DebugStackFrame>>,
    current_frame: Option<Arc<DebugStackFrame>>,
}

/// A thread of the debuggee.
///
/// A thread is stopped exactly when it carries [`StoppedDetails`]. Its
/// frames are fetched with a coalesced `stackTrace` request and are dropped
/// whenever the thread stops again or is cleared.
pub struct DebugThread {
    ctx: Arc<SessionContext>,
    id: i64,
    state: Mutex<ThreadState>,
    stack_refresh: Coalescer<()>,
    changed: Emitter<()>,
}

impl DebugThread {
    pub(crate) fn new(ctx: Arc<SessionContext>, raw: protocol::Thread) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<DebugThread>| {
            let weak = weak.clone();
            let stack_refresh = Coalescer::new(ctx.stack_refresh_delay, move |(), ticket| {
                let weak = weak.clone();
                async move {
                    if let Some(thread) = weak.upgrade() {
                        thread.fetch_frames(ticket).await;
                    }
                }
                .boxed()
            });
            Self {
                id: raw.id,
                ctx,
                state: Mutex::new(ThreadState {
                    raw,
                    stopped_details: None,
                    frames: Vec::new(),
                    current_frame: None,
                }),
                stack_refresh,
                changed: Emitter::new(),
            }
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> String {
        lock(&self.state).raw.name.clone()
    }

    pub fn raw(&self) -> protocol::Thread {
        lock(&self.state).raw.clone()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped_details.is_some()
    }

    pub fn stopped_details(&self) -> Option<StoppedDetails> {
        lock(&self.state).stopped_details.clone()
    }

    /// Frames of the last stack fetch, top first.
    pub fn frames(&self) -> Vec<Arc<DebugStackFrame>> {
        lock(&self.state).frames.clone()
    }

    pub fn frame(&self, frame_id: i64) -> Option<Arc<DebugStackFrame>> {
        lock(&self.state)
            .frames
            .iter()
            .find(|f| f.id() == frame_id)
            .cloned()
    }

    pub fn current_frame(&self) -> Option<Arc<DebugStackFrame>> {
        lock(&self.state).current_frame.clone()
    }

    /// Listen for changes of stop state, frames or the current frame.
    pub fn on_did_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.changed.subscribe(listener)
    }

    pub(crate) fn update(&self, raw: protocol::Thread) {
        lock(&self.state).raw = raw;
    }

    /// Mark the thread stopped. Frames of an earlier stop are dropped.
    pub(crate) fn set_stopped(&self, event: StoppedEventBody) {
        self.stack_refresh.invalidate();
        {
            let mut state = lock(&self.state);
            state.stopped_details = Some(event.into());
            state.frames.clear();
            state.current_frame = None;
        }
        self.changed.fire(&());
    }

    /// Forget the stop state and the frames. An outstanding stack fetch
    /// is discarded when it completes.
    pub fn clear(&self) {
        self.stack_refresh.invalidate();
        {
            let mut state = lock(&self.state);
            state.stopped_details = None;
            state.frames.clear();
            state.current_frame = None;
        }
        self.changed.fire(&());
    }

    /// Schedule a stack fetch when the thread is stopped and has none yet.
    pub fn resolve_frames(&self) {
        let needed = {
            let state = lock(&self.state);
            state.frames.is_empty()
                && state
                    .stopped_details
                    .as_ref()
                    .is_some_and(|d| d.frames_error_message.is_none())
        };
        if needed {
            self.stack_refresh.request(());
        }
    }

    /// Whether a stack fetch is scheduled or in flight.
    pub fn is_resolving(&self) -> bool {
        self.stack_refresh.is_busy()
    }

    async fn fetch_frames(&self, ticket: Ticket) {
        let arguments = StackTraceArguments {
            thread_id: self.id,
            start_frame: None,
            levels: None,
            format: Some(StackFrameFormat::detailed()),
        };
        let result: Result<StackTraceResponseBody, DapError> =
            self.ctx.connection.request("stackTrace", arguments).await;
        if !ticket.is_current() {
            return;
        }
        {
            let mut state = lock(&self.state);
            let Some(details) = state.stopped_details.as_mut() else {
                return;
            };
            match result {
                Ok(body) => self.apply_frames(&mut state, body.stack_frames),
                Err(e) => {
                    tracing::warn!(session = %self.ctx.session_id, thread = self.id, "stackTrace failed: {e}");
                    details.frames_error_message = Some(e.user_message());
                    state.frames.clear();
                    state.current_frame = None;
                }
            }
        }
        self.changed.fire(&());
    }

    fn apply_frames(&self, state: &mut ThreadState, raws: Vec<protocol::StackFrame>) {
        let mut previous: HashMap<i64, Arc<DebugStackFrame>> =
            state.frames.drain(..).map(|f| (f.id(), f)).collect();
        state.frames = raws
            .into_iter()
            .map(|raw| match previous.remove(&raw.id) {
                Some(frame) => {
                    frame.update(raw);
                    frame
                }
                None => Arc::new(DebugStackFrame::new(Arc::clone(&self.ctx), self.id, raw)),
            })
            .collect();
        let current_id = state.current_frame.as_ref().map(|f| f.id());
        state.current_frame = current_id
            .and_then(|id| state.frames.iter().find(|f| f.id() == id))
            .or_else(|| state.frames.first())
            .cloned();
    }

    /// Make `frame_id` the current frame. Returns false when the thread has
    /// no such frame.
    pub fn select_frame(&self, frame_id: i64) -> bool {
        {
            let mut state = lock(&self.state);
            let Some(frame) = state.frames.iter().find(|f| f.id() == frame_id).cloned() else {
                return false;
            };
            state.current_frame = Some(frame);
        }
        self.changed.fire(&());
        true
    }

    fn arguments(&self) -> ThreadArguments {
        ThreadArguments { thread_id: self.id }
    }

    /// Resume the thread.
    pub async fn continue_execution(&self) -> Result<ContinueResponseBody, DapError> {
        self.ctx.connection.request("continue", self.arguments()).await
    }

    /// Step over.
    pub async fn step_over(&self) -> Result<(), DapError> {
        self.ctx.connection.send_request("next", self.arguments()).await?;
        Ok(())
    }

    pub async fn step_into(&self) -> Result<(), DapError> {
        self.ctx.connection.send_request("stepIn", self.arguments()).await?;
        Ok(())
    }

    pub async fn step_out(&self) -> Result<(), DapError> {
        self.ctx.connection.send_request("stepOut", self.arguments()).await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), DapError> {
        self.ctx.connection.send_request("pause", self.arguments()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for DebugThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("DebugThread")
            .field("raw", &state.raw)
            .field("stopped_details", &state.stopped_details)
            .field("frames", &state.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;

    use crate::connection::Connection;
    use crate::protocol::StopReason;
    use crate::test_support::{settle, ScriptedAdapter};

    fn thread<F>(script: F) -> (Arc<DebugThread>, ScriptedAdapter)
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let (connection, endpoint) = Connection::in_memory("threads");
        let adapter = ScriptedAdapter::spawn(endpoint, script);
        let ctx = Arc::new(SessionContext::new(
            "threads",
            connection,
            Duration::from_millis(100),
        ));
        let thread = DebugThread::new(
            ctx,
            protocol::Thread {
                id: 1,
                name: "main".into(),
            },
        );
        (thread, adapter)
    }

    fn stopped() -> StoppedEventBody {
        StoppedEventBody {
            reason: StopReason::Breakpoint,
            description: None,
            thread_id: Some(1),
            preserve_focus_hint: None,
            text: None,
            all_threads_stopped: None,
            hit_breakpoint_ids: None,
        }
    }

    fn stack(ids: &[i64]) -> Value {
        let frames: Vec<Value> = ids
            .iter()
            .map(|id| json!({"id": id, "name": format!("f{id}"), "line": 1, "column": 1}))
            .collect();
        json!({"stackFrames": frames, "totalFrames": ids.len()})
    }

    #[tokio::test(start_paused = true)]
    async fn thread_frames_fetched_once_per_burst() {
        let (thread, adapter) = thread(|_, _| Ok(stack(&[10, 11])));
        thread.set_stopped(stopped());
        thread.resolve_frames();
        thread.resolve_frames();
        settle().await;
        assert_eq!(adapter.count("stackTrace"), 1);
        assert_eq!(adapter.requests("stackTrace")[0]["threadId"], 1);
        let ids: Vec<i64> = thread.frames().iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![10, 11]);
        assert_eq!(thread.current_frame().unwrap().id(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn thread_running_does_not_fetch_frames() {
        let (thread, adapter) = thread(|_, _| Ok(stack(&[10])));
        thread.resolve_frames();
        settle().await;
        assert_eq!(adapter.count("stackTrace"), 0);
        assert!(!thread.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn thread_frames_reused_and_selection_kept() {
        let (thread, _adapter) = thread(|_, _| Ok(stack(&[10, 11])));
        thread.set_stopped(stopped());
        thread.resolve_frames();
        settle().await;
        let first = thread.frame(11).unwrap();
        assert!(thread.select_frame(11));

        let mut state = lock(&thread.state);
        thread.apply_frames(&mut state, vec![
            serde_json::from_value(json!({"id": 11, "name": "f11", "line": 2, "column": 1})).unwrap(),
            serde_json::from_value(json!({"id": 12, "name": "f12", "line": 1, "column": 1})).unwrap(),
        ]);
        drop(state);
        assert!(Arc::ptr_eq(&first, &thread.frame(11).unwrap()));
        assert_eq!(thread.current_frame().unwrap().id(), 11);
        assert_eq!(first.line(), 2);
        assert!(!thread.select_frame(10));
    }

    #[tokio::test(start_paused = true)]
    async fn thread_stack_failure_keeps_thread_stopped() {
        let (thread, _adapter) = thread(|_, _| Err("stack unavailable".into()));
        thread.set_stopped(stopped());
        thread.resolve_frames();
        settle().await;
        assert!(thread.is_stopped());
        assert!(thread.frames().is_empty());
        assert_eq!(
            thread.stopped_details().unwrap().frames_error_message.as_deref(),
            Some("stack unavailable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn thread_clear_discards_inflight_stack() {
        let (thread, adapter) = thread(|_, _| Ok(stack(&[10])));
        thread.set_stopped(stopped());
        thread.resolve_frames();
        tokio::time::sleep(Duration::from_millis(50)).await;
        thread.clear();
        settle().await;
        assert_eq!(adapter.count("stackTrace"), 0);
        assert!(thread.frames().is_empty());
        assert!(thread.stopped_details().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn thread_change_fires_on_stop_and_frames() {
        let (thread, _adapter) = thread(|_, _| Ok(stack(&[10])));
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let _sub = thread.on_did_change(move |_| *h.lock().unwrap() += 1);
        thread.set_stopped(stopped());
        thread.resolve_frames();
        settle().await;
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn thread_operations_send_thread_id() {
        let (thread, adapter) = thread(|command, _| match command {
            "continue" => Ok(json!({"allThreadsContinued": false})),
            "pause" => Err("already running".into()),
            _ => Ok(Value::Null),
        });
        let body = thread.continue_execution().await.unwrap();
        assert_eq!(body.all_threads_continued, Some(false));
        thread.step_over().await.unwrap();
        thread.step_into().await.unwrap();
        thread.step_out().await.unwrap();
        assert!(thread.pause().await.is_err());
        assert_eq!(
            adapter.commands(),
            vec!["continue", "next", "stepIn", "stepOut", "pause"]
        );
        assert_eq!(adapter.requests("next"), vec![json!({"threadId": 1})]);
    }
}
