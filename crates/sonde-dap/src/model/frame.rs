//! Stack frames.

use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::DapError;
use crate::lock;
use crate::model::source::{DebugSource, Position, Selection, SourceOpener};
use crate::model::variables::ExpressionContainer;
use crate::model::SessionContext;
use crate::protocol::{self, ScopesArguments, ScopesResponseBody};

/// A scope of a frame together with its variables.
#[derive(Debug)]
pub struct DebugScope {
    pub raw: protocol::Scope,
    pub container: ExpressionContainer,
}

impl DebugScope {
    pub fn name(&self) -> &str {
        &self.raw.name
    }

    pub fn is_expensive(&self) -> bool {
        self.raw.expensive.unwrap_or(false)
    }
}

type ScopeCache = Arc<OnceCell<Vec<Arc<DebugScope>>>>;

/// A frame of one thread's stack.
///
/// Frames are reused across stack refreshes while the adapter keeps their
/// id; [`DebugStackFrame::update`] swaps in the new description and drops
/// the cached scopes.
pub struct DebugStackFrame {
    ctx: Arc<SessionContext>,
    thread_id: i64,
    raw: Mutex<protocol::StackFrame>,
    source: Mutex<Option<Arc<DebugSource>>>,
    scopes: Mutex<ScopeCache>,
}

impl DebugStackFrame {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        thread_id: i64,
        raw: protocol::StackFrame,
    ) -> Self {
        let source = Self::resolve_source(&ctx, &raw);
        Self {
            ctx,
            thread_id,
            raw: Mutex::new(raw),
            source: Mutex::new(source),
            scopes: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    fn resolve_source(
        ctx: &SessionContext,
        raw: &protocol::StackFrame,
    ) -> Option<Arc<DebugSource>> {
        let source = raw.source.as_ref()?;
        match ctx.sources.get_source(source) {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::debug!(session = %ctx.session_id, frame = raw.id, "frame source ignored: {e}");
                None
            }
        }
    }

    pub(crate) fn update(&self, raw: protocol::StackFrame) {
        let source = Self::resolve_source(&self.ctx, &raw);
        *lock(&self.raw) = raw;
        *lock(&self.source) = source;
        *lock(&self.scopes) = Arc::new(OnceCell::new());
    }

    pub fn id(&self) -> i64 {
        lock(&self.raw).id
    }

    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    pub fn name(&self) -> String {
        lock(&self.raw).name.clone()
    }

    /// Line (1-based).
    pub fn line(&self) -> i64 {
        lock(&self.raw).line
    }

    pub fn raw(&self) -> protocol::StackFrame {
        lock(&self.raw).clone()
    }

    pub fn source(&self) -> Option<Arc<DebugSource>> {
        lock(&self.source).clone()
    }

    /// The scopes of this frame, fetched once per frame update.
    ///
    /// A failed `scopes` request yields no scopes.
    pub async fn scopes(&self) -> Vec<Arc<DebugScope>> {
        let cache = lock(&self.scopes).clone();
        cache.get_or_init(|| self.resolve_scopes()).await.clone()
    }

    async fn resolve_scopes(&self) -> Vec<Arc<DebugScope>> {
        let frame_id = self.id();
        let result: Result<ScopesResponseBody, DapError> = self
            .ctx
            .connection
            .request("scopes", ScopesArguments { frame_id })
            .await;
        match result {
            Ok(body) => body
                .scopes
                .into_iter()
                .map(|raw| {
                    let container = ExpressionContainer::new(
                        Arc::clone(&self.ctx),
                        raw.variables_reference,
                        raw.named_variables,
                        raw.indexed_variables,
                    );
                    Arc::new(DebugScope { raw, container })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(session = %self.ctx.session_id, frame = frame_id, "scopes request failed: {e}");
                Vec::new()
            }
        }
    }

    /// Zero-based editor selection for this frame's location.
    pub fn selection(&self) -> Selection {
        let raw = lock(&self.raw);
        let start = Position {
            line: zero_based(raw.line),
            character: zero_based(raw.column),
        };
        let end = match (raw.end_line, raw.end_column) {
            (Some(line), Some(column)) => Some(Position {
                line: zero_based(line),
                character: zero_based(column),
            }),
            _ => None,
        };
        Selection { start, end }
    }

    /// Reveal the frame's location. Returns `None` for frames without a
    /// source.
    pub async fn open<O: SourceOpener>(&self, opener: &O) -> Result<Option<O::Handle>, DapError> {
        let Some(source) = self.source() else {
            return Ok(None);
        };
        let selection = self.selection();
        source.open(opener, Some(selection)).await.map(Some)
    }
}

fn zero_based(value: i64) -> u32 {
    u32::try_from(value.saturating_sub(1)).unwrap_or(0)
}

impl std::fmt::Debug for DebugStackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugStackFrame")
            .field("thread_id", &self.thread_id)
            .field("raw", &*lock(&self.raw))
            .finish()
    }
}
