//! Source breakpoints and their session-installed counterparts.
//!
//! [`BreakpointStore`] is the process-wide set of user breakpoints, kept in a
//! [`MarkerStore`] under the `"breakpoint"` owner. It is independent of any
//! session. [`DebugBreakpoint`] pairs a stored breakpoint with the adapter's
//! acknowledgement once a session has installed it.

use url::Url;

use crate::emitter::Subscription;
use crate::marker::MarkerStore;
use crate::protocol::{self, SourceBreakpoint};

/// Owner tag of breakpoint markers.
pub const BREAKPOINT_OWNER: &str = "breakpoint";

/// A user-defined source breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Source the breakpoint is set in.
    pub uri: Url,
    /// Disabled breakpoints are never sent to an adapter.
    pub enabled: bool,
    /// Line (1-based), column and conditions as sent to the adapter.
    pub raw: SourceBreakpoint,
}

impl Breakpoint {
    /// An enabled breakpoint at `line`.
    pub fn new(uri: Url, line: i64) -> Self {
        Self {
            uri,
            enabled: true,
            raw: SourceBreakpoint::at(line, None),
        }
    }

    /// Pin the breakpoint to a column.
    pub fn with_column(mut self, column: i64) -> Self {
        self.raw.column = Some(column);
        self
    }

    /// Create a conditional breakpoint.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.raw.condition = Some(condition.into());
        self
    }

    /// Create a breakpoint with a hit condition.
    pub fn with_hit_condition(mut self, hit_condition: impl Into<String>) -> Self {
        self.raw.hit_condition = Some(hit_condition.into());
        self
    }

    /// Create a logpoint.
    pub fn with_log_message(mut self, msg: impl Into<String>) -> Self {
        self.raw.log_message = Some(msg.into());
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Line of the breakpoint (1-based).
    pub fn line(&self) -> i64 {
        self.raw.line
    }
}

/// Filter for [`BreakpointStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakpointFilter {
    /// Only breakpoints in this source.
    pub uri: Option<Url>,
    /// Only enabled (`Some(true)`) or disabled (`Some(false)`) breakpoints.
    pub enabled: Option<bool>,
}

impl BreakpointFilter {
    /// Every breakpoint in `uri`.
    pub fn uri(uri: Url) -> Self {
        Self {
            uri: Some(uri),
            enabled: None,
        }
    }

    /// Restrict to the given enabled state.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }
}

/// Drop later breakpoints on an already-used line and stamp `uri` on the rest.
fn unique_lines(uri: &Url, breakpoints: Vec<Breakpoint>) -> Vec<Breakpoint> {
    let mut unique: Vec<Breakpoint> = Vec::with_capacity(breakpoints.len());
    for mut bp in breakpoints {
        if unique.iter().any(|u| u.raw.line == bp.raw.line) {
            continue;
        }
        bp.uri = uri.clone();
        unique.push(bp);
    }
    unique
}

/// Process-wide breakpoint storage.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    markers: MarkerStore<Breakpoint>,
}

impl BreakpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The breakpoint on `line` of `uri`, if any.
    pub fn get(&self, uri: &Url, line: i64) -> Option<Breakpoint> {
        self.markers
            .find(Some(uri), Some(BREAKPOINT_OWNER), |bp| bp.raw.line == line)
            .into_iter()
            .next()
            .map(|m| m.data)
    }

    /// Breakpoints matching `filter`, ordered by URI then insertion order.
    pub fn list(&self, filter: &BreakpointFilter) -> Vec<Breakpoint> {
        self.markers
            .find(filter.uri.as_ref(), Some(BREAKPOINT_OWNER), |bp| {
                filter.enabled.map_or(true, |enabled| bp.enabled == enabled)
            })
            .into_iter()
            .map(|m| m.data)
            .collect()
    }

    /// Replace every breakpoint of `uri` and notify listeners once.
    ///
    /// A later breakpoint on an already-used line is dropped, so the store
    /// never holds two breakpoints for one `(uri, line)`.
    pub fn set_all(&self, uri: &Url, breakpoints: Vec<Breakpoint>) {
        self.markers
            .set_markers(uri, BREAKPOINT_OWNER, unique_lines(uri, breakpoints));
    }

    /// Remove the breakpoint on `line`, or add an enabled one at
    /// `(line, column)` when there is none.
    pub fn toggle(&self, uri: &Url, line: i64, column: Option<i64>) {
        self.markers.update(uri, BREAKPOINT_OWNER, |current| {
            let mut next: Vec<Breakpoint> = current
                .iter()
                .filter(|bp| bp.raw.line != line)
                .cloned()
                .collect();
            if next.len() == current.len() {
                let mut bp = Breakpoint::new(uri.clone(), line);
                bp.raw.column = column;
                next.push(bp);
            }
            Some(unique_lines(uri, next))
        });
    }

    /// Enable or disable the breakpoint on `line`. Returns false when there
    /// is no breakpoint there.
    pub fn set_enabled(&self, uri: &Url, line: i64, enabled: bool) -> bool {
        let mut found = false;
        self.markers.update(uri, BREAKPOINT_OWNER, |current| {
            let index = current.iter().position(|bp| bp.raw.line == line)?;
            found = true;
            if current[index].enabled == enabled {
                return None;
            }
            let mut next = current.to_vec();
            next[index].enabled = enabled;
            Some(next)
        });
        found
    }

    /// Every URI holding at least one breakpoint.
    pub fn uris(&self) -> Vec<Url> {
        self.markers.uris()
    }

    /// Listen for changes; the listener receives the affected URI.
    pub fn on_did_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Url) + Send + Sync + 'static,
    {
        self.markers.on_did_change(listener)
    }
}

/// A breakpoint as presented to the UI: the stored breakpoint plus, when a
/// session installed it, the adapter's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugBreakpoint {
    /// The user's breakpoint.
    pub data: Breakpoint,
    /// Adapter acknowledgement, `None` when not installed.
    pub raw: Option<protocol::Breakpoint>,
}

impl DebugBreakpoint {
    /// A breakpoint no adapter has seen.
    pub fn uninstalled(data: Breakpoint) -> Self {
        Self { data, raw: None }
    }

    /// A breakpoint acknowledged by an adapter.
    pub fn installed(data: Breakpoint, raw: protocol::Breakpoint) -> Self {
        Self {
            data,
            raw: Some(raw),
        }
    }

    pub fn uri(&self) -> &Url {
        &self.data.uri
    }

    /// Adapter-assigned id.
    pub fn id(&self) -> Option<i64> {
        self.raw.as_ref().and_then(|raw| raw.id)
    }

    pub fn enabled(&self) -> bool {
        self.data.enabled
    }

    pub fn is_installed(&self) -> bool {
        self.raw.is_some()
    }

    pub fn verified(&self) -> bool {
        self.raw.as_ref().is_some_and(|raw| raw.verified)
    }

    /// Adapter message, empty when there is none.
    pub fn message(&self) -> &str {
        self.raw
            .as_ref()
            .and_then(|raw| raw.message.as_deref())
            .unwrap_or("")
    }

    /// Line (1-based); the adapter's resolved line wins.
    pub fn line(&self) -> i64 {
        self.raw
            .as_ref()
            .and_then(|raw| raw.line)
            .unwrap_or(self.data.raw.line)
    }

    pub fn column(&self) -> Option<i64> {
        self.raw
            .as_ref()
            .and_then(|raw| raw.column)
            .or(self.data.raw.column)
    }

    pub fn end_line(&self) -> Option<i64> {
        self.raw.as_ref().and_then(|raw| raw.end_line)
    }

    pub fn end_column(&self) -> Option<i64> {
        self.raw.as_ref().and_then(|raw| raw.end_column)
    }

    /// Source the adapter resolved the breakpoint to, if it moved it.
    pub fn resolved_source(&self) -> Option<&protocol::Source> {
        self.raw.as_ref().and_then(|raw| raw.source.as_ref())
    }
}
