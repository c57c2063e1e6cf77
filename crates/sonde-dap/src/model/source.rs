//! Debug sources.
//!
//! A source is either a file on disk (`path`) or content only the adapter
//! can produce (`sourceReference > 0`). Adapter-internal sources get a
//! `dap:<name>?<sourceReference>` URI, files a `file://` URI. The URI is the
//! key under which frames and breakpoints share one [`DebugSource`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use crate::connection::Connection;
use crate::error::DapError;
use crate::lock;
use crate::protocol::{self, SourceArguments, SourceResponseBody};

/// URI scheme of adapter-internal sources.
pub const DAP_SCHEME: &str = "dap";

/// A zero-based position in a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// Zero-based range to reveal when opening a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: Position,
    pub end: Option<Position>,
}

/// Opens sources in an editor.
///
/// Implementations load adapter-internal content through
/// [`DebugSource::load`].
#[async_trait]
pub trait SourceOpener: Send + Sync {
    /// What the editor hands back for an opened source.
    type Handle: Send;

    async fn open(
        &self,
        source: &DebugSource,
        selection: Option<Selection>,
    ) -> Result<Self::Handle, DapError>;
}

/// A source referenced by frames or breakpoints of one session.
#[derive(Debug)]
pub struct DebugSource {
    uri: Url,
    raw: Mutex<protocol::Source>,
    connection: Connection,
}

impl DebugSource {
    /// URI of a protocol source.
    pub fn to_uri(raw: &protocol::Source) -> Result<Url, DapError> {
        if let Some(reference) = raw.source_reference.filter(|r| *r > 0) {
            let name = raw.name.as_deref().unwrap_or_default();
            return Url::parse(&format!("{DAP_SCHEME}:{name}?{reference}"))
                .map_err(|e| DapError::InvalidSource(format!("{name}: {e}")));
        }
        if let Some(path) = &raw.path {
            return Url::from_file_path(path)
                .map_err(|()| DapError::InvalidSource(format!("not an absolute path: {path}")));
        }
        Err(DapError::InvalidSource(
            serde_json::to_string(raw).unwrap_or_default(),
        ))
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// The protocol description last reported by the adapter.
    pub fn raw(&self) -> protocol::Source {
        lock(&self.raw).clone()
    }

    /// Display name: the adapter's name, else the file name.
    pub fn name(&self) -> String {
        let raw = lock(&self.raw);
        raw.name
            .clone()
            .or_else(|| {
                raw.path.as_deref().and_then(|p| {
                    std::path::Path::new(p)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_else(|| self.uri.to_string())
    }

    /// Whether the content lives only inside the adapter.
    pub fn is_adapter_internal(&self) -> bool {
        self.uri.scheme() == DAP_SCHEME
    }

    fn update(&self, raw: protocol::Source) {
        *lock(&self.raw) = raw;
    }

    /// Fetch the content of an adapter-internal source.
    pub async fn load(&self) -> Result<String, DapError> {
        let raw = self.raw();
        let source_reference = raw
            .source_reference
            .filter(|r| *r > 0)
            .ok_or_else(|| DapError::SourceUnavailable(self.uri.to_string()))?;
        let body: SourceResponseBody = self
            .connection
            .request(
                "source",
                SourceArguments {
                    source: Some(raw),
                    source_reference,
                },
            )
            .await?;
        Ok(body.content)
    }

    /// Reveal the source in an editor.
    pub async fn open<O: SourceOpener>(
        &self,
        opener: &O,
        selection: Option<Selection>,
    ) -> Result<O::Handle, DapError> {
        opener.open(self, selection).await
    }
}

/// The sources of one session, shared by URI.
#[derive(Debug)]
pub struct SourceRegistry {
    connection: Connection,
    sources: Mutex<HashMap<String, Arc<DebugSource>>>,
}

impl SourceRegistry {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// The shared source for `raw`, updated with the latest description.
    pub fn get_source(&self, raw: &protocol::Source) -> Result<Arc<DebugSource>, DapError> {
        let uri = DebugSource::to_uri(raw)?;
        let mut sources = lock(&self.sources);
        if let Some(source) = sources.get(uri.as_str()) {
            source.update(raw.clone());
            return Ok(Arc::clone(source));
        }
        let source = Arc::new(DebugSource {
            uri: uri.clone(),
            raw: Mutex::new(raw.clone()),
            connection: self.connection.clone(),
        });
        sources.insert(uri.to_string(), Arc::clone(&source));
        Ok(source)
    }

    /// A source already seen under `uri`.
    pub fn get_source_for_uri(&self, uri: &Url) -> Option<Arc<DebugSource>> {
        lock(&self.sources).get(uri.as_str()).cloned()
    }

    /// The protocol source to send for `uri`.
    ///
    /// Known sources keep the adapter's own description. Unknown `dap:` URIs
    /// are decoded back into a name and reference, anything else is sent
    /// as a path.
    pub fn to_source(&self, uri: &Url) -> protocol::Source {
        if let Some(source) = self.get_source_for_uri(uri) {
            return source.raw();
        }
        if uri.scheme() == DAP_SCHEME {
            return protocol::Source {
                name: Some(uri.path().to_string()),
                source_reference: uri.query().and_then(|q| q.parse().ok()),
                ..protocol::Source::default()
            };
        }
        let path = uri
            .to_file_path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|()| uri.path().to_string());
        let name = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        protocol::Source {
            name,
            path: Some(path),
            ..protocol::Source::default()
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
