//! Per-resource marker storage.
//!
//! Markers are grouped by resource URI and owner tag. The only write path
//! is [`MarkerStore::set_markers`], which replaces every marker of one owner
//! on one URI and then announces the URI on the change stream.

use std::collections::BTreeMap;
use std::sync::Mutex;

use url::Url;

use crate::emitter::{Emitter, Subscription};
use crate::lock;

/// A marker as returned by [`MarkerStore::find`].
#[derive(Debug, Clone, PartialEq)]
pub struct Marker<T> {
    /// Resource the marker belongs to.
    pub uri: Url,
    /// Owner tag the marker was stored under.
    pub owner: String,
    /// Marker payload.
    pub data: T,
}

/// Storage for markers of type `T`.
pub struct MarkerStore<T> {
    entries: Mutex<Entries<T>>,
    changed: Emitter<Url>,
}

impl<T: Clone + Send + 'static> MarkerStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            changed: Emitter::new(),
        }
    }

    /// Replace all markers of `owner` on `uri`. Returns the previous ones.
    ///
    /// An empty `markers` list removes the owner's entry entirely.
    pub fn set_markers(&self, uri: &Url, owner: &str, markers: Vec<T>) -> Vec<T> {
        let previous = replace(&mut lock(&self.entries), uri, owner, markers);
        self.changed.fire(uri);
        previous
    }

    /// Read and replace the markers of `owner` on `uri` under one lock.
    ///
    /// `edit` sees the current markers and returns the replacement, or
    /// `None` to leave them alone. Listeners are notified only on a
    /// replacement; the return value tells whether one happened.
    pub fn update<F>(&self, uri: &Url, owner: &str, edit: F) -> bool
    where
        F: FnOnce(&[T]) -> Option<Vec<T>>,
    {
        {
            let mut entries = lock(&self.entries);
            let current = entries
                .get(uri)
                .and_then(|owners| owners.get(owner))
                .map_or(&[][..], Vec::as_slice);
            let Some(markers) = edit(current) else {
                return false;
            };
            replace(&mut entries, uri, owner, markers);
        }
        self.changed.fire(uri);
        true
    }

    /// Markers matching the optional `uri` and `owner` and the data predicate.
    ///
    /// Results are ordered by URI, then owner, then insertion order.
    pub fn find<F>(&self, uri: Option<&Url>, owner: Option<&str>, data_filter: F) -> Vec<Marker<T>>
    where
        F: Fn(&T) -> bool,
    {
        let entries = lock(&self.entries);
        let mut result = Vec::new();
        let selected: Vec<(&Url, &BTreeMap<String, Vec<T>>)> = match uri {
            Some(uri) => entries.get_key_value(uri).into_iter().collect(),
            None => entries.iter().collect(),
        };
        for (uri, owners) in selected {
            for (marker_owner, markers) in owners {
                if owner.is_some_and(|o| o != marker_owner.as_str()) {
                    continue;
                }
                result.extend(markers.iter().filter(|m| data_filter(m)).map(|m| Marker {
                    uri: uri.clone(),
                    owner: marker_owner.clone(),
                    data: m.clone(),
                }));
            }
        }
        result
    }

    /// Every URI that currently holds markers.
    pub fn uris(&self) -> Vec<Url> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Listen for marker changes; the listener receives the affected URI.
    pub fn on_did_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Url) + Send + Sync + 'static,
    {
        self.changed.subscribe(listener)
    }
}

type Entries<T> = BTreeMap<Url, BTreeMap<String, Vec<T>>>;

fn replace<T>(entries: &mut Entries<T>, uri: &Url, owner: &str, markers: Vec<T>) -> Vec<T> {
    if markers.is_empty() {
        let previous = entries
            .get_mut(uri)
            .and_then(|owners| owners.remove(owner))
            .unwrap_or_default();
        if entries.get(uri).is_some_and(|owners| owners.is_empty()) {
            entries.remove(uri);
        }
        previous
    } else {
        entries
            .entry(uri.clone())
            .or_default()
            .insert(owner.to_string(), markers)
            .unwrap_or_default()
    }
}

impl<T: Clone + Send + 'static> Default for MarkerStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MarkerStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerStore")
            .field("entries", &*lock(&self.entries))
            .field("changed", &self.changed)
            .finish()
    }
}
