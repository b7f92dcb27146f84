//! Bounded recipient-key → language map with least-recently-used eviction.

use crate::error::{MemoryError, Result};
use crate::persistent::Persisted;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use tracing::debug;

/// Called with `(evicted_key, evicted_language)` whenever an entry is pushed out.
pub type EvictionCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// What a [`AssignmentStore::set`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOutcome {
    /// Language the key held before, if any.
    pub previous: Option<String>,
    /// Entry evicted to make room for a new key.
    pub evicted: Option<(String, String)>,
}

pub struct AssignmentStore {
    entries: LruCache<String, String>,
    on_evict: Option<EvictionCallback>,
    /// Entries that did not fit when the store was restored, oldest first.
    trimmed: Vec<(String, String)>,
}

impl AssignmentStore {
    /// Empty store holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            on_evict: None,
            trimmed: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn set_eviction_callback(&mut self, callback: EvictionCallback) {
        self.on_evict = Some(callback);
    }

    /// Language assigned to `key`, marking the entry as most recently used.
    pub fn get(&mut self, key: &str) -> Option<String> {
        self.entries.get(key).filter(|lang| !lang.is_empty()).cloned()
    }

    /// Assign `language` to `key`.
    ///
    /// Existing keys are updated in place and become most recently used. A
    /// new key on a full store first evicts the least recently used entry and
    /// reports it to the eviction callback.
    pub fn set(&mut self, key: &str, language: &str) -> SetOutcome {
        if language.is_empty() {
            debug!("Ignoring empty language for key {}", key);
            return SetOutcome::default();
        }

        if let Some(current) = self.entries.get_mut(key) {
            let previous = std::mem::replace(current, language.to_string());
            return SetOutcome {
                previous: Some(previous).filter(|p| !p.is_empty()),
                evicted: None,
            };
        }

        let evicted = self.entries.push(key.to_string(), language.to_string());
        if let Some((evicted_key, evicted_lang)) = &evicted {
            debug!("Evicted {} ({}) to admit {}", evicted_key, evicted_lang, key);
            if let Some(callback) = &self.on_evict {
                callback(evicted_key.as_str(), evicted_lang.as_str());
            }
        }
        SetOutcome {
            previous: None,
            evicted,
        }
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    /// `(key, language)` pairs from least to most recently used.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Serialize as `{"hash": {...}, "options": {"sorted_keys": [...], "size": N}}`.
    pub fn to_json(&self) -> Result<String> {
        let snapshot = Snapshot {
            hash: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            options: SnapshotOptions {
                sorted_keys: self.keys(),
                size: Some(self.capacity()),
            },
        };
        serde_json::to_string(&snapshot).map_err(|e| MemoryError::json("assignment store", e))
    }

    /// Rebuild a store with the given capacity from its JSON form.
    ///
    /// Entries are replayed oldest first, so recency survives the round trip
    /// and a smaller capacity keeps only the most recent entries; the ones
    /// left out are kept aside for [`AssignmentStore::take_trimmed`]. Keys
    /// missing from `sorted_keys` are treated as the oldest. Non-text or
    /// empty languages are skipped.
    pub fn from_json(raw: &str, capacity: usize) -> Result<Self> {
        let snapshot = parse_snapshot(raw)?;
        let mut store = Self::new(capacity);
        for (key, language) in snapshot.ordered_pairs() {
            if let Some(dropped) = store.entries.push(key, language) {
                store.trimmed.push(dropped);
            }
        }
        if !store.trimmed.is_empty() {
            debug!(
                "{} stored assignments exceed capacity {}",
                store.trimmed.len(),
                capacity
            );
        }
        Ok(store)
    }

    /// Hand over the entries dropped by [`AssignmentStore::from_json`].
    pub fn take_trimmed(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.trimmed)
    }
}

/// The `(key, language)` pairs of a stored snapshot, oldest first.
pub(crate) fn stored_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    Ok(parse_snapshot(raw)?.ordered_pairs())
}

fn parse_snapshot(raw: &str) -> Result<Snapshot> {
    serde_json::from_str(raw).map_err(|e| MemoryError::json("assignment store", e))
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    hash: BTreeMap<String, Value>,
    #[serde(default)]
    options: SnapshotOptions,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotOptions {
    #[serde(default)]
    sorted_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
}

impl Snapshot {
    fn ordered_pairs(mut self) -> Vec<(String, String)> {
        let mut ordered = Vec::with_capacity(self.hash.len());
        let listed: Vec<String> = std::mem::take(&mut self.options.sorted_keys);

        let mut recent = Vec::new();
        for key in listed {
            if let Some(value) = self.hash.remove(&key) {
                recent.push((key, value));
            }
        }
        // Whatever is left was not listed in recency order: oldest.
        ordered.extend(std::mem::take(&mut self.hash));
        ordered.extend(recent);

        ordered
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(lang) if !lang.is_empty() => Some((key, lang)),
                _ => None,
            })
            .collect()
    }
}

/// Settings of a persisted [`AssignmentStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub capacity: usize,
}

impl Persisted for AssignmentStore {
    type Settings = StoreSettings;
    const WHAT: &'static str = "assignment store";

    fn empty(settings: &StoreSettings) -> Self {
        AssignmentStore::new(settings.capacity)
    }

    fn restore(raw: &str, settings: &StoreSettings) -> Result<Self> {
        AssignmentStore::from_json(raw, settings.capacity)
    }

    fn snapshot(&self) -> Result<String> {
        self.to_json()
    }
}
