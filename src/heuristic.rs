//! Domain-suffix frequency table used as a fallback vote.
//!
//! Only single-recipient assignments contribute. Each one adds a count to
//! `(domain of the address, language)`; overwriting or evicting it takes the
//! count back. When no exact assignment matches a set of recipients, the
//! counts of their domains are summed per language and the largest sum wins.

use crate::error::{MemoryError, Result};
use crate::persistent::Persisted;
use crate::recipients::{domain_suffix, is_individual_key};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

/// Insertion-ordered `(suffix, language) → count` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainHeuristic {
    counts: IndexMap<(String, String), u64>,
}

impl DomainHeuristic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table built from existing `(key, language)` assignments; group keys
    /// are ignored.
    pub fn seeded<'a, I>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = Self::new();
        for (key, language) in assignments {
            if is_individual_key(key) {
                table.record(key, language);
            }
        }
        table
    }

    /// Add one vote for the domain of `address`.
    pub fn record(&mut self, address: &str, language: &str) {
        let Some(suffix) = domain_suffix(address) else {
            return;
        };
        if language.is_empty() {
            return;
        }
        *self
            .counts
            .entry((suffix.to_string(), language.to_string()))
            .or_insert(0) += 1;
    }

    /// Take back one vote for the domain of `address`, dropping the pair at zero.
    pub fn retract(&mut self, address: &str, language: &str) {
        let Some(suffix) = domain_suffix(address) else {
            return;
        };
        let pair = (suffix.to_string(), language.to_string());
        match self.counts.get_mut(&pair) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.counts.shift_remove(&pair);
            }
            None => debug!("No count to retract for {} ({})", suffix, language),
        }
    }

    /// Mirror one assignment-store write.
    ///
    /// The evicted entry and the previous language of `key` are retracted
    /// before the new language is counted, so the table always matches the
    /// set of single-recipient entries in the store.
    pub fn apply_write(
        &mut self,
        key: &str,
        previous: Option<&str>,
        language: &str,
        evicted: Option<(&str, &str)>,
    ) {
        if let Some((evicted_key, evicted_lang)) = evicted {
            self.forget_entry(evicted_key, evicted_lang);
        }
        if !is_individual_key(key) {
            return;
        }
        if let Some(previous) = previous {
            self.retract(key, previous);
        }
        self.record(key, language);
    }

    /// Take back the vote of a store entry that no longer exists.
    pub fn forget_entry(&mut self, key: &str, language: &str) {
        if is_individual_key(key) {
            self.retract(key, language);
        }
    }

    /// Language with the highest summed count over the domains of `addresses`.
    ///
    /// Ties go to the language first seen while walking the addresses in
    /// order. Returns `None` when no domain has any count.
    pub fn vote<'a, I>(&self, addresses: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut totals: IndexMap<&str, u64> = IndexMap::new();
        for address in addresses {
            let Some(suffix) = domain_suffix(address) else {
                continue;
            };
            let mut votes: Vec<(&str, u64)> = self
                .counts
                .iter()
                .filter(|((s, _), _)| s == suffix)
                .map(|((_, lang), count)| (lang.as_str(), *count))
                .collect();
            votes.sort_by(|a, b| b.1.cmp(&a.1));
            for (lang, count) in votes {
                *totals.entry(lang).or_insert(0) += count;
            }
        }

        let mut best: Option<(&str, u64)> = None;
        for (lang, total) in totals {
            if best.map_or(true, |(_, top)| total > top) {
                best = Some((lang, total));
            }
        }
        best.map(|(lang, _)| lang.to_string())
    }

    /// `(suffix, language, count)` rows in insertion order.
    pub fn pairs(&self) -> Vec<(String, String, u64)> {
        self.counts
            .iter()
            .map(|((suffix, lang), count)| (suffix.clone(), lang.clone(), *count))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Serialize as a flat `[[suffix, language, count], ...]` array.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.pairs()).map_err(|e| MemoryError::json("domain heuristic", e))
    }

    /// Load a stored table, dropping rows a past version got wrong.
    ///
    /// Rows with a count of zero or less and rows keyed by a recipient group
    /// instead of a single domain are discarded. Malformed rows are skipped.
    pub fn from_json(raw: &str) -> Result<Self> {
        let rows: Vec<Value> =
            serde_json::from_str(raw).map_err(|e| MemoryError::json("domain heuristic", e))?;

        let mut table = Self::new();
        for row in rows {
            let Some((suffix, language, count)) = parse_row(&row) else {
                warn!("Skipping malformed heuristic row {}", row);
                continue;
            };
            if count <= 0 || !is_individual_key(suffix) || language.is_empty() {
                debug!("Dropping legacy heuristic row {}", row);
                continue;
            }
            *table
                .counts
                .entry((suffix.to_string(), language.to_string()))
                .or_insert(0) += count as u64;
        }
        Ok(table)
    }
}

fn parse_row(row: &Value) -> Option<(&str, &str, i64)> {
    match row.as_array()?.as_slice() {
        [suffix, language, count] => Some((suffix.as_str()?, language.as_str()?, count.as_i64()?)),
        _ => None,
    }
}

/// Settings of a persisted [`DomainHeuristic`].
#[derive(Debug, Clone, Default)]
pub struct HeuristicSettings {
    /// Assignments used to build the table when none has been stored yet.
    pub seed: Vec<(String, String)>,
}

impl Persisted for DomainHeuristic {
    type Settings = HeuristicSettings;
    const WHAT: &'static str = "domain heuristic";

    fn empty(settings: &HeuristicSettings) -> Self {
        DomainHeuristic::seeded(settings.seed.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    fn restore(raw: &str, _: &HeuristicSettings) -> Result<Self> {
        DomainHeuristic::from_json(raw)
    }

    fn snapshot(&self) -> Result<String> {
        self.to_json()
    }
}
