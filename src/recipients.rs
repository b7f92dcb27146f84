//! Recipient groups and the canonical keys derived from them.
//!
//! A key is what the assignment store is indexed by. Keys are built from the
//! unique, sorted addresses of the "to" list, optionally followed by
//! [`CC_SEPARATOR`] and the unique, sorted "cc" addresses, so the same people
//! always produce the same key regardless of the order they were typed in.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Marker placed between the "to" part and the "cc" part of a group key.
pub const CC_SEPARATOR: &str = "[cc]";

/// Separator between addresses inside one part of a key.
const ADDRESS_JOINER: &str = ",";

static ANGLE_ADDRESS: OnceLock<Regex> = OnceLock::new();

/// Normalize a raw recipient string into a bare lowercase address.
///
/// Display names are stripped: `"Joe <JOE@example.com>"` becomes
/// `"joe@example.com"`. A missing closing bracket is tolerated.
pub fn normalize_address(raw: &str) -> String {
    let re = ANGLE_ADDRESS.get_or_init(|| {
        Regex::new(r"<([^<>]+)>?\s*$").expect("address regex is valid")
    });

    let bare = match re.captures(raw).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw,
    };
    bare.trim().to_lowercase()
}

/// Domain part of an address (everything after the first `@`).
///
/// Returns `None` for strings without an `@` or with nothing after it.
pub fn domain_suffix(address: &str) -> Option<&str> {
    address
        .split_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

/// The "to" and "cc" recipients of a message, in the order they were entered.
///
/// Duplicates are dropped on construction; the first occurrence keeps its
/// position, which matters for recipient priority during deduction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientGroup {
    to: Vec<String>,
    cc: Vec<String>,
}

impl RecipientGroup {
    pub fn new<T, C>(to: T, cc: C) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            to: unique_in_order(to),
            cc: unique_in_order(cc),
        }
    }

    /// Group with only "to" recipients.
    pub fn to_only<T>(to: T) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self::new(to, Vec::<String>::new())
    }

    /// Group made of exactly one "to" recipient.
    pub fn single(address: impl Into<String>) -> Self {
        Self::to_only([address.into()])
    }

    /// Build a group from raw adapter strings, normalizing every address.
    pub fn from_raw(to: &[String], cc: &[String]) -> Self {
        Self::new(
            to.iter().map(|a| normalize_address(a)).filter(|a| !a.is_empty()),
            cc.iter().map(|a| normalize_address(a)).filter(|a| !a.is_empty()),
        )
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn cc(&self) -> &[String] {
        &self.cc
    }

    /// Total number of recipients, "to" plus "cc".
    pub fn len(&self) -> usize {
        self.to.len() + self.cc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.cc.is_empty()
    }

    /// Every address, "to" first, then "cc".
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(self.cc.iter()).map(String::as_str)
    }

    /// The same group without its "cc" part.
    pub fn without_cc(&self) -> RecipientGroup {
        RecipientGroup {
            to: self.to.clone(),
            cc: Vec::new(),
        }
    }

    pub fn key(&self) -> RecipientKey {
        RecipientKey::build(self)
    }
}

fn unique_in_order<I>(items: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for item in items {
        let item: String = item.into();
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Canonical key for a [`RecipientGroup`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientKey(String);

impl RecipientKey {
    /// Build the canonical key of a group. Total and deterministic.
    pub fn build(group: &RecipientGroup) -> Self {
        let mut key = join_sorted(&group.to);
        if !group.cc.is_empty() {
            key.push_str(CC_SEPARATOR);
            key.push_str(&join_sorted(&group.cc));
        }
        RecipientKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when a raw key names exactly one "to" recipient and no "cc".
pub fn is_individual_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(ADDRESS_JOINER) && !key.contains(CC_SEPARATOR)
}

fn join_sorted(addresses: &[String]) -> String {
    let unique: BTreeSet<&str> = addresses.iter().map(String::as_str).collect();
    unique.into_iter().collect::<Vec<_>>().join(ADDRESS_JOINER)
}
