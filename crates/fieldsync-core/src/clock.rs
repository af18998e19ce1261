//! Vector clocks for causal ordering of field changes between sites.
//!
//! A vector clock maps each site to the number of events it has produced
//! that the holder of the clock has observed. Two clocks either order
//! causally (one dominates the other), are equal, or are concurrent.
//!
//! Clocks are immutable values: [`VectorClock::merge`] and
//! [`VectorClock::increment`] return new instances.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A site identifier.
///
/// Comparison, ordering and hashing ignore ASCII case while the original
/// spelling is preserved for display and serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    /// Create a site identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as originally spelled.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn folded(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(|b| b.to_ascii_lowercase())
    }
}

impl PartialEq for SiteId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for SiteId {}

impl Ord for SiteId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

impl PartialOrd for SiteId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for SiteId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.folded() {
            state.write_u8(b);
        }
        state.write_u8(0xff);
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SiteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Causal relationship of one clock relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockComparison {
    /// Both clocks carry identical knowledge
    Equal,
    /// The left clock has seen everything the right has, and more
    Dominates,
    /// The right clock has seen everything the left has, and more
    Dominated,
    /// Neither clock dominates the other
    Concurrent,
}

impl ClockComparison {
    /// The comparison seen from the other side.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Dominates => Self::Dominated,
            Self::Dominated => Self::Dominates,
            other => other,
        }
    }
}

/// A per-site logical counter map.
///
/// Missing sites read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ClockRepr", into = "ClockRepr")]
pub struct VectorClock {
    entries: BTreeMap<SiteId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(site, counter)` pairs.
    ///
    /// Duplicate sites (in any case) keep the highest counter.
    #[must_use]
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<SiteId>,
    {
        let mut clock = Self::new();
        for (site, counter) in entries {
            let slot = clock.entries.entry(site.into()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        clock
    }

    /// Counter for a site; zero if the site is absent.
    #[must_use]
    pub fn get(&self, site: &str) -> u64 {
        self.entries
            .get(&SiteId::new(site))
            .copied()
            .unwrap_or(0)
    }

    /// Return a copy with the counter for `site` advanced by one.
    #[must_use]
    pub fn increment(&self, site: &SiteId) -> Self {
        let mut next = self.clone();
        let slot = next.entries.entry(site.clone()).or_insert(0);
        *slot = slot.saturating_add(1);
        next
    }

    /// Compare this clock against `other`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockComparison {
        let mut greater = false;
        let mut less = false;

        let sites = self.entries.keys().chain(other.entries.keys());
        for site in sites {
            let left = self.entries.get(site).copied().unwrap_or(0);
            let right = other.entries.get(site).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return ClockComparison::Concurrent;
            }
        }

        match (greater, less) {
            (true, false) => ClockComparison::Dominates,
            (false, true) => ClockComparison::Dominated,
            _ => ClockComparison::Equal,
        }
    }

    /// Elementwise maximum over the union of both clocks' sites.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (site, &counter) in &other.entries {
            let slot = merged.entries.entry(site.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        merged
    }

    /// Iterate over `(site, counter)` pairs in site order.
    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, u64)> {
        self.entries.iter().map(|(site, &counter)| (site, counter))
    }

    /// Number of sites tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no site is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the JSON shape used in the ledger and on the wire.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the JSON shape produced by [`VectorClock::to_json`].
    ///
    /// # Errors
    ///
    /// Returns error if the input is not a valid clock document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (site, counter)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{site}:{counter}")?;
        }
        f.write_str("}")
    }
}

/// Serialized form: `{ "entries": { "<site>": n } }`.
#[derive(Serialize, Deserialize)]
struct ClockRepr {
    #[serde(default)]
    entries: HashMap<String, u64>,
}

impl From<ClockRepr> for VectorClock {
    fn from(repr: ClockRepr) -> Self {
        Self::from_entries(repr.entries)
    }
}

impl From<VectorClock> for ClockRepr {
    fn from(clock: VectorClock) -> Self {
        Self {
            entries: clock
                .entries
                .into_iter()
                .map(|(site, counter)| (site.0, counter))
                .collect(),
        }
    }
}
