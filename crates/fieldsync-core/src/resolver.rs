//! Causal conflict resolution for incoming deltas.
//!
//! A delta is accepted unless its clock is dominated by the aggregate's
//! current clock. Accepted deltas merge their clock into the aggregate's
//! state immediately, before materialization is attempted: the clock records
//! that this causal history has been seen even if the field write later
//! fails. Materialization is a last-value field write, so a redelivered
//! delta resolves again (now `Equal`) and rewrites the same values.

use crate::clock::{ClockComparison, VectorClock};
use crate::delta::Delta;
use crate::store::{AggregateClockState, ClockStateStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decision for one delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Causally applicable; clock state has been merged
    Applied,
    /// Causally stale; state untouched
    Deferred,
    /// The resolver declined to decide
    Unhandled,
}

/// A resolution plus the clock comparison that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// The decision
    pub resolution: Resolution,
    /// Incoming clock compared to the current clock, when one was computed
    pub comparison: Option<ClockComparison>,
}

impl ResolveOutcome {
    /// An outcome with no comparison attached.
    #[must_use]
    pub fn bare(resolution: Resolution) -> Self {
        Self {
            resolution,
            comparison: None,
        }
    }

    /// Whether the delta carried no causal history the aggregate lacked.
    ///
    /// The delta may still hold a field change the ledger has not logged,
    /// since every field of one captured change shares a clock.
    #[must_use]
    pub fn is_redelivery(&self) -> bool {
        self.resolution == Resolution::Applied && self.comparison == Some(ClockComparison::Equal)
    }
}

/// Decides whether a delta may be applied.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Resolve one delta.
    ///
    /// # Errors
    ///
    /// Returns error if clock state cannot be read or written.
    async fn resolve(&self, delta: &Delta) -> Result<ResolveOutcome, StoreError>;
}

/// Vector-clock resolver backed by the per-aggregate clock index.
pub struct VectorClockResolver {
    clocks: Arc<dyn ClockStateStore>,
}

impl VectorClockResolver {
    /// Create a resolver over a clock store.
    #[must_use]
    pub fn new(clocks: Arc<dyn ClockStateStore>) -> Self {
        Self { clocks }
    }
}

#[async_trait]
impl ConflictResolver for VectorClockResolver {
    async fn resolve(&self, delta: &Delta) -> Result<ResolveOutcome, StoreError> {
        let key = delta.key();
        let current = self
            .clocks
            .load_clock(&key)
            .await?
            .map(|state| state.vector_clock)
            .unwrap_or_default();

        let comparison = delta.vector_clock.compare(&current);
        if comparison == ClockComparison::Dominated {
            tracing::debug!(
                aggregate = %key,
                incoming = %delta.vector_clock,
                current = %current,
                "Incoming delta is causally stale"
            );
            return Ok(ResolveOutcome {
                resolution: Resolution::Deferred,
                comparison: Some(comparison),
            });
        }

        let merged: VectorClock = current.merge(&delta.vector_clock);
        tracing::debug!(
            aggregate = %key,
            ?comparison,
            merged = %merged,
            "Accepting delta"
        );
        self.clocks
            .save_clock(&AggregateClockState {
                key,
                vector_clock: merged,
                updated_on_utc: Utc::now(),
            })
            .await?;

        Ok(ResolveOutcome {
            resolution: Resolution::Applied,
            comparison: Some(comparison),
        })
    }
}

/// A resolver that never decides; every delta ends up in triage.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledResolver;

#[async_trait]
impl ConflictResolver for DisabledResolver {
    async fn resolve(&self, _delta: &Delta) -> Result<ResolveOutcome, StoreError> {
        Ok(ResolveOutcome::bare(Resolution::Unhandled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{AggregateKey, FieldChange, Origin};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn delta(id: Uuid, clock: &[(&str, u64)]) -> Delta {
        Delta::new(
            "Agreement",
            id,
            vec![FieldChange::new("Title", "x", "y")],
            VectorClock::from_entries(clock.iter().map(|&(s, c)| (s, c))),
            Origin::new("B", None, Utc::now()),
        )
    }

    async fn seed(store: &MemoryStore, id: Uuid, clock: &[(&str, u64)]) {
        store
            .save_clock(&AggregateClockState {
                key: AggregateKey::new("Agreement", id),
                vector_clock: VectorClock::from_entries(clock.iter().map(|&(s, c)| (s, c))),
                updated_on_utc: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn current(store: &MemoryStore, id: Uuid) -> Option<VectorClock> {
        store
            .load_clock(&AggregateKey::new("Agreement", id))
            .await
            .unwrap()
            .map(|s| s.vector_clock)
    }

    #[tokio::test]
    async fn first_delta_creates_clock_state() {
        let store = Arc::new(MemoryStore::new());
        let resolver = VectorClockResolver::new(store.clone());
        let id = Uuid::new_v4();

        let outcome = resolver.resolve(&delta(id, &[("A", 1)])).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Applied);
        assert_eq!(outcome.comparison, Some(ClockComparison::Dominates));
        assert_eq!(
            current(&store, id).await,
            Some(VectorClock::from_entries([("A", 1u64)]))
        );
    }

    #[tokio::test]
    async fn concurrent_delta_is_applied_and_merged() {
        let store = Arc::new(MemoryStore::new());
        let resolver = VectorClockResolver::new(store.clone());
        let id = Uuid::new_v4();
        seed(&store, id, &[("A", 2)]).await;

        let outcome = resolver
            .resolve(&delta(id, &[("A", 1), ("B", 1)]))
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Applied);
        assert_eq!(outcome.comparison, Some(ClockComparison::Concurrent));
        assert_eq!(
            current(&store, id).await,
            Some(VectorClock::from_entries([("A", 2u64), ("B", 1)]))
        );
    }

    #[tokio::test]
    async fn dominated_delta_is_deferred_without_touching_state() {
        let store = Arc::new(MemoryStore::new());
        let resolver = VectorClockResolver::new(store.clone());
        let id = Uuid::new_v4();
        seed(&store, id, &[("A", 3)]).await;

        let outcome = resolver.resolve(&delta(id, &[("A", 2)])).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Deferred);
        assert_eq!(
            current(&store, id).await,
            Some(VectorClock::from_entries([("A", 3u64)]))
        );
    }

    #[tokio::test]
    async fn equal_clock_is_a_redelivery() {
        let store = Arc::new(MemoryStore::new());
        let resolver = VectorClockResolver::new(store.clone());
        let id = Uuid::new_v4();
        seed(&store, id, &[("A", 3)]).await;

        let outcome = resolver.resolve(&delta(id, &[("A", 3)])).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Applied);
        assert!(outcome.is_redelivery());
    }

    #[test]
    fn disabled_resolver_declines() {
        let outcome = tokio_test::block_on(
            DisabledResolver.resolve(&delta(Uuid::new_v4(), &[("A", 1)])),
        )
        .unwrap();
        assert_eq!(outcome.resolution, Resolution::Unhandled);
        assert_eq!(outcome.comparison, None);
    }
}
