//! Capture of local changes and application of incoming deltas.
//!
//! [`DeltaCaptureService`] ties the ledger, resolver, materializer and
//! triage queue together:
//!
//! - outbound: ledger rows since a watermark become single-change deltas
//! - inbound: each delta is resolved, materialized, and appended back to the
//!   ledger so it propagates further; anything else goes to triage. A
//!   change the ledger already holds (same field, origin site and clock) is
//!   rewritten but not appended again, so it does not echo between sites.
//!
//! Inbound deltas are processed one at a time in input order. For each
//! delta the resolve/materialize/append sequence runs under a per-aggregate
//! lock, and a storage failure is contained to that delta by routing it to
//! triage. Only a failure to write triage itself aborts the batch.

use crate::clock::{SiteId, VectorClock};
use crate::delta::{AggregateKey, Delta, DeltaError, FieldChange, Origin};
use crate::locks::KeyLocks;
use crate::materialize::AggregateMaterializer;
use crate::resolver::{ConflictResolver, Resolution, VectorClockResolver};
use crate::schema::AggregateRegistry;
use crate::store::{
    AggregateClockState, ChangeLedger, ClockStateStore, LedgerEntry, RecordStore, StoreError,
};
use crate::triage::{
    is_triage_entry, TriageItem, TriageQueue, TriageSummary, REASON_DEFERRED, REASON_NOT_APPLIED,
    REASON_UNHANDLED,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Identity of the local site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteIdentity {
    /// This site's identifier
    pub site_id: SiteId,
    /// This device's identifier, if the site has several
    pub device_id: Option<String>,
}

impl SiteIdentity {
    /// Create a site identity.
    #[must_use]
    pub fn new(site_id: impl Into<SiteId>, device_id: Option<String>) -> Self {
        Self {
            site_id: site_id.into(),
            device_id,
        }
    }

    /// An origin stamped now.
    #[must_use]
    pub fn origin_now(&self) -> Origin {
        Origin::new(self.site_id.clone(), self.device_id.clone(), Utc::now())
    }
}

/// Cooperative cancellation checked between deltas.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    signal: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// A token that fires once the channel holds `true`.
    #[must_use]
    pub fn from_watch(signal: watch::Receiver<bool>) -> Self {
        Self {
            signal: Some(signal),
        }
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Tally of one inbound batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Deltas taken up for processing
    pub attempted: usize,
    /// Deltas written to their target record
    pub materialized: usize,
    /// Deltas routed to triage
    pub triaged: usize,
    /// Materialized deltas already reflected in clock state
    pub redelivered: usize,
    /// Processing stopped early on cancellation
    pub cancelled: bool,
}

/// Errors from capture and apply.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A store failed where no per-delta boundary applies
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A locally recorded change was malformed
    #[error(transparent)]
    Delta(#[from] DeltaError),
}

enum DeltaOutcome {
    Materialized { redelivery: bool },
    Triaged,
}

/// Capture and apply service for one site.
pub struct DeltaCaptureService {
    site: SiteIdentity,
    ledger: Arc<dyn ChangeLedger>,
    clocks: Arc<dyn ClockStateStore>,
    resolver: Arc<dyn ConflictResolver>,
    materializer: AggregateMaterializer,
    triage: TriageQueue,
    locks: KeyLocks,
}

impl DeltaCaptureService {
    /// Create a service using the vector-clock resolver.
    #[must_use]
    pub fn new(
        site: SiteIdentity,
        ledger: Arc<dyn ChangeLedger>,
        clocks: Arc<dyn ClockStateStore>,
        records: Arc<dyn RecordStore>,
        registry: AggregateRegistry,
    ) -> Self {
        Self {
            site,
            resolver: Arc::new(VectorClockResolver::new(clocks.clone())),
            materializer: AggregateMaterializer::new(registry, records),
            triage: TriageQueue::new(ledger.clone()),
            ledger,
            clocks,
            locks: KeyLocks::new(),
        }
    }

    /// Replace the conflict resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// The local site identity.
    #[must_use]
    pub fn site(&self) -> &SiteIdentity {
        &self.site
    }

    /// Ledger mutations observed at or after `since`, oldest first, one
    /// delta per field change. Triage rows are never exported.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    pub async fn capture_local_changes(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Delta>, SyncError> {
        let entries = self.ledger.read_since(since).await?;
        let deltas: Vec<Delta> = entries
            .iter()
            .filter(|e| !is_triage_entry(e))
            .map(LedgerEntry::to_delta)
            .collect();
        tracing::debug!(since = %since, count = deltas.len(), "Captured ledger changes");
        Ok(deltas)
    }

    /// Record a local mutation of one aggregate.
    ///
    /// Advances this site's counter on the aggregate clock and appends one
    /// ledger row per change, stamped with the local origin.
    ///
    /// # Errors
    ///
    /// Returns error if the change set is malformed or a store fails.
    pub async fn record_local_change(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        changes: Vec<FieldChange>,
    ) -> Result<Delta, SyncError> {
        let key = AggregateKey::new(aggregate_type, aggregate_id);
        let _guard = self.locks.acquire(&key).await;

        let current = self
            .clocks
            .load_clock(&key)
            .await?
            .map(|s| s.vector_clock)
            .unwrap_or_default();
        let next = current.increment(&self.site.site_id);

        let delta = Delta::new(
            aggregate_type,
            aggregate_id,
            changes,
            next.clone(),
            self.site.origin_now(),
        );
        delta.validate()?;

        self.clocks
            .save_clock(&AggregateClockState {
                key,
                vector_clock: next,
                updated_on_utc: delta.origin.captured_on_utc,
            })
            .await?;
        self.ledger
            .append(LedgerEntry::from_delta(&delta, delta.origin.captured_on_utc))
            .await?;

        tracing::debug!(
            aggregate_type,
            aggregate_id = %aggregate_id,
            clock = %delta.vector_clock,
            changes = delta.changes.len(),
            "Recorded local change"
        );
        Ok(delta)
    }

    /// Apply incoming deltas in order.
    ///
    /// # Errors
    ///
    /// Returns error only if a triage row cannot be written.
    pub async fn apply_incoming_deltas(&self, deltas: &[Delta]) -> Result<ApplyReport, SyncError> {
        self.apply_incoming_deltas_until(deltas, &Cancellation::never())
            .await
    }

    /// Apply incoming deltas in order, stopping between deltas once
    /// `cancel` fires. Deltas already processed stay applied.
    ///
    /// # Errors
    ///
    /// Returns error only if a triage row cannot be written.
    pub async fn apply_incoming_deltas_until(
        &self,
        deltas: &[Delta],
        cancel: &Cancellation,
    ) -> Result<ApplyReport, SyncError> {
        let mut report = ApplyReport::default();

        for delta in deltas {
            if cancel.is_cancelled() {
                tracing::info!(
                    processed = report.attempted,
                    remaining = deltas.len() - report.attempted,
                    "Delta batch cancelled"
                );
                report.cancelled = true;
                break;
            }
            report.attempted += 1;

            let key = delta.key();
            let _guard = self.locks.acquire(&key).await;

            match self.process(delta).await {
                Ok(DeltaOutcome::Materialized { redelivery }) => {
                    report.materialized += 1;
                    if redelivery {
                        report.redelivered += 1;
                    }
                }
                Ok(DeltaOutcome::Triaged) => report.triaged += 1,
                Err(err) => {
                    tracing::error!(aggregate = %key, error = %err, "Delta processing failed");
                    self.triage
                        .enqueue(delta, &format!("Delta processing failed: {err}"))
                        .await?;
                    report.triaged += 1;
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            materialized = report.materialized,
            triaged = report.triaged,
            redelivered = report.redelivered,
            cancelled = report.cancelled,
            "Applied incoming deltas"
        );
        Ok(report)
    }

    async fn process(&self, delta: &Delta) -> Result<DeltaOutcome, StoreError> {
        if let Err(err) = delta.validate() {
            self.triage
                .enqueue(delta, &format!("Invalid delta: {err}"))
                .await?;
            return Ok(DeltaOutcome::Triaged);
        }

        let outcome = self.resolver.resolve(delta).await?;
        match outcome.resolution {
            Resolution::Applied => {
                if !self.materializer.apply(delta).await? {
                    self.triage.enqueue(delta, REASON_NOT_APPLIED).await?;
                    return Ok(DeltaOutcome::Triaged);
                }
                let mut entries = LedgerEntry::from_delta(delta, Utc::now());
                if outcome.is_redelivery() {
                    // An equal clock is also what sibling fields of one
                    // captured change carry; only rows already logged are
                    // dropped.
                    let mut fresh = Vec::with_capacity(entries.len());
                    for entry in entries {
                        if !self.ledger.contains_change(&entry).await? {
                            fresh.push(entry);
                        }
                    }
                    entries = fresh;
                }

                let redelivery = entries.is_empty();
                if redelivery {
                    tracing::debug!(
                        aggregate = %delta.key(),
                        "Redelivered delta, ledger unchanged"
                    );
                } else {
                    self.ledger.append(entries).await?;
                }
                Ok(DeltaOutcome::Materialized { redelivery })
            }
            Resolution::Deferred => {
                self.triage.enqueue(delta, REASON_DEFERRED).await?;
                Ok(DeltaOutcome::Triaged)
            }
            Resolution::Unhandled => {
                tracing::warn!(
                    aggregate = %delta.key(),
                    "Resolver declined to decide on delta"
                );
                self.triage.enqueue(delta, REASON_UNHANDLED).await?;
                Ok(DeltaOutcome::Triaged)
            }
        }
    }

    /// The `take` most recent triage items, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    pub async fn get_triage(&self, take: usize) -> Result<Vec<TriageItem>, SyncError> {
        Ok(self.triage.recent(take).await?)
    }

    /// Triage counts by risk level.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    pub async fn triage_summary(&self) -> Result<TriageSummary, SyncError> {
        Ok(self.triage.summary().await?)
    }

    /// Re-derive per-aggregate clock state from the whole ledger.
    ///
    /// Returns the number of aggregates whose state was written.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read or a clock not written.
    pub async fn rebuild_clock_index(&self) -> Result<usize, SyncError> {
        let entries = self.ledger.read_since(DateTime::<Utc>::MIN_UTC).await?;

        let mut index: HashMap<AggregateKey, (VectorClock, DateTime<Utc>)> = HashMap::new();
        for entry in entries.iter().filter(|e| !is_triage_entry(e)) {
            let slot = index
                .entry(entry.key())
                .or_insert_with(|| (VectorClock::new(), entry.observed_on_utc));
            slot.0 = slot.0.merge(&entry.vector_clock);
            slot.1 = slot.1.max(entry.observed_on_utc);
        }

        let rebuilt = index.len();
        for (key, (vector_clock, updated_on_utc)) in index {
            let _guard = self.locks.acquire(&key).await;
            self.clocks
                .save_clock(&AggregateClockState {
                    key,
                    vector_clock,
                    updated_on_utc,
                })
                .await?;
        }

        tracing::info!(aggregates = rebuilt, "Rebuilt clock index from ledger");
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockComparison;
    use crate::resolver::DisabledResolver;
    use crate::store::{MemoryStore, Record};
    use crate::triage::RiskLevel;
    use crate::value::FieldValue;
    use async_trait::async_trait;

    fn service(store: &Arc<MemoryStore>, site: &str) -> DeltaCaptureService {
        DeltaCaptureService::new(
            SiteIdentity::new(site, None),
            store.clone(),
            store.clone(),
            store.clone(),
            AggregateRegistry::with_defaults(),
        )
    }

    async fn seed_agreement(store: &MemoryStore) -> Uuid {
        let id = Uuid::new_v4();
        seed_agreement_as(store, id).await;
        id
    }

    async fn seed_agreement_as(store: &MemoryStore, id: Uuid) {
        store
            .save_record(
                "Agreement",
                "AgreementId",
                &Record::new()
                    .with("AgreementId", id)
                    .with("Status", "Pending"),
            )
            .await
            .unwrap();
    }

    async fn seed_clock(store: &MemoryStore, id: Uuid, clock: &[(&str, u64)]) {
        store
            .save_clock(&AggregateClockState {
                key: AggregateKey::new("Agreement", id),
                vector_clock: VectorClock::from_entries(clock.iter().map(|&(s, c)| (s, c))),
                updated_on_utc: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn incoming(
        aggregate_type: &str,
        id: Uuid,
        clock: &[(&str, u64)],
        changes: Vec<FieldChange>,
    ) -> Delta {
        Delta::new(
            aggregate_type,
            id,
            changes,
            VectorClock::from_entries(clock.iter().map(|&(s, c)| (s, c))),
            Origin::new("B", Some("laptop".into()), Utc::now()),
        )
    }

    async fn record(store: &MemoryStore, id: Uuid) -> Record {
        store
            .find_record("Agreement", "AgreementId", id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn clock_of(store: &MemoryStore, id: Uuid) -> VectorClock {
        store
            .load_clock(&AggregateKey::new("Agreement", id))
            .await
            .unwrap()
            .unwrap()
            .vector_clock
    }

    #[tokio::test]
    async fn concurrent_delta_is_materialized_and_logged() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let id = seed_agreement(&store).await;
        seed_clock(&store, id, &[("A", 2)]).await;

        let delta = incoming(
            "Agreement",
            id,
            &[("A", 1), ("B", 1)],
            vec![FieldChange::new("Title", "Lease", FieldValue::Null)],
        );
        let report = sync.apply_incoming_deltas(&[delta]).await.unwrap();

        assert_eq!(report.materialized, 1);
        assert_eq!(report.triaged, 0);
        assert_eq!(
            clock_of(&store, id).await,
            VectorClock::from_entries([("A", 2u64), ("B", 1)])
        );
        assert_eq!(
            record(&store, id).await.get("Title"),
            Some(&FieldValue::from("Lease"))
        );

        let exported = sync
            .capture_local_changes(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].origin.site_id.as_str(), "B");
        assert_eq!(exported[0].origin.device_id.as_deref(), Some("laptop"));
        assert_eq!(exported[0].vector_clock.get("B"), 1);
    }

    #[tokio::test]
    async fn dominated_delta_goes_to_triage_without_materializing() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let id = seed_agreement(&store).await;
        seed_clock(&store, id, &[("A", 3)]).await;

        let delta = incoming(
            "Agreement",
            id,
            &[("A", 2)],
            vec![FieldChange::new("Status", "Approved", "Pending")],
        );
        let report = sync.apply_incoming_deltas(&[delta]).await.unwrap();
        assert_eq!(report.triaged, 1);
        assert_eq!(report.materialized, 0);

        let triage = sync.get_triage(10).await.unwrap();
        assert_eq!(triage.len(), 1);
        assert!(triage[0].reason.contains("dominated"));
        assert_eq!(record(&store, id).await.get("Status"), Some(&FieldValue::from("Pending")));
        assert_eq!(clock_of(&store, id).await, VectorClock::from_entries([("A", 3u64)]));
    }

    #[tokio::test]
    async fn unknown_type_is_triaged_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");

        let delta = incoming(
            "Invoice",
            Uuid::new_v4(),
            &[("B", 1)],
            vec![FieldChange::new("Total", 10i64, 5i64)],
        );
        let report = sync.apply_incoming_deltas(&[delta]).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.triaged, 1);

        let triage = sync.get_triage(10).await.unwrap();
        assert_eq!(triage.len(), 1);
        assert_eq!(triage[0].reason, REASON_NOT_APPLIED);
        assert_eq!(triage[0].aggregate_type, "Invoice");
    }

    #[tokio::test]
    async fn unhandled_resolution_is_triaged() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A").with_resolver(Arc::new(DisabledResolver));
        let id = seed_agreement(&store).await;

        let delta = incoming(
            "Agreement",
            id,
            &[("B", 1)],
            vec![FieldChange::new("Status", "Rejected", "Pending")],
        );
        sync.apply_incoming_deltas(&[delta]).await.unwrap();

        let triage = sync.get_triage(10).await.unwrap();
        assert_eq!(triage[0].reason, REASON_UNHANDLED);
        assert_eq!(triage[0].risk_level, Some(RiskLevel::Warning));
    }

    #[tokio::test]
    async fn replaying_a_delta_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let id = seed_agreement(&store).await;

        let delta = incoming(
            "Agreement",
            id,
            &[("B", 4)],
            vec![FieldChange::new("Status", "Approved", "Pending")],
        );
        let first = sync.apply_incoming_deltas(&[delta.clone()]).await.unwrap();
        let clock_after_first = clock_of(&store, id).await;
        let status_after_first = record(&store, id).await.get("Status").cloned();
        let ledger_after_first = store.ledger_len().await;

        let second = sync.apply_incoming_deltas(&[delta]).await.unwrap();

        assert_eq!(first.materialized, 1);
        assert_eq!(second.materialized, 1);
        assert_eq!(second.redelivered, 1);
        assert_eq!(clock_of(&store, id).await, clock_after_first);
        assert_eq!(record(&store, id).await.get("Status").cloned(), status_after_first);
        assert_eq!(store.ledger_len().await, ledger_after_first);
    }

    #[tokio::test]
    async fn record_local_change_ticks_site_counter() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let id = Uuid::new_v4();

        sync.record_local_change(
            "Agreement",
            id,
            vec![FieldChange::new("Title", "Draft", FieldValue::Null)],
        )
        .await
        .unwrap();
        let second = sync
            .record_local_change(
                "Agreement",
                id,
                vec![
                    FieldChange::new("Title", "Final", "Draft"),
                    FieldChange::new("Revision", 2i64, 1i64),
                ],
            )
            .await
            .unwrap();

        assert_eq!(second.vector_clock.get("A"), 2);
        assert_eq!(clock_of(&store, id).await, second.vector_clock);

        let exported = sync
            .capture_local_changes(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(exported.len(), 3);
        assert!(exported.iter().all(|d| d.changes.len() == 1));
        assert_eq!(
            exported[0].vector_clock.compare(&exported[1].vector_clock),
            ClockComparison::Dominated
        );
    }

    #[tokio::test]
    async fn record_local_change_rejects_empty_field_name() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let err = sync
            .record_local_change(
                "Agreement",
                Uuid::new_v4(),
                vec![FieldChange::new("", 1i64, FieldValue::Null)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Delta(_)));
        assert_eq!(store.ledger_len().await, 0);
    }

    #[tokio::test]
    async fn capture_skips_triage_and_respects_watermark() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");

        sync.apply_incoming_deltas(&[incoming(
            "Invoice",
            Uuid::new_v4(),
            &[("B", 1)],
            vec![FieldChange::new("Total", 1i64, 0i64)],
        )])
        .await
        .unwrap();
        assert!(sync
            .capture_local_changes(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap()
            .is_empty());

        sync.record_local_change(
            "Party",
            Uuid::new_v4(),
            vec![FieldChange::new("DisplayName", "Acme", FieldValue::Null)],
        )
        .await
        .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert!(sync.capture_local_changes(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_between_deltas() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let (tx, rx) = watch::channel(false);
        let cancel = Cancellation::from_watch(rx);

        let deltas: Vec<Delta> = (0..3)
            .map(|_| incoming("Invoice", Uuid::new_v4(), &[("B", 1)], Vec::new()))
            .collect();

        tx.send(true).unwrap();
        let report = sync
            .apply_incoming_deltas_until(&deltas, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
        assert!(sync.get_triage(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_field_change_relays_through_a_third_site() {
        let stores: Vec<Arc<MemoryStore>> = (0..3).map(|_| Arc::new(MemoryStore::new())).collect();
        let id = Uuid::new_v4();
        for store in &stores {
            seed_agreement_as(store, id).await;
        }
        let (a, b, c) = (
            service(&stores[0], "A"),
            service(&stores[1], "B"),
            service(&stores[2], "C"),
        );

        a.record_local_change(
            "Agreement",
            id,
            vec![
                FieldChange::new("Title", "Lease", FieldValue::Null),
                FieldChange::new("Revision", 2i64, FieldValue::Null),
            ],
        )
        .await
        .unwrap();
        let from_a = a
            .capture_local_changes(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(from_a.len(), 2);

        let at_b = b.apply_incoming_deltas(&from_a).await.unwrap();
        assert_eq!(at_b.materialized, 2);
        assert_eq!(at_b.redelivered, 0);

        let from_b = b
            .capture_local_changes(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        let relayed: Vec<&str> = from_b
            .iter()
            .map(|d| d.changes[0].field_name.as_str())
            .collect();
        assert_eq!(relayed, vec!["Title", "Revision"]);

        c.apply_incoming_deltas(&from_b).await.unwrap();
        let at_c = record(&stores[2], id).await;
        assert_eq!(at_c.get("Title"), Some(&FieldValue::from("Lease")));
        assert_eq!(at_c.get("Revision"), Some(&FieldValue::from(2i64)));

        // Both rows come back to A as changes it already holds.
        let ledger_at_a = stores[0].ledger_len().await;
        let echo = a.apply_incoming_deltas(&from_b).await.unwrap();
        assert_eq!(echo.materialized, 2);
        assert_eq!(echo.redelivered, 2);
        assert_eq!(stores[0].ledger_len().await, ledger_at_a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_batches_on_one_aggregate_keep_every_update() {
        let store = Arc::new(MemoryStore::new());
        let sync = Arc::new(service(&store, "A"));
        let id = seed_agreement(&store).await;

        let revisions: Vec<Delta> = (1..=25i64)
            .map(|n| {
                Delta::new(
                    "Agreement",
                    id,
                    vec![FieldChange::new("Revision", n, FieldValue::Null)],
                    VectorClock::from_entries([("B", n.unsigned_abs())]),
                    Origin::new("B", None, Utc::now()),
                )
            })
            .collect();
        let titles: Vec<Delta> = (1..=25i64)
            .map(|n| {
                Delta::new(
                    "Agreement",
                    id,
                    vec![FieldChange::new("Title", format!("v{n}"), FieldValue::Null)],
                    VectorClock::from_entries([("C", n.unsigned_abs())]),
                    Origin::new("C", None, Utc::now()),
                )
            })
            .collect();

        let first = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.apply_incoming_deltas(&revisions).await })
        };
        let second = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.apply_incoming_deltas(&titles).await })
        };
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.materialized + second.materialized, 50);
        assert_eq!(first.triaged + second.triaged, 0);
        assert_eq!(
            clock_of(&store, id).await,
            VectorClock::from_entries([("B", 25u64), ("C", 25)])
        );
        let merged = record(&store, id).await;
        assert_eq!(merged.get("Revision"), Some(&FieldValue::from(25i64)));
        assert_eq!(merged.get("Title"), Some(&FieldValue::from("v25")));
        assert_eq!(store.ledger_len().await, 50);
    }

    struct CancelOnSave {
        inner: Arc<MemoryStore>,
        cancel: watch::Sender<bool>,
    }

    #[async_trait]
    impl RecordStore for CancelOnSave {
        async fn find_record(
            &self,
            aggregate_type: &str,
            key_field: &str,
            id: Uuid,
        ) -> Result<Option<Record>, StoreError> {
            self.inner.find_record(aggregate_type, key_field, id).await
        }

        async fn save_record(
            &self,
            aggregate_type: &str,
            key_field: &str,
            record: &Record,
        ) -> Result<(), StoreError> {
            self.inner
                .save_record(aggregate_type, key_field, record)
                .await?;
            self.cancel.send_replace(true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_mid_batch_keeps_processed_deltas() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let sync = DeltaCaptureService::new(
            SiteIdentity::new("A", None),
            store.clone(),
            store.clone(),
            Arc::new(CancelOnSave {
                inner: store.clone(),
                cancel: tx,
            }),
            AggregateRegistry::with_defaults(),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(seed_agreement(&store).await);
        }
        let deltas: Vec<Delta> = ids
            .iter()
            .map(|&id| {
                incoming(
                    "Agreement",
                    id,
                    &[("B", 1)],
                    vec![FieldChange::new("Status", "Approved", "Pending")],
                )
            })
            .collect();

        let report = sync
            .apply_incoming_deltas_until(&deltas, &Cancellation::from_watch(rx))
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.materialized, 1);
        assert_eq!(
            record(&store, ids[0]).await.get("Status"),
            Some(&FieldValue::from("Approved"))
        );
        assert_eq!(store.ledger_len().await, 1);
        for &id in &ids[1..] {
            assert_eq!(
                record(&store, id).await.get("Status"),
                Some(&FieldValue::from("Pending"))
            );
            assert!(store
                .load_clock(&AggregateKey::new("Agreement", id))
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn rebuild_restores_clock_index() {
        let store = Arc::new(MemoryStore::new());
        let sync = service(&store, "A");
        let id = Uuid::new_v4();
        let d = sync
            .record_local_change(
                "Agreement",
                id,
                vec![FieldChange::new("Title", "x", FieldValue::Null)],
            )
            .await
            .unwrap();

        let fresh = Arc::new(MemoryStore::new());
        fresh.append(LedgerEntry::from_delta(&d, Utc::now())).await.unwrap();
        let rebuilt = service(&fresh, "A").rebuild_clock_index().await.unwrap();

        assert_eq!(rebuilt, 1);
        assert_eq!(clock_of(&fresh, id).await, d.vector_clock);
    }

    struct BrokenRecords;

    #[async_trait]
    impl RecordStore for BrokenRecords {
        async fn find_record(
            &self,
            _aggregate_type: &str,
            _key_field: &str,
            _id: Uuid,
        ) -> Result<Option<Record>, StoreError> {
            Err(StoreError::Backend("disk unplugged".into()))
        }

        async fn save_record(
            &self,
            _aggregate_type: &str,
            _key_field: &str,
            _record: &Record,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk unplugged".into()))
        }
    }

    #[tokio::test]
    async fn storage_failure_is_contained_to_one_delta() {
        let store = Arc::new(MemoryStore::new());
        let sync = DeltaCaptureService::new(
            SiteIdentity::new("A", None),
            store.clone(),
            store.clone(),
            Arc::new(BrokenRecords),
            AggregateRegistry::with_defaults(),
        );

        let deltas = vec![
            incoming(
                "Agreement",
                Uuid::new_v4(),
                &[("B", 1)],
                vec![FieldChange::new("Title", "x", FieldValue::Null)],
            ),
            incoming(
                "Party",
                Uuid::new_v4(),
                &[("B", 2)],
                vec![FieldChange::new("DisplayName", "y", FieldValue::Null)],
            ),
        ];
        let report = sync.apply_incoming_deltas(&deltas).await.unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.triaged, 2);
        let triage = sync.get_triage(10).await.unwrap();
        assert!(triage
            .iter()
            .all(|t| t.reason.starts_with("Delta processing failed")));
    }
}
