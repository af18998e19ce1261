//! Export and import of envelopes through the capture service.

use crate::envelope::{EnvelopeError, TransportEnvelope, WireFormat};
use chrono::{DateTime, Utc};
use fieldsync_core::{Cancellation, DeltaCaptureService, SiteId, SyncError};
use serde::Serialize;
use std::sync::Arc;

/// Outcome of one import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportResult {
    /// Deltas taken up for processing, whether or not they materialized
    pub applied_count: usize,
    /// Deltas routed to triage
    pub triaged_count: usize,
    /// When the import finished
    pub received_on_utc: DateTime<Utc>,
    /// Sending site
    pub source_site_id: SiteId,
    /// Sending device
    pub source_device_id: Option<String>,
    /// Whether the import stopped early on cancellation
    pub cancelled: bool,
    /// Human-readable summary
    pub status: String,
}

/// Errors from export or import.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Envelope could not be encoded or decoded
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// Capture or apply failed
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Serializes captured deltas and ingests received envelopes.
pub struct TransportAdapter {
    service: Arc<DeltaCaptureService>,
    format: WireFormat,
}

impl TransportAdapter {
    /// Create an adapter exporting in `format`.
    #[must_use]
    pub fn new(service: Arc<DeltaCaptureService>, format: WireFormat) -> Self {
        Self { service, format }
    }

    /// The export format.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Capture deltas since `since` and wrap them in an envelope from this site.
    ///
    /// # Errors
    ///
    /// Returns error if capture fails.
    pub async fn export_envelope(
        &self,
        since: DateTime<Utc>,
    ) -> Result<TransportEnvelope, TransportError> {
        let deltas = self.service.capture_local_changes(since).await?;
        let site = self.service.site();
        Ok(TransportEnvelope::new(
            site.site_id.clone(),
            site.device_id.clone(),
            deltas,
        ))
    }

    /// Capture deltas since `since` and encode them.
    ///
    /// # Errors
    ///
    /// Returns error if capture or encoding fails.
    pub async fn export(&self, since: DateTime<Utc>) -> Result<Vec<u8>, TransportError> {
        let envelope = self.export_envelope(since).await?;
        let payload = envelope.encode(self.format)?;
        tracing::info!(
            since = %since,
            deltas = envelope.deltas.len(),
            bytes = payload.len(),
            format = %self.format,
            "Exported envelope"
        );
        Ok(payload)
    }

    /// Decode a payload (JSON or CBOR) and apply its deltas.
    ///
    /// Nothing is applied if the payload does not decode.
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is malformed or a triage write fails.
    pub async fn import(&self, payload: &[u8]) -> Result<TransportResult, TransportError> {
        self.import_until(payload, &Cancellation::never()).await
    }

    /// Like [`import`](Self::import), stopping between deltas on cancellation.
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is malformed or a triage write fails.
    pub async fn import_until(
        &self,
        payload: &[u8],
        cancel: &Cancellation,
    ) -> Result<TransportResult, TransportError> {
        let envelope = TransportEnvelope::decode_detected(payload)?;
        tracing::debug!(
            source = %envelope.source_site_id,
            created = %envelope.created_on_utc,
            deltas = envelope.deltas.len(),
            "Decoded envelope"
        );

        let report = self
            .service
            .apply_incoming_deltas_until(&envelope.deltas, cancel)
            .await?;

        let mut status = format!(
            "Imported {} deltas from {}",
            report.attempted, envelope.source_site_id
        );
        if report.triaged > 0 {
            status.push_str(&format!(", {} sent to triage", report.triaged));
        }
        if report.cancelled {
            status.push_str(&format!(
                ", cancelled with {} not processed",
                envelope.deltas.len() - report.attempted
            ));
        }

        Ok(TransportResult {
            applied_count: report.attempted,
            triaged_count: report.triaged,
            received_on_utc: Utc::now(),
            source_site_id: envelope.source_site_id,
            source_device_id: envelope.source_device_id,
            cancelled: report.cancelled,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{
        AggregateRegistry, Delta, FieldChange, FieldValue, MemoryStore, Origin, Record,
        RecordStore, SiteIdentity, VectorClock,
    };
    use uuid::Uuid;

    fn adapter(store: &Arc<MemoryStore>, site: &str, format: WireFormat) -> TransportAdapter {
        let service = DeltaCaptureService::new(
            SiteIdentity::new(site, Some(format!("{site}-hub"))),
            store.clone(),
            store.clone(),
            store.clone(),
            AggregateRegistry::with_defaults(),
        );
        TransportAdapter::new(Arc::new(service), format)
    }

    fn remote_delta(aggregate_type: &str, id: Uuid, changes: Vec<FieldChange>) -> Delta {
        Delta::new(
            aggregate_type,
            id,
            changes,
            VectorClock::from_entries([("B", 1u64)]),
            Origin::new("B", None, Utc::now()),
        )
    }

    #[tokio::test]
    async fn applied_count_is_attempted_deltas() {
        let store = Arc::new(MemoryStore::new());
        let agreement = Uuid::new_v4();
        let party = Uuid::new_v4();
        store
            .save_record("Agreement", "AgreementId", &Record::new().with("AgreementId", agreement))
            .await
            .unwrap();
        store
            .save_record("Party", "Id", &Record::new().with("Id", party))
            .await
            .unwrap();

        let envelope = TransportEnvelope::new(
            SiteId::new("B"),
            None,
            vec![
                remote_delta(
                    "Agreement",
                    agreement,
                    vec![FieldChange::new("Title", "Lease", FieldValue::Null)],
                ),
                remote_delta(
                    "Party",
                    party,
                    vec![FieldChange::new("DisplayName", "Acme", FieldValue::Null)],
                ),
                remote_delta(
                    "Warehouse",
                    Uuid::new_v4(),
                    vec![FieldChange::new("Bays", 12i64, 10i64)],
                ),
            ],
        );
        let payload = envelope.encode(WireFormat::Json).unwrap();

        let sync = adapter(&store, "A", WireFormat::Json);
        let result = sync.import(&payload).await.unwrap();

        assert_eq!(result.applied_count, 3);
        assert_eq!(result.triaged_count, 1);
        assert_eq!(result.source_site_id.as_str(), "B");
        assert!(result.status.contains("3 deltas from B"));

        let triage = sync.service.get_triage(10).await.unwrap();
        assert_eq!(triage.len(), 1);
        assert_eq!(triage[0].aggregate_type, "Warehouse");
    }

    #[tokio::test]
    async fn malformed_payload_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let sync = adapter(&store, "A", WireFormat::Json);

        let err = sync
            .import(br#"{"sourceSiteId":"B","deltas":[{"aggregateType":"#)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Envelope(_)));
        assert_eq!(store.ledger_len().await, 0);
    }

    #[tokio::test]
    async fn invalid_delta_rejects_whole_envelope() {
        let store = Arc::new(MemoryStore::new());
        let sync = adapter(&store, "A", WireFormat::Cbor);
        let envelope = TransportEnvelope::new(
            SiteId::new("B"),
            None,
            vec![
                remote_delta("Party", Uuid::new_v4(), Vec::new()),
                remote_delta("", Uuid::new_v4(), Vec::new()),
            ],
        );

        let err = sync
            .import(&envelope.encode(WireFormat::Cbor).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Envelope(EnvelopeError::InvalidDelta { index: 1, .. })
        ));
        assert_eq!(store.ledger_len().await, 0);
    }

    #[tokio::test]
    async fn export_then_import_between_sites() {
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        for store in [&store_a, &store_b] {
            store
                .save_record("Agreement", "AgreementId", &Record::new().with("AgreementId", id))
                .await
                .unwrap();
        }

        let site_a = adapter(&store_a, "A", WireFormat::Cbor);
        let site_b = adapter(&store_b, "B", WireFormat::Cbor);

        site_a
            .service
            .record_local_change(
                "Agreement",
                id,
                vec![FieldChange::new("Status", "Approved", "Pending")],
            )
            .await
            .unwrap();

        let payload = site_a.export(DateTime::<Utc>::MIN_UTC).await.unwrap();
        let envelope = TransportEnvelope::decode(&payload, WireFormat::Cbor).unwrap();
        assert_eq!(envelope.source_device_id.as_deref(), Some("A-hub"));
        assert_eq!(envelope.deltas.len(), 1);

        let result = site_b.import(&payload).await.unwrap();
        assert_eq!(result.applied_count, 1);
        assert_eq!(result.triaged_count, 0);

        let record = store_b
            .find_record("Agreement", "AgreementId", id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get("Status"), Some(&FieldValue::from("Approved")));

        // Site B now re-exports the change; importing it back at A is a
        // redelivery and must not grow A's ledger.
        let echoed = site_b.export(DateTime::<Utc>::MIN_UTC).await.unwrap();
        let before = store_a.ledger_len().await;
        site_a.import(&echoed).await.unwrap();
        assert_eq!(store_a.ledger_len().await, before);
    }
}
