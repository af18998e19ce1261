//! Triage queue for deltas that could not be applied automatically.
//!
//! Triage shares the change ledger's storage: each item is a ledger row
//! whose field name is [`TRIAGE_FIELD`] and whose new value carries a JSON
//! payload with the reason, the original delta, the capture time and a risk
//! level. Items are only ever appended; removal or resolution is left to an
//! operator process outside this crate.

use crate::delta::{Delta, FieldChange, Origin};
use crate::store::{ChangeLedger, LedgerEntry, StoreError};
use crate::time::utc_rfc3339;
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Reserved ledger field name marking triage rows.
pub const TRIAGE_FIELD: &str = "__triage__";

/// Reason recorded when materialization writes nothing.
pub const REASON_NOT_APPLIED: &str = "Unable to apply changes to target aggregate";
/// Reason recorded for causally stale deltas.
pub const REASON_DEFERRED: &str = "Vector clock dominated or conflict requires operator triage";
/// Reason recorded when the resolver declines to decide.
pub const REASON_UNHANDLED: &str = "Unhandled resolution outcome";

/// Severity hint for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Routine
    Info,
    /// Needs attention
    Warning,
}

impl RiskLevel {
    /// Classify a change set.
    ///
    /// A `Status` change whose new value mentions "denied" or "rejected" is a
    /// warning; everything else is informational.
    #[must_use]
    pub fn classify(changes: &[FieldChange]) -> Self {
        let flagged = changes.iter().any(|change| {
            change.field_name.eq_ignore_ascii_case("Status")
                && change.new_value.as_text().is_some_and(|text| {
                    let lowered = text.to_ascii_lowercase();
                    lowered.contains("denied") || lowered.contains("rejected")
                })
        });
        if flagged {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

/// A queued, unresolved delta.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageItem {
    /// Aggregate type tag
    pub aggregate_type: String,
    /// Aggregate identifier
    pub aggregate_id: Uuid,
    /// Why the delta was not applied
    pub reason: String,
    /// Origin of the original delta
    pub origin: Origin,
    /// When the item was queued
    pub observed_on_utc: DateTime<Utc>,
    /// The original field changes
    pub changes: Vec<FieldChange>,
    /// Risk classification, absent on items written without one
    pub risk_level: Option<RiskLevel>,
}

/// Counts for summary displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriageSummary {
    /// All items
    pub total: usize,
    /// Items classified `Info`
    pub info: usize,
    /// Items classified `Warning`
    pub warning: usize,
}

/// Stored payload of a triage row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriagePayload {
    reason: String,
    delta: Delta,
    #[serde(with = "utc_rfc3339")]
    captured_on_utc: DateTime<Utc>,
    #[serde(default)]
    risk_level: Option<RiskLevel>,
}

/// Append-only view over triage rows in the change ledger.
pub struct TriageQueue {
    ledger: Arc<dyn ChangeLedger>,
}

impl TriageQueue {
    /// Create a queue over a ledger.
    #[must_use]
    pub fn new(ledger: Arc<dyn ChangeLedger>) -> Self {
        Self { ledger }
    }

    /// Queue a delta with a reason.
    ///
    /// # Errors
    ///
    /// Returns error if the triage row was not written.
    pub async fn enqueue(&self, delta: &Delta, reason: &str) -> Result<TriageItem, StoreError> {
        let now = Utc::now();
        let risk_level = RiskLevel::classify(&delta.changes);
        let payload = TriagePayload {
            reason: reason.to_string(),
            delta: delta.clone(),
            captured_on_utc: now,
            risk_level: Some(risk_level),
        };

        let entry = LedgerEntry {
            aggregate_type: delta.aggregate_type.clone(),
            aggregate_id: delta.aggregate_id,
            field_name: TRIAGE_FIELD.to_string(),
            previous_value: FieldValue::Null,
            new_value: FieldValue::String(serde_json::to_string(&payload)?),
            origin_site_id: delta.origin.site_id.clone(),
            origin_device_id: delta.origin.device_id.clone(),
            observed_on_utc: now,
            vector_clock: delta.vector_clock.clone(),
        };
        self.ledger.append(vec![entry]).await?;

        tracing::warn!(
            aggregate_type = %delta.aggregate_type,
            aggregate_id = %delta.aggregate_id,
            origin = %delta.origin.site_id,
            ?risk_level,
            reason,
            "Delta routed to triage"
        );

        Ok(TriageItem {
            aggregate_type: delta.aggregate_type.clone(),
            aggregate_id: delta.aggregate_id,
            reason: reason.to_string(),
            origin: delta.origin.clone(),
            observed_on_utc: now,
            changes: delta.changes.clone(),
            risk_level: Some(risk_level),
        })
    }

    /// The `take` most recent items, newest first.
    ///
    /// Rows whose payload cannot be decoded are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    pub async fn recent(&self, take: usize) -> Result<Vec<TriageItem>, StoreError> {
        let rows = self.ledger.read_latest(TRIAGE_FIELD, take).await?;
        Ok(rows.iter().filter_map(decode_row).collect())
    }

    /// Counts over every queued item.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    pub async fn summary(&self) -> Result<TriageSummary, StoreError> {
        let items = self.recent(usize::MAX).await?;
        let mut summary = TriageSummary {
            total: items.len(),
            ..TriageSummary::default()
        };
        for item in &items {
            match item.risk_level.unwrap_or(RiskLevel::Info) {
                RiskLevel::Info => summary.info += 1,
                RiskLevel::Warning => summary.warning += 1,
            }
        }
        Ok(summary)
    }
}

fn decode_row(row: &LedgerEntry) -> Option<TriageItem> {
    let FieldValue::String(json) = &row.new_value else {
        tracing::warn!(aggregate_id = %row.aggregate_id, "Triage row without payload");
        return None;
    };
    match serde_json::from_str::<TriagePayload>(json) {
        Ok(payload) => Some(TriageItem {
            aggregate_type: payload.delta.aggregate_type,
            aggregate_id: payload.delta.aggregate_id,
            reason: payload.reason,
            origin: payload.delta.origin,
            observed_on_utc: row.observed_on_utc,
            changes: payload.delta.changes,
            risk_level: payload.risk_level,
        }),
        Err(err) => {
            tracing::warn!(
                aggregate_id = %row.aggregate_id,
                error = %err,
                "Undecodable triage payload"
            );
            None
        }
    }
}

/// Whether a ledger row is a triage row rather than a field mutation.
#[must_use]
pub fn is_triage_entry(entry: &LedgerEntry) -> bool {
    entry.field_name == TRIAGE_FIELD
}
