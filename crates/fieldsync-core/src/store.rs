//! Storage seams for the sync core.
//!
//! The core reads and writes three stores owned by the host:
//!
//! - [`ChangeLedger`]: append-only log of field-level mutations
//! - [`ClockStateStore`]: per-aggregate vector clock index, derived from the ledger
//! - [`RecordStore`]: the business records that deltas materialize onto
//!
//! [`MemoryStore`] implements all three for tests and ephemeral sites.

use crate::clock::{ClockComparison, SiteId, VectorClock};
use crate::delta::{AggregateKey, Delta, FieldChange, Origin};
use crate::value::FieldValue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One row of the change ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Aggregate type tag
    pub aggregate_type: String,
    /// Aggregate identifier
    pub aggregate_id: Uuid,
    /// Mutated field, or a reserved sentinel
    pub field_name: String,
    /// Value before the change
    pub previous_value: FieldValue,
    /// Value after the change
    pub new_value: FieldValue,
    /// Site that produced the change
    pub origin_site_id: SiteId,
    /// Device that produced the change
    pub origin_device_id: Option<String>,
    /// When this site recorded the entry
    pub observed_on_utc: DateTime<Utc>,
    /// Causal stamp of the change
    pub vector_clock: VectorClock,
}

impl LedgerEntry {
    /// Ledger rows for every change in `delta`, keeping the delta's own
    /// origin and clock.
    #[must_use]
    pub fn from_delta(delta: &Delta, observed_on_utc: DateTime<Utc>) -> Vec<Self> {
        delta
            .changes
            .iter()
            .map(|change| Self {
                aggregate_type: delta.aggregate_type.clone(),
                aggregate_id: delta.aggregate_id,
                field_name: change.field_name.clone(),
                previous_value: change.previous_value.clone(),
                new_value: change.new_value.clone(),
                origin_site_id: delta.origin.site_id.clone(),
                origin_device_id: delta.origin.device_id.clone(),
                observed_on_utc,
                vector_clock: delta.vector_clock.clone(),
            })
            .collect()
    }

    /// Whether `other` records the same change: same aggregate, field and
    /// origin site, with an equal clock. Values and observation times are
    /// not compared.
    #[must_use]
    pub fn same_change(&self, other: &Self) -> bool {
        self.aggregate_type == other.aggregate_type
            && self.aggregate_id == other.aggregate_id
            && self.field_name == other.field_name
            && self.origin_site_id == other.origin_site_id
            && self.vector_clock.compare(&other.vector_clock) == ClockComparison::Equal
    }

    /// A single-change delta reconstructed from this row.
    ///
    /// The ledger keeps only the time this site observed the change, so the
    /// rebuilt origin carries `observed_on_utc` as its capture time. For a
    /// row appended from a remote delta that is the local apply time, not
    /// the time the origin site captured it.
    #[must_use]
    pub fn to_delta(&self) -> Delta {
        Delta::new(
            self.aggregate_type.clone(),
            self.aggregate_id,
            vec![FieldChange {
                field_name: self.field_name.clone(),
                new_value: self.new_value.clone(),
                previous_value: self.previous_value.clone(),
            }],
            self.vector_clock.clone(),
            Origin::new(
                self.origin_site_id.clone(),
                self.origin_device_id.clone(),
                self.observed_on_utc,
            ),
        )
    }

    /// The aggregate this entry belongs to.
    #[must_use]
    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(self.aggregate_type.clone(), self.aggregate_id)
    }
}

/// Last known causal state of one aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateClockState {
    /// Aggregate identity
    pub key: AggregateKey,
    /// Merged clock of every accepted delta
    pub vector_clock: VectorClock,
    /// When the clock last changed
    pub updated_on_utc: DateTime<Utc>,
}

/// A business record as a bag of named, typed fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
    /// Actor of the last modification
    #[serde(default)]
    pub modified_by: Option<String>,
    /// Time of the last modification
    #[serde(default)]
    pub modified_on_utc: Option<DateTime<Utc>>,
}

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Field value by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Assign a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Identifier stored in `key_field`, if it holds one.
    #[must_use]
    pub fn identifier(&self, key_field: &str) -> Option<Uuid> {
        match self.fields.get(key_field)? {
            FieldValue::Identifier(id) => Some(*id),
            FieldValue::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// Iterate over fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Errors raised by storage collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Underlying storage engine failed
    #[error("storage backend error: {0}")]
    Backend(String),
    /// Stored payload could not be encoded or decoded
    #[error("storage serialization error: {0}")]
    Serialization(String),
    /// A record lacks an identifier in its key field
    #[error("record of type {aggregate_type} has no identifier in {key_field}")]
    MissingKey {
        /// Aggregate type tag
        aggregate_type: String,
        /// Expected key field
        key_field: String,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Append-only change ledger.
#[async_trait]
pub trait ChangeLedger: Send + Sync {
    /// Append entries atomically.
    ///
    /// # Errors
    ///
    /// Returns error if the entries were not durably written.
    async fn append(&self, entries: Vec<LedgerEntry>) -> Result<(), StoreError>;

    /// Entries observed at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StoreError>;

    /// The `take` most recent entries for `field_name`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    async fn read_latest(
        &self,
        field_name: &str,
        take: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Whether a row for the same change as `entry` is already present,
    /// per [`LedgerEntry::same_change`].
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    async fn contains_change(&self, entry: &LedgerEntry) -> Result<bool, StoreError>;
}

/// Per-aggregate vector clock index.
#[async_trait]
pub trait ClockStateStore: Send + Sync {
    /// Current state for an aggregate, if any delta was ever accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn load_clock(
        &self,
        key: &AggregateKey,
    ) -> Result<Option<AggregateClockState>, StoreError>;

    /// Create or replace the state for an aggregate.
    ///
    /// # Errors
    ///
    /// Returns error if the state was not written.
    async fn save_clock(&self, state: &AggregateClockState) -> Result<(), StoreError>;
}

/// Business record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Find the record of `aggregate_type` whose `key_field` holds `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn find_record(
        &self,
        aggregate_type: &str,
        key_field: &str,
        id: Uuid,
    ) -> Result<Option<Record>, StoreError>;

    /// Create or replace a record, keyed by the identifier in `key_field`.
    ///
    /// # Errors
    ///
    /// Returns error if the record has no identifier or was not written.
    async fn save_record(
        &self,
        aggregate_type: &str,
        key_field: &str,
        record: &Record,
    ) -> Result<(), StoreError>;
}

/// In-memory implementation of every store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: RwLock<Vec<LedgerEntry>>,
    clocks: RwLock<HashMap<AggregateKey, AggregateClockState>>,
    records: RwLock<HashMap<(String, Uuid), Record>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows, including triage entries.
    pub async fn ledger_len(&self) -> usize {
        self.ledger.read().await.len()
    }
}

#[async_trait]
impl ChangeLedger for MemoryStore {
    async fn append(&self, entries: Vec<LedgerEntry>) -> Result<(), StoreError> {
        self.ledger.write().await.extend(entries);
        Ok(())
    }

    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self
            .ledger
            .read()
            .await
            .iter()
            .filter(|e| e.observed_on_utc >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.observed_on_utc);
        Ok(entries)
    }

    async fn read_latest(
        &self,
        field_name: &str,
        take: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let ledger = self.ledger.read().await;
        let mut entries: Vec<LedgerEntry> = ledger
            .iter()
            .rev()
            .filter(|e| e.field_name == field_name)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.observed_on_utc.cmp(&a.observed_on_utc));
        entries.truncate(take);
        Ok(entries)
    }

    async fn contains_change(&self, entry: &LedgerEntry) -> Result<bool, StoreError> {
        Ok(self.ledger.read().await.iter().any(|e| e.same_change(entry)))
    }
}

#[async_trait]
impl ClockStateStore for MemoryStore {
    async fn load_clock(
        &self,
        key: &AggregateKey,
    ) -> Result<Option<AggregateClockState>, StoreError> {
        Ok(self.clocks.read().await.get(key).cloned())
    }

    async fn save_clock(&self, state: &AggregateClockState) -> Result<(), StoreError> {
        self.clocks
            .write()
            .await
            .insert(state.key.clone(), state.clone());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_record(
        &self,
        aggregate_type: &str,
        key_field: &str,
        id: Uuid,
    ) -> Result<Option<Record>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(aggregate_type.to_string(), id))
            .filter(|r| r.identifier(key_field) == Some(id))
            .cloned())
    }

    async fn save_record(
        &self,
        aggregate_type: &str,
        key_field: &str,
        record: &Record,
    ) -> Result<(), StoreError> {
        let id = record
            .identifier(key_field)
            .ok_or_else(|| StoreError::MissingKey {
                aggregate_type: aggregate_type.to_string(),
                key_field: key_field.to_string(),
            })?;
        self.records
            .write()
            .await
            .insert((aggregate_type.to_string(), id), record.clone());
        Ok(())
    }
}
