//! Materialization of accepted deltas onto business records.

use crate::delta::Delta;
use crate::schema::{AggregateRegistry, AggregateSchema};
use crate::store::{RecordStore, StoreError};
use crate::value::FieldValue;
use chrono::Utc;
use std::sync::Arc;

/// Actor recorded on records modified by materialization.
pub const MATERIALIZE_ACTOR: &str = "sync-materialize";

/// Why a field of a delta was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No such field on the aggregate kind
    UnknownField,
    /// Field is declared read-only
    ReadOnly,
    /// Value cannot be converted to the field's kind
    Unconvertible,
    /// `Null` written to a non-nullable field
    NotNullable,
}

/// Writes accepted field changes onto records, dispatching on aggregate type.
pub struct AggregateMaterializer {
    registry: AggregateRegistry,
    records: Arc<dyn RecordStore>,
}

impl AggregateMaterializer {
    /// Create a materializer over a registry and record store.
    #[must_use]
    pub fn new(registry: AggregateRegistry, records: Arc<dyn RecordStore>) -> Self {
        Self { registry, records }
    }

    /// The registry of known aggregate kinds.
    #[must_use]
    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    /// Apply a delta's field changes to its target record.
    ///
    /// Returns `true` iff at least one field was written. Unknown aggregate
    /// types and missing records return `false`. Individual fields that are
    /// unknown, read-only, or unconvertible are skipped.
    ///
    /// # Errors
    ///
    /// Returns error only if the record store fails.
    pub async fn apply(&self, delta: &Delta) -> Result<bool, StoreError> {
        let Some(schema) = self.registry.get(&delta.aggregate_type) else {
            tracing::warn!(
                aggregate_type = %delta.aggregate_type,
                "No aggregate kind registered for type"
            );
            return Ok(false);
        };
        let Some(key_field) = schema.key_field() else {
            tracing::warn!(
                aggregate_type = %delta.aggregate_type,
                "Aggregate kind declares no identifier field"
            );
            return Ok(false);
        };

        let Some(mut record) = self
            .records
            .find_record(schema.name(), &key_field.name, delta.aggregate_id)
            .await?
        else {
            tracing::debug!(
                aggregate_type = %delta.aggregate_type,
                aggregate_id = %delta.aggregate_id,
                "Target record not found"
            );
            return Ok(false);
        };

        let mut written = 0usize;
        for change in &delta.changes {
            match convert_change(schema, &change.field_name, &change.new_value) {
                Ok((name, value)) => {
                    record.set(name, value);
                    written += 1;
                }
                Err(reason) => {
                    tracing::debug!(
                        aggregate_type = %delta.aggregate_type,
                        field = %change.field_name,
                        value_tag = change.new_value.tag(),
                        ?reason,
                        "Skipping field"
                    );
                }
            }
        }

        if written == 0 {
            return Ok(false);
        }

        record.modified_by = Some(MATERIALIZE_ACTOR.to_string());
        record.modified_on_utc = Some(Utc::now());
        self.records
            .save_record(schema.name(), &key_field.name, &record)
            .await?;

        tracing::debug!(
            aggregate_type = %delta.aggregate_type,
            aggregate_id = %delta.aggregate_id,
            written,
            skipped = delta.changes.len() - written,
            "Materialized delta"
        );
        Ok(true)
    }
}

fn convert_change(
    schema: &AggregateSchema,
    field_name: &str,
    value: &FieldValue,
) -> Result<(String, FieldValue), SkipReason> {
    let spec = schema.lookup(field_name).ok_or(SkipReason::UnknownField)?;
    if spec.read_only {
        return Err(SkipReason::ReadOnly);
    }
    let converted = value.convert(&spec.kind).ok_or(SkipReason::Unconvertible)?;
    if converted.is_null() && !spec.nullable {
        return Err(SkipReason::NotNullable);
    }
    Ok((spec.name.clone(), converted))
}
