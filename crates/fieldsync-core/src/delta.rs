//! Deltas: causally stamped field changes to one aggregate.

use crate::clock::{SiteId, VectorClock};
use crate::time::utc_rfc3339;
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where and when a change was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// Site that produced the change
    pub site_id: SiteId,
    /// Device within the site, if known
    pub device_id: Option<String>,
    /// Capture time
    #[serde(with = "utc_rfc3339")]
    pub captured_on_utc: DateTime<Utc>,
}

impl Origin {
    /// Create an origin.
    #[must_use]
    pub fn new(
        site_id: impl Into<SiteId>,
        device_id: Option<String>,
        captured_on_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            device_id,
            captured_on_utc,
        }
    }
}

/// A single field mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Target field name
    pub field_name: String,
    /// Value after the change
    #[serde(default = "null_value")]
    pub new_value: FieldValue,
    /// Value before the change
    #[serde(default = "null_value")]
    pub previous_value: FieldValue,
}

fn null_value() -> FieldValue {
    FieldValue::Null
}

impl FieldChange {
    /// Create a field change.
    #[must_use]
    pub fn new(
        field_name: impl Into<String>,
        new_value: impl Into<FieldValue>,
        previous_value: impl Into<FieldValue>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            new_value: new_value.into(),
            previous_value: previous_value.into(),
        }
    }
}

/// Identity of an aggregate: its type tag and identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    /// Aggregate type tag
    pub aggregate_type: String,
    /// Aggregate identifier
    pub aggregate_id: Uuid,
}

impl AggregateKey {
    /// Create a key.
    #[must_use]
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: Uuid) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// A causally stamped batch of field changes to one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    /// Aggregate type tag
    pub aggregate_type: String,
    /// Aggregate identifier
    pub aggregate_id: Uuid,
    /// Field changes in capture order
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    /// Causal history of the change
    #[serde(default)]
    pub vector_clock: VectorClock,
    /// Capture origin
    pub origin: Origin,
}

impl Delta {
    /// Create a delta.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        changes: Vec<FieldChange>,
        vector_clock: VectorClock,
        origin: Origin,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            changes,
            vector_clock,
            origin,
        }
    }

    /// The aggregate this delta targets.
    #[must_use]
    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(self.aggregate_type.clone(), self.aggregate_id)
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// Returns error if the aggregate type, a field name, or the origin site
    /// is empty.
    pub fn validate(&self) -> Result<(), DeltaError> {
        if self.aggregate_type.trim().is_empty() {
            return Err(DeltaError::EmptyAggregateType);
        }
        if self.origin.site_id.is_blank() {
            return Err(DeltaError::EmptyOriginSite);
        }
        if let Some(index) = self
            .changes
            .iter()
            .position(|c| c.field_name.trim().is_empty())
        {
            return Err(DeltaError::EmptyFieldName { index });
        }
        Ok(())
    }
}

/// Structural errors in a delta.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    /// Aggregate type is empty
    #[error("aggregate type must not be empty")]
    EmptyAggregateType,
    /// Origin site is empty
    #[error("origin site must not be empty")]
    EmptyOriginSite,
    /// A change has no field name
    #[error("change #{index} has an empty field name")]
    EmptyFieldName {
        /// Position of the offending change
        index: usize,
    },
}
