//! The exchange envelope and its wire encodings.

use chrono::{DateTime, Utc};
use fieldsync_core::time::utc_rfc3339;
use fieldsync_core::{Delta, DeltaError, SiteId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Compact JSON, camelCase keys
    #[default]
    Json,
    /// CBOR with the same field names
    Cbor,
}

impl WireFormat {
    /// File extension for payloads in this format.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }

    /// Guess the format of a payload.
    ///
    /// JSON envelopes are objects, so their first non-blank byte is `{`.
    /// Anything else is treated as CBOR.
    #[must_use]
    pub fn detect(payload: &[u8]) -> Self {
        match payload.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Self::Json,
            _ => Self::Cbor,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for WireFormat {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(EnvelopeError::UnknownFormat(other.to_string())),
        }
    }
}

/// One exchange unit: the sender plus an ordered list of deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    /// Sending site
    pub source_site_id: SiteId,
    /// Sending device, if known
    pub source_device_id: Option<String>,
    /// When the envelope was built
    #[serde(with = "utc_rfc3339")]
    pub created_on_utc: DateTime<Utc>,
    /// Deltas in capture order
    #[serde(default)]
    pub deltas: Vec<Delta>,
}

impl TransportEnvelope {
    /// Create an envelope stamped now.
    #[must_use]
    pub fn new(
        source_site_id: SiteId,
        source_device_id: Option<String>,
        deltas: Vec<Delta>,
    ) -> Self {
        Self {
            source_site_id,
            source_device_id,
            created_on_utc: Utc::now(),
            deltas,
        }
    }

    /// Check the sender and every delta.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.source_site_id.is_blank() {
            return Err(EnvelopeError::EmptySource);
        }
        for (index, delta) in self.deltas.iter().enumerate() {
            delta
                .validate()
                .map_err(|source| EnvelopeError::InvalidDelta { index, source })?;
        }
        Ok(())
    }

    /// Serialize to the given wire format.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, EnvelopeError> {
        match format {
            WireFormat::Json => {
                serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialize(e.to_string()))
            }
            WireFormat::Cbor => self.to_cbor(),
        }
    }

    /// Deserialize and validate a payload in the given wire format.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed, carries a non-UTC
    /// timestamp, or fails validation.
    pub fn decode(payload: &[u8], format: WireFormat) -> Result<Self, EnvelopeError> {
        let envelope = match format {
            WireFormat::Json => serde_json::from_slice::<Self>(payload)
                .map_err(|e| EnvelopeError::Deserialize(e.to_string()))?,
            WireFormat::Cbor => Self::from_cbor(payload)?,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Like [`decode`](Self::decode), detecting the format first.
    ///
    /// # Errors
    ///
    /// See [`decode`](Self::decode).
    pub fn decode_detected(payload: &[u8]) -> Result<Self, EnvelopeError> {
        Self::decode(payload, WireFormat::detect(payload))
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes without validation.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        ciborium::from_reader(bytes).map_err(|e| EnvelopeError::Deserialize(e.to_string()))
    }
}

/// Errors for envelope encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Sender site is empty
    #[error("envelope source site must not be empty")]
    EmptySource,
    /// A delta failed validation
    #[error("delta #{index} is invalid: {source}")]
    InvalidDelta {
        /// Position of the delta in the envelope
        index: usize,
        /// What was wrong with it
        source: DeltaError,
    },
    /// Unrecognized wire format name
    #[error("unknown wire format: {0}")]
    UnknownFormat(String),
}
