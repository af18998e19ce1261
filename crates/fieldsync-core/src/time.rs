//! UTC timestamp parsing.
//!
//! Every timestamp crossing a boundary (wire envelopes, watermarks, ledger
//! rows) must be UTC. Values carrying any other offset, or no offset at all,
//! are rejected rather than silently converted.

use chrono::{DateTime, SecondsFormat, Utc};

/// Errors for timestamp parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    /// Input is not an RFC 3339 timestamp
    #[error("invalid timestamp '{0}'")]
    Invalid(String),
    /// Input carries a non-UTC offset
    #[error("timestamp '{0}' is not UTC")]
    NotUtc(String),
}

/// Parse an RFC 3339 timestamp, requiring a zero UTC offset.
///
/// # Errors
///
/// Returns [`TimeError::NotUtc`] if the offset is not zero and
/// [`TimeError::Invalid`] if the input cannot be parsed.
pub fn parse_utc(input: &str) -> Result<DateTime<Utc>, TimeError> {
    let parsed = DateTime::parse_from_rfc3339(input.trim())
        .map_err(|_| TimeError::Invalid(input.to_string()))?;
    if parsed.offset().local_minus_utc() != 0 {
        return Err(TimeError::NotUtc(input.to_string()));
    }
    Ok(parsed.with_timezone(&Utc))
}

/// Format a UTC timestamp as RFC 3339 with a `Z` suffix.
#[must_use]
pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Serde adapter for `DateTime<Utc>` fields that rejects non-UTC input.
pub mod utc_rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as RFC 3339 with a `Z` suffix.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_utc(ts))
    }

    /// Deserialize an RFC 3339 string with a zero offset.
    ///
    /// # Errors
    ///
    /// Fails on malformed or non-UTC input.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_utc(&raw).map_err(serde::de::Error::custom)
    }
}
