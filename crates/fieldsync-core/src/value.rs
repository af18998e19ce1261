//! Loosely typed field values and their conversion into field kinds.
//!
//! Values arrive from the wire as plain scalars (strings, numbers, booleans,
//! null) and stay opaque until materialization, where [`FieldValue::convert`]
//! turns them into the static kind declared by the target field.
//!
//! # Conversion rules
//!
//! | Target kind | Accepted sources |
//! |-------------|------------------|
//! | Identifier | identifier, UUID string |
//! | Timestamp | timestamp, RFC 3339 / ISO-8601 string (normalized to UTC) |
//! | Integer | integer, integral decimal/float, numeric string |
//! | Decimal | decimal, integer, float, numeric string |
//! | Float | float, integer, decimal, numeric string |
//! | Bool | bool, `"true"`/`"false"` (any case) |
//! | Enumeration | string matching a variant name (any case) |
//! | Text | any non-null scalar, rendered as text |
//!
//! `Null` converts to `Null` for every kind; whether the field accepts it is
//! decided by the field's nullability.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::time::format_utc;

/// Largest supported number of fractional digits.
pub const MAX_DECIMAL_SCALE: u32 = 28;

/// A fixed-point decimal number: `units / 10^scale`.
///
/// Always normalized so that `scale` carries no trailing zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    units: i128,
    scale: u32,
}

impl Decimal {
    /// Build a decimal from raw units and scale.
    ///
    /// # Errors
    ///
    /// Returns error if `scale` exceeds [`MAX_DECIMAL_SCALE`].
    pub fn new(units: i128, scale: u32) -> Result<Self, DecimalError> {
        if scale > MAX_DECIMAL_SCALE {
            return Err(DecimalError::ScaleTooLarge(scale));
        }
        Ok(Self::normalized(units, scale))
    }

    fn normalized(mut units: i128, mut scale: u32) -> Self {
        while scale > 0 && units % 10 == 0 {
            units /= 10;
            scale -= 1;
        }
        Self { units, scale }
    }

    /// Raw units.
    #[must_use]
    pub fn units(&self) -> i128 {
        self.units
    }

    /// Number of fractional digits.
    #[must_use]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// The value as an integer, if it has no fractional part and fits.
    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        if self.scale == 0 {
            i64::try_from(self.units).ok()
        } else {
            None
        }
    }

    /// Nearest floating-point value.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// Convert a finite float through its shortest decimal rendering.
    #[must_use]
    pub fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() {
            format!("{value}").parse().ok()
        } else {
            None
        }
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        Self {
            units: i128::from(value),
            scale: 0,
        }
    }
}

impl FromStr for Decimal {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, body) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let (whole, fraction) = body.split_once('.').unwrap_or((body, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(DecimalError::Invalid(s.to_string()));
        }
        if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(DecimalError::Invalid(s.to_string()));
        }

        let scale =
            u32::try_from(fraction.len()).map_err(|_| DecimalError::Invalid(s.to_string()))?;
        if scale > MAX_DECIMAL_SCALE {
            return Err(DecimalError::ScaleTooLarge(scale));
        }

        let mut units: i128 = 0;
        for digit in whole.bytes().chain(fraction.bytes()) {
            units = units
                .checked_mul(10)
                .and_then(|u| u.checked_add(i128::from(digit - b'0')))
                .ok_or_else(|| DecimalError::Overflow(s.to_string()))?;
        }
        if negative {
            units = -units;
        }

        Ok(Self::normalized(units, scale))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.units);
        }
        let digits = self.units.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let sign = if self.units < 0 { "-" } else { "" };
        if digits.len() > scale {
            let (whole, fraction) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{whole}.{fraction}")
        } else {
            write!(f, "{sign}0.{digits:0>scale$}")
        }
    }
}

/// Errors for decimal parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecimalError {
    /// Not a decimal literal
    #[error("invalid decimal '{0}'")]
    Invalid(String),
    /// Too many digits
    #[error("decimal '{0}' overflows")]
    Overflow(String),
    /// Too many fractional digits
    #[error("decimal scale {0} exceeds maximum")]
    ScaleTooLarge(u32),
}

/// A loosely typed scalar carried by a field change.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent value
    Null,
    /// Free text
    String(String),
    /// Signed integer
    Integer(i64),
    /// Fixed-point decimal
    Decimal(Decimal),
    /// Floating-point number
    Float(f64),
    /// Boolean
    Bool(bool),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
    /// Unique identifier
    Identifier(Uuid),
}

impl FieldValue {
    /// Whether the value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short tag naming the variant, used in logs.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Timestamp(_) => "timestamp",
            Self::Identifier(_) => "identifier",
        }
    }

    /// Text rendering of the scalar, `None` for `Null`.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Timestamp(ts) => Some(format_utc(ts)),
            Self::Identifier(id) => Some(id.to_string()),
        }
    }

    /// Convert into the given field kind.
    ///
    /// Returns `None` when the value cannot represent that kind; the caller
    /// skips the field in that case.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn convert(&self, kind: &FieldKind) -> Option<FieldValue> {
        if self.is_null() {
            return Some(Self::Null);
        }
        match kind {
            FieldKind::Text => self.as_text().map(Self::String),
            FieldKind::Identifier => match self {
                Self::Identifier(id) => Some(Self::Identifier(*id)),
                Self::String(s) => Uuid::parse_str(s.trim()).ok().map(Self::Identifier),
                _ => None,
            },
            FieldKind::Timestamp => match self {
                Self::Timestamp(ts) => Some(Self::Timestamp(*ts)),
                Self::String(s) => parse_loose_timestamp(s).map(Self::Timestamp),
                _ => None,
            },
            FieldKind::Integer => match self {
                Self::Integer(i) => Some(Self::Integer(*i)),
                Self::Decimal(d) => d.to_i64().map(Self::Integer),
                Self::Float(f) => float_to_i64(*f).map(Self::Integer),
                Self::String(s) => s.trim().parse().ok().map(Self::Integer),
                _ => None,
            },
            FieldKind::Decimal => match self {
                Self::Decimal(d) => Some(Self::Decimal(*d)),
                Self::Integer(i) => Some(Self::Decimal(Decimal::from(*i))),
                Self::Float(f) => Decimal::from_f64(*f).map(Self::Decimal),
                Self::String(s) => s.parse().ok().map(Self::Decimal),
                _ => None,
            },
            FieldKind::Float => match self {
                Self::Float(f) => Some(Self::Float(*f)),
                Self::Integer(i) => Some(Self::Float(*i as f64)),
                Self::Decimal(d) => Some(Self::Float(d.to_f64())),
                Self::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Self::Float),
                _ => None,
            },
            FieldKind::Bool => match self {
                Self::Bool(b) => Some(Self::Bool(*b)),
                Self::String(s) => parse_bool(s).map(Self::Bool),
                _ => None,
            },
            FieldKind::Enumeration(variants) => match self {
                Self::String(s) => variants
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(s.trim()))
                    .map(|v| Self::String(v.clone())),
                _ => None,
            },
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Identifier(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// Decimals travel as strings so no precision is lost in JSON numbers.
impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::String(s) => serializer.serialize_str(s),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Decimal(d) => serializer.serialize_str(&d.to_string()),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Timestamp(ts) => serializer.serialize_str(&format_utc(ts)),
            Self::Identifier(id) => serializer.serialize_str(&id.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = FieldValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar value (string, number, boolean or null)")
    }

    fn visit_unit<E: de::Error>(self) -> Result<FieldValue, E> {
        Ok(FieldValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<FieldValue, E> {
        Ok(FieldValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<FieldValue, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<FieldValue, E> {
        Ok(FieldValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<FieldValue, E> {
        Ok(FieldValue::Integer(v))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<FieldValue, E> {
        Ok(i64::try_from(v).map_or(FieldValue::Float(v as f64), FieldValue::Integer))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<FieldValue, E> {
        Ok(FieldValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<FieldValue, E> {
        Ok(FieldValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<FieldValue, E> {
        Ok(FieldValue::String(v))
    }
}

/// Static kind of a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text
    Text,
    /// UUID
    Identifier,
    /// UTC timestamp
    Timestamp,
    /// 64-bit signed integer
    Integer,
    /// Fixed-point decimal
    Decimal,
    /// Floating point
    Float,
    /// Boolean
    Bool,
    /// One of a closed set of names
    Enumeration(Vec<String>),
}

impl FieldKind {
    /// Enumeration kind from variant names.
    #[must_use]
    pub fn enumeration<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enumeration(variants.into_iter().map(Into::into).collect())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_i64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Offsets are normalized to UTC; values without an offset are taken as UTC.
fn parse_loose_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
