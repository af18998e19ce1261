//! Aggregate kinds known to the materializer.
//!
//! Each kind declares its fields and their static [`FieldKind`]. Field
//! lookup is by case-insensitive name; the declared spelling is what gets
//! written to the record.
//!
//! # Record identification
//!
//! The field holding a record's identifier is resolved in this order:
//!
//! 1. a field named `<AggregateType>Id`
//! 2. a field named `Id`
//! 3. the first identifier-kind field whose name ends in `Id`

use crate::value::FieldKind;
use std::collections::HashMap;

/// Declaration of one record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name as stored on the record
    pub name: String,
    /// Static kind incoming values are converted to
    pub kind: FieldKind,
    /// Deltas may not write this field
    pub read_only: bool,
    /// Field accepts `Null`
    pub nullable: bool,
}

impl FieldSpec {
    /// A writable, non-nullable field.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            read_only: false,
            nullable: false,
        }
    }

    /// Mark the field read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark the field nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A registered aggregate kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSchema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl AggregateSchema {
    /// Start a schema for the aggregate type tag `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field declaration.
    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Aggregate type tag.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Field by case-insensitive name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Field that identifies records of this kind.
    #[must_use]
    pub fn key_field(&self) -> Option<&FieldSpec> {
        let typed = format!("{}Id", self.name);
        self.lookup(&typed)
            .or_else(|| self.lookup("Id"))
            .or_else(|| {
                self.fields.iter().find(|f| {
                    f.kind == FieldKind::Identifier && f.name.to_ascii_lowercase().ends_with("id")
                })
            })
    }
}

/// Extensible table of aggregate kinds, keyed by exact type tag.
#[derive(Debug, Clone, Default)]
pub struct AggregateRegistry {
    kinds: HashMap<String, AggregateSchema>,
}

impl AggregateRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in business aggregates.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(agreement());
        registry.register(agreement_approval());
        registry.register(party());
        registry
    }

    /// Register or replace a kind.
    pub fn register(&mut self, schema: AggregateSchema) {
        tracing::debug!(aggregate_type = schema.name(), "Registering aggregate kind");
        self.kinds.insert(schema.name.clone(), schema);
    }

    /// Schema for a type tag.
    #[must_use]
    pub fn get(&self, aggregate_type: &str) -> Option<&AggregateSchema> {
        self.kinds.get(aggregate_type)
    }

    /// Registered type tags, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn agreement() -> AggregateSchema {
    AggregateSchema::new("Agreement")
        .field(FieldSpec::new("AgreementId", FieldKind::Identifier).read_only())
        .field(FieldSpec::new("PartyId", FieldKind::Identifier))
        .field(FieldSpec::new("Title", FieldKind::Text))
        .field(FieldSpec::new(
            "Status",
            FieldKind::enumeration([
                "Draft", "Pending", "Approved", "Rejected", "Denied", "Expired",
            ]),
        ))
        .field(FieldSpec::new("Amount", FieldKind::Decimal))
        .field(FieldSpec::new("EffectiveOnUtc", FieldKind::Timestamp))
        .field(FieldSpec::new("ExpiresOnUtc", FieldKind::Timestamp).nullable())
        .field(FieldSpec::new("Revision", FieldKind::Integer))
        .field(FieldSpec::new("IsArchived", FieldKind::Bool))
        .field(FieldSpec::new("Notes", FieldKind::Text).nullable())
}

fn agreement_approval() -> AggregateSchema {
    AggregateSchema::new("AgreementApproval")
        .field(FieldSpec::new("AgreementApprovalId", FieldKind::Identifier).read_only())
        .field(FieldSpec::new("AgreementId", FieldKind::Identifier))
        .field(FieldSpec::new("ApproverName", FieldKind::Text))
        .field(FieldSpec::new(
            "Status",
            FieldKind::enumeration(["Pending", "Approved", "Denied"]),
        ))
        .field(FieldSpec::new("DecidedOnUtc", FieldKind::Timestamp).nullable())
        .field(FieldSpec::new("Comment", FieldKind::Text).nullable())
}

fn party() -> AggregateSchema {
    AggregateSchema::new("Party")
        .field(FieldSpec::new("Id", FieldKind::Identifier).read_only())
        .field(FieldSpec::new("DisplayName", FieldKind::Text))
        .field(FieldSpec::new("Email", FieldKind::Text).nullable())
        .field(FieldSpec::new("CreditScore", FieldKind::Float).nullable())
        .field(FieldSpec::new("IsActive", FieldKind::Bool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered() {
        let registry = AggregateRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec!["Agreement", "AgreementApproval", "Party"]
        );
        assert!(registry.get("Invoice").is_none());
    }

    #[test]
    fn key_field_prefers_type_specific_id() {
        let registry = AggregateRegistry::with_defaults();
        let approval = registry.get("AgreementApproval").unwrap();
        assert_eq!(approval.key_field().unwrap().name, "AgreementApprovalId");
    }

    #[test]
    fn key_field_falls_back_to_generic_id() {
        let registry = AggregateRegistry::with_defaults();
        assert_eq!(registry.get("Party").unwrap().key_field().unwrap().name, "Id");
    }

    #[test]
    fn key_field_falls_back_to_any_identifier_ending_in_id() {
        let schema = AggregateSchema::new("Shipment")
            .field(FieldSpec::new("Reference", FieldKind::Text))
            .field(FieldSpec::new("TrackingNumberId", FieldKind::Text))
            .field(FieldSpec::new("ExternalRefId", FieldKind::Identifier));
        assert_eq!(schema.key_field().unwrap().name, "ExternalRefId");

        let keyless = AggregateSchema::new("Note").field(FieldSpec::new("Body", FieldKind::Text));
        assert!(keyless.key_field().is_none());
    }

    #[test]
    fn lookup_ignores_case() {
        let registry = AggregateRegistry::with_defaults();
        let agreement = registry.get("Agreement").unwrap();
        assert_eq!(agreement.lookup("status").unwrap().name, "Status");
        assert!(agreement.lookup("Missing").is_none());
    }

    #[test]
    fn register_extends_the_table() {
        let mut registry = AggregateRegistry::new();
        registry.register(
            AggregateSchema::new("Invoice")
                .field(FieldSpec::new("InvoiceId", FieldKind::Identifier)),
        );
        assert!(registry.get("Invoice").is_some());
    }
}
