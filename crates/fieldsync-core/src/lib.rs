//! # FieldSync Core
//!
//! Offline-first, multi-site replication of business aggregates.
//!
//! This crate provides:
//! - Vector clocks for causal ordering across sites
//! - An append-only change ledger abstraction and an in-memory store
//! - Conflict resolution that accepts causally applicable deltas
//! - Schema-driven materialization of field changes onto records
//! - A triage queue for deltas that need an operator
//! - The capture/apply service tying these together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod clock;
pub mod delta;
pub mod locks;
pub mod materialize;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod time;
pub mod triage;
pub mod value;

pub use capture::{ApplyReport, Cancellation, DeltaCaptureService, SiteIdentity, SyncError};
pub use clock::{ClockComparison, SiteId, VectorClock};
pub use delta::{AggregateKey, Delta, DeltaError, FieldChange, Origin};
pub use locks::KeyLocks;
pub use materialize::AggregateMaterializer;
pub use resolver::{ConflictResolver, DisabledResolver, Resolution, VectorClockResolver};
pub use schema::{AggregateRegistry, AggregateSchema, FieldSpec};
pub use store::{
    AggregateClockState, ChangeLedger, ClockStateStore, LedgerEntry, MemoryStore, Record,
    RecordStore, StoreError,
};
pub use time::{format_utc, parse_utc, TimeError};
pub use triage::{RiskLevel, TriageItem, TriageQueue, TriageSummary};
pub use value::{Decimal, FieldKind, FieldValue};
