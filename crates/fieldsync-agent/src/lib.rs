//! # FieldSync Agent
//!
//! Hosting process for one FieldSync site.
//!
//! ## Architecture
//!
//! The agent owns three pieces:
//! 1. **Persistence**: a `SQLite` database implementing the ledger, clock
//!    index and record stores
//! 2. **Exchange**: an inbox directory scanned for incoming envelopes and an
//!    outbox directory receiving exported ones
//! 3. **Runtime**: a periodic sync pass (import, then export) that stops
//!    cleanly on Ctrl+C
//!
//! Moving files between one site's outbox and another's inbox is left to
//! whatever link the sites share.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod persistence;
pub mod runtime;

pub use config::{AgentConfig, StoreKind};
pub use persistence::SqliteStore;
pub use runtime::{Agent, ImportSummary};
