//! # FieldSync Protocol
//!
//! Wire envelope and transport adapter for exchanging deltas between sites.
//!
//! ## Envelope
//!
//! One [`TransportEnvelope`] bundles the sender's identity, a creation
//! timestamp and an ordered list of deltas. JSON with camelCase keys is the
//! normative encoding; CBOR carries the same structure for constrained links.
//!
//! ## Transport
//!
//! [`TransportAdapter`] exports captured deltas as an encoded envelope and
//! imports envelopes received out-of-band. Moving the bytes between sites is
//! the host's job.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod transport;

pub use envelope::{EnvelopeError, TransportEnvelope, WireFormat};
pub use transport::{TransportAdapter, TransportError, TransportResult};
