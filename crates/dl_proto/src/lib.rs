//! dl_proto — wire types and serialisation for the session engine.
//!
//! All on-wire types are JSON and carry a `version` field so future format
//! changes do not break in-flight sessions.
//!
//! # Modules
//! - `envelope`      — signed ratchet-message envelope (§6 wire format)
//! - `message`       — `CryptoMessage` application payload + control frames
//! - `communication` — `BaseCommunication` conversation descriptor (§3)

pub mod communication;
pub mod envelope;
pub mod message;

pub use communication::{BaseCommunication, CommunicationError, CommunicationKind, OneTimeKeyKind};
pub use envelope::{Envelope, StoredEnvelope};
pub use message::{ControlFrame, CryptoMessage, DeliveryState, MessageType, Recipient};
