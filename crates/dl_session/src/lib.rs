//! dl_session — the orchestration core of the post-quantum E2EE session
//! engine: identity/session persistence, the PQXDH handshake, the Double
//! Ratchet per-peer state machine, task scheduling, and key rotation,
//! tying together `dl_crypto`, `dl_proto`, and `dl_store`.

pub mod cache;
pub mod config;
pub mod control_frames;
pub mod engine;
pub mod error;
pub mod event_receiver;
pub mod fanout;
pub mod handshake;
pub mod identity;
pub mod identity_registry;
pub mod key_rotation;
pub mod session_context;
pub mod task_processor;
pub mod transport;

#[cfg(test)]
pub mod testutil;

pub use config::EngineConfig;
pub use engine::SessionEngine;
pub use error::{CacheError, SessionError, TransportError};
pub use identity::{SessionIdentity, SessionIdentitySnapshot};
pub use session_context::{RegistrationState, SessionContext, SessionUser};
