//! Error kinds for the session orchestration core (§7).
//!
//! Every variant is actionable: the doc comment on each names its recovery
//! path. None carry secret material.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session context has not been created or started")]
    NotInitialized,
    #[error("database has not been opened")]
    DatabaseNotInitialized,
    #[error("transport has not been configured")]
    TransportNotInitialized,
    #[error("no such user: {0}")]
    UserNotFound(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("unknown one-time key id {0}; triggering synchronization")]
    InvalidKeyId(Uuid),
    #[error("job queue for communication {0} saw a duplicate sequence id {1}")]
    DuplicateSequenceId(Uuid, u64),
    #[error("send cancelled before transport acknowledgement")]
    Cancelled,
    #[error("engine is shutting down")]
    Shutdown,
    #[error("operation failed after one automatic retry: {0}")]
    Unrecoverable(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Crypto(#[from] dl_crypto::CryptoError),
    #[error(transparent)]
    Ratchet(#[from] dl_crypto::error::RatchetError),
    #[error(transparent)]
    Store(#[from] dl_store::StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("duplicate identity for (secretName={secret_name}, deviceId={device_id})")]
    DuplicateIdentity { secret_name: String, device_id: Uuid },
    #[error("no cached identity with id {0}")]
    UnknownIdentity(Uuid),
    #[error("no cached communication with id {0}")]
    UnknownCommunication(Uuid),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport operation failed: {0}")]
    Failed(String),
    #[error("remote user configuration did not verify: {0}")]
    InvalidConfiguration(String),
}
