//! Database row models — these map to/from SQL rows (§3 data model).
//!
//! Sensitive columns (`*_enc`) are AES-256-GCM ciphertext under the vault
//! key, base64-encoded. Routing/ordering columns are stored in the clear so
//! the store can query and order without the vault unlocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single encrypted `SessionContext` blob for this device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionContextRow {
    pub device_id: String,
    /// Vault-encrypted `SessionContext` JSON.
    pub envelope_enc: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The per-device PBKDF salt. Not secret; persisted alongside, never
/// inside, the encrypted envelope so it is readable before unlock.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceSaltRow {
    pub device_id: String,
    pub salt_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionIdentityRow {
    pub id: String,
    pub secret_name: String,
    pub device_id: String,
    pub session_context_id: String,
    pub device_name: String,
    pub is_master_device: bool,
    /// Base64 X25519 long-term public key.
    pub long_term_curve_pub: String,
    /// Base64 Ed25519 signing public key.
    pub signing_pub: String,
    /// Base64 ML-KEM-1024 public key (final fallback).
    pub mlkem_pub: String,
    /// Base64 one-time X25519 public key last consumed for this identity, if any.
    pub one_time_curve_pub: Option<String>,
    /// Vault-encrypted serialized `RatchetSession`; `None` until first handshake.
    pub ratchet_state_enc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContactRow {
    pub id: String,
    pub owner_secret_name: String,
    pub contact_secret_name: String,
    pub display_name: Option<String>,
    /// Base64 Ed25519 identity public key — MUST NOT change silently.
    pub identity_pubkey: String,
    /// User-confirmed key fingerprint (null until verified).
    pub verified_fingerprint: Option<String>,
    /// A key change was detected and not yet re-verified.
    pub key_change_pending: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommunicationRow {
    pub id: String,
    /// "direct" | "channel"
    pub kind: String,
    /// Vault-encrypted `BaseCommunication` JSON (administrator/operators/
    /// members/blocked_members/name).
    pub metadata_enc: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `EncryptedMessage` — one AES-GCM-sealed envelope, indexed for replay
/// and ordering within its communication.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub communication_id: String,
    pub session_context_id: String,
    /// Cross-device stable ID shared by every fan-out copy of one send.
    pub shared_id: String,
    /// Monotonically increasing within `communication_id`.
    pub sequence_number: i64,
    pub data_enc: String,
    pub created_at: DateTime<Utc>,
}

/// `JobModel` — a queued outbound task, consumed in ascending `sequence_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub communication_id: String,
    pub sequence_id: i64,
    pub props_enc: String,
    pub created_at: DateTime<Utc>,
}

/// A media attachment job, tied to a parent `JobRow`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaJobRow {
    pub id: String,
    pub job_id: String,
    pub media_ref: String,
    pub props_enc: String,
    pub created_at: DateTime<Utc>,
}
