//! `SessionIdentity` — a per-remote-device cryptographic session (§3).

use chrono::{DateTime, Utc};
use dl_crypto::identity::PublicKeyBytes;
use dl_crypto::ratchet::RatchetSession;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A per-remote-device cryptographic session.
///
/// Invariants: at most one identity per `(secret_name, device_id)` pair;
/// `ratchet` is `None` until the first successful handshake.
pub struct SessionIdentity {
    pub id: Uuid,
    pub secret_name: String,
    pub device_id: Uuid,
    pub session_context_id: Uuid,
    pub device_name: String,
    pub is_master_device: bool,

    pub remote_long_term_curve: PublicKeyBytes,
    pub remote_signing: PublicKeyBytes,
    pub remote_mlkem: PublicKeyBytes,
    pub remote_one_time_curve: Option<PublicKeyBytes>,

    pub ratchet: Option<RatchetSession>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionIdentity {
    pub fn new_unestablished(
        secret_name: String,
        device_id: Uuid,
        session_context_id: Uuid,
        device_name: String,
        is_master_device: bool,
        remote_long_term_curve: PublicKeyBytes,
        remote_signing: PublicKeyBytes,
        remote_mlkem: PublicKeyBytes,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            secret_name,
            device_id,
            session_context_id,
            device_name,
            is_master_device,
            remote_long_term_curve,
            remote_signing,
            remote_mlkem,
            remote_one_time_curve: None,
            ratchet: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_established(&self) -> bool {
        self.ratchet.is_some()
    }
}

/// Serialized form persisted via `dl_store::models::SessionIdentityRow`.
/// The ratchet itself serializes through `dl_crypto::ratchet::RatchetSession`'s
/// own `Serialize`/`Deserialize` impl; this wrapper carries just the public
/// remote-key material alongside it for the vault-encrypted row payload.
#[derive(Serialize, Deserialize)]
pub struct SessionIdentitySnapshot {
    pub remote_long_term_curve: String,
    pub remote_signing: String,
    pub remote_mlkem: String,
    pub remote_one_time_curve: Option<String>,
}

impl SessionIdentitySnapshot {
    pub fn from_identity(identity: &SessionIdentity) -> Self {
        Self {
            remote_long_term_curve: identity.remote_long_term_curve.to_b64(),
            remote_signing: identity.remote_signing.to_b64(),
            remote_mlkem: identity.remote_mlkem.to_b64(),
            remote_one_time_curve: identity.remote_one_time_curve.as_ref().map(|k| k.to_b64()),
        }
    }
}
