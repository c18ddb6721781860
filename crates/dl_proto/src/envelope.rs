//! Wire format of a ratchet message — what the transport relays.
//!
//! The transport is a DUMB RELAY: it only needs `sender_secret_name`,
//! `sender_device_id`, `shared_message_id` and `sent_at` for routing and
//! retention; everything else is opaque ratchet-encrypted payload. The
//! envelope is detached-signed with the sender's current signing key;
//! verification failure is `CryptoError::InvalidSignature`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dl_crypto::handshake::HandshakeBundle;
use dl_crypto::ratchet::RatchetHeader;

/// On-wire envelope — sent to and received from the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for forward compatibility.
    pub version: u8,

    /// Sender's public handle.
    pub sender_secret_name: String,
    /// Sender's device UUID.
    pub sender_device_id: Uuid,

    /// Cross-device stable ID shared by every fan-out copy of one logical send.
    pub shared_message_id: Uuid,

    /// Timestamp set by sender.
    pub sent_at: DateTime<Utc>,

    /// Double Ratchet header (DH public key + message counters).
    pub ratchet_header: RatchetHeader,

    /// Present only on the first message of a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeBundle>,

    /// AES-256-GCM ciphertext (no nonce — the nonce is derived from the
    /// ratchet header's `n`), base64-encoded. Inner content is serialised
    /// `CryptoMessage` JSON.
    pub ciphertext: String,

    /// Base64 detached Ed25519 signature over the canonical envelope bytes
    /// (every field above, excluding this one), made with the sender's
    /// current signing key.
    pub signature: String,
}

impl Envelope {
    /// Canonical bytes signed/verified over this envelope. Field order is
    /// fixed so both sides compute identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let payload = serde_json::json!({
            "ciphertext": self.ciphertext,
            "handshake": self.handshake,
            "ratchet_header": self.ratchet_header,
            "sender_device_id": self.sender_device_id,
            "sender_secret_name": self.sender_secret_name,
            "sent_at": self.sent_at.to_rfc3339(),
            "shared_message_id": self.shared_message_id,
            "version": self.version,
        });
        serde_json::to_vec(&payload).expect("canonical envelope payload is always serialisable")
    }
}

/// Transport-side metadata added when the envelope is stored for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEnvelope {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub received_at: DateTime<Utc>,
    pub delivered: bool,
}
