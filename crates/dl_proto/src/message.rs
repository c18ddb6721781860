//! `CryptoMessage` — the plaintext application payload carried inside an
//! `Envelope`'s ciphertext, plus the control-frame variants sent in-band
//! over the same ratchet-encrypted channel (§4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::communication::OneTimeKeyKind;

/// Recipient addressing, a tagged union per §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    /// The other devices of the sender's own account.
    PersonalMessage,
    /// A specific contact, fanned out to all of their verified devices.
    Nickname { secret_name: String },
    /// Every member of a channel, minus blocked members.
    Channel { name: String },
    /// Every device the local account can currently reach.
    Broadcast,
}

/// Engine-internal events carried in `CryptoMessage::transport_info`,
/// never persisted and never delivered to the application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Recipient must force-refresh the sender's identity and drop any
    /// cached ratchet state for this sender, then accept the next handshake.
    SessionReestablishment,
    /// Recipient must reconcile local one-time-key state for `kind` against
    /// the transport's authoritative set.
    SynchronizeOneTimeKeys { kind: OneTimeKeyKind },
}

/// Plaintext application payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoMessage {
    pub shared_message_id: Uuid,
    pub text: String,
    /// Opaque application metadata, never interpreted by the engine.
    pub metadata: serde_json::Value,
    pub recipient: Recipient,
    pub sent_date: DateTime<Utc>,
    /// Disappearing-message timer, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destruction_time: Option<u64>,
    /// Present only for control frames; absent for ordinary application
    /// messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_info: Option<ControlFrame>,
}

impl CryptoMessage {
    pub fn is_control_frame(&self) -> bool {
        self.transport_info.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_roundtrips_through_json() {
        let msg = CryptoMessage {
            shared_message_id: Uuid::new_v4(),
            text: String::new(),
            metadata: serde_json::Value::Null,
            recipient: Recipient::Nickname { secret_name: "bob".into() },
            sent_date: Utc::now(),
            destruction_time: None,
            transport_info: Some(ControlFrame::SessionReestablishment),
        };
        assert!(msg.is_control_frame());
        let json = serde_json::to_string(&msg).unwrap();
        let back: CryptoMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transport_info, Some(ControlFrame::SessionReestablishment));
    }
}
