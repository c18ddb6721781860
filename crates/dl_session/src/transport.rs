//! `Transport` — the network collaborator (§6). The core never talks to a
//! wire directly; every remote operation goes through this trait so tests
//! can substitute an in-memory double (`testutil`).
//!
//! Trust-on-first-use: a fetched `UserConfiguration` is not trusted until
//! `IdentityRegistry::refresh` verifies its signature chain.

use dl_crypto::identity::{SignedOneTimeKey, UserConfiguration};
use dl_proto::communication::OneTimeKeyKind;
use dl_proto::envelope::Envelope;
use uuid::Uuid;

use crate::error::TransportError;

/// One freshly-fetched one-time key of each kind available for a device,
/// as returned by `fetch_one_time_keys`. Either may be absent if the
/// remote device's batch is exhausted, in which case the handshake falls
/// back to the final ML-KEM key.
#[derive(Debug, Clone, Default)]
pub struct OneTimeKeys {
    pub curve: Option<SignedOneTimeKey>,
    pub mlkem: Option<SignedOneTimeKey>,
}

/// Freshly generated keys published after a rotation (§4.9), shaped
/// identically whether the rotation was scheduled or compromise-triggered.
#[derive(Debug, Clone)]
pub struct RotatedKeys {
    pub configuration: UserConfiguration,
    pub needs_remote_deletion: bool,
}

pub trait Transport: Send + Sync {
    async fn send_message(&self, envelope: &Envelope, metadata: serde_json::Value) -> Result<(), TransportError>;

    async fn fetch_user_configuration(&self, secret_name: &str) -> Result<UserConfiguration, TransportError>;

    async fn fetch_one_time_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
    ) -> Result<OneTimeKeys, TransportError>;

    async fn fetch_one_time_key_identities(
        &self,
        secret_name: &str,
        device_id: Uuid,
        kind: OneTimeKeyKind,
    ) -> Result<Vec<Uuid>, TransportError>;

    async fn publish_user_configuration(
        &self,
        config: &UserConfiguration,
        recipient_device_id: Uuid,
    ) -> Result<(), TransportError>;

    async fn publish_rotated_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        rotated: &RotatedKeys,
    ) -> Result<(), TransportError>;

    async fn update_one_time_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        keys: Vec<SignedOneTimeKey>,
    ) -> Result<(), TransportError>;

    async fn update_one_time_mlkem_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        keys: Vec<SignedOneTimeKey>,
    ) -> Result<(), TransportError>;

    async fn batch_delete_one_time_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        kind: OneTimeKeyKind,
        ids: Vec<Uuid>,
    ) -> Result<(), TransportError>;
}
