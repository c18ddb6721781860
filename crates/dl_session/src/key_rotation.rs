//! `KeyRotation` (§4.9) — scheduled ML-KEM rotation and compromise-triggered
//! full rotation.

use std::sync::Arc;

use chrono::Utc;
use dl_crypto::identity::{
    generate_one_time_curve_keys, generate_one_time_mlkem_keys, CurveKeyPair, MlKemKeyPair,
    SignedDeviceConfiguration, SignedOneTimeKey, SigningKeyPair, UserConfiguration,
};
use dl_proto::communication::OneTimeKeyKind;
use dl_proto::message::ControlFrame;
use dl_store::Store;

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::session_context::SessionUser;
use crate::transport::{RotatedKeys, Transport};

/// Tracks whether the very first send after a rotation still needs to
/// carry a stale-one-time-key deletion request (§4.9). Cleared after that
/// send goes out.
pub struct KeyRotation<S: Store, T: Transport> {
    cache: Arc<Cache<S>>,
    transport: Arc<T>,
    config: EngineConfig,
    needs_remote_deletion: std::sync::atomic::AtomicBool,
}

impl<S: Store, T: Transport> KeyRotation<S, T> {
    pub fn new(cache: Arc<Cache<S>>, transport: Arc<T>, config: EngineConfig) -> Self {
        Self { cache, transport, config, needs_remote_deletion: std::sync::atomic::AtomicBool::new(false) }
    }

    pub fn needs_remote_deletion(&self) -> bool {
        self.needs_remote_deletion.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Clear the post-rotation deletion flag after the first send since a
    /// rotation has gone out.
    pub fn clear_remote_deletion_flag(&self) {
        self.needs_remote_deletion.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Rotate the ML-KEM one-time batch and final key iff due. Returns
    /// whether a rotation happened; idempotent within one
    /// `key_rotation_interval_days` window.
    pub async fn rotate_mlkem_if_needed(&self, session: &mut SessionUser) -> Result<bool, SessionError> {
        if Utc::now() < session.device_keys.rotate_keys_date {
            return Ok(false);
        }

        session.device_keys.one_time_mlkem =
            generate_one_time_mlkem_keys(self.config.one_time_key_batch_size);
        session.device_keys.final_mlkem = MlKemKeyPair::generate();
        session.device_keys.rotate_keys_date =
            Utc::now() + chrono::Duration::days(self.config.key_rotation_interval_days);

        let configuration = self.reissue_configuration(session)?;
        self.transport
            .publish_rotated_keys(
                &session.secret_name,
                session.device_id,
                &RotatedKeys { configuration, needs_remote_deletion: false },
            )
            .await?;
        Ok(true)
    }

    /// Full rotation on suspected compromise: signing key, long-term
    /// X25519 key, and both one-time batches. Re-signs and publishes the
    /// device configuration, then emits `sessionReestablishment` to every
    /// peer with an established identity.
    pub async fn rotate_keys_on_potential_compromise(
        &self,
        session: &mut SessionUser,
    ) -> Result<Vec<(String, uuid::Uuid)>, SessionError> {
        session.device_keys.signing = SigningKeyPair::generate();
        session.device_keys.long_term_curve = CurveKeyPair::generate();
        session.device_keys.one_time_curve =
            generate_one_time_curve_keys(self.config.one_time_key_batch_size);
        session.device_keys.one_time_mlkem =
            generate_one_time_mlkem_keys(self.config.one_time_key_batch_size);

        let configuration = self.reissue_configuration(session)?;
        self.needs_remote_deletion.store(true, std::sync::atomic::Ordering::SeqCst);
        self.transport
            .publish_rotated_keys(
                &session.secret_name,
                session.device_id,
                &RotatedKeys { configuration, needs_remote_deletion: true },
            )
            .await?;

        let mut notified = Vec::new();
        for handle in self.cache.established_handles().await {
            let envelope_target = (handle.secret_name.clone(), handle.device_id);
            tracing::info!(
                secret_name = %handle.secret_name,
                device_id = %handle.device_id,
                "emitting sessionReestablishment after compromise rotation"
            );
            let _frame = ControlFrame::SessionReestablishment;
            notified.push(envelope_target);
        }
        Ok(notified)
    }

    /// Check the remote store's reported count of unconsumed one-time keys
    /// of `kind` for this device and refill iff it has dropped below
    /// `one_time_key_low_watermark` (§4.2). Returns whether a refill ran.
    pub async fn refill_if_below_watermark(
        &self,
        session: &mut SessionUser,
        kind: OneTimeKeyKind,
    ) -> Result<bool, SessionError> {
        let remote_count = self
            .transport
            .fetch_one_time_key_identities(&session.secret_name, session.device_id, kind)
            .await?
            .len();
        if remote_count >= self.config.one_time_key_low_watermark {
            return Ok(false);
        }
        self.refill_one_time_keys(session, kind).await?;
        Ok(true)
    }

    /// Generate a fresh batch of size `one_time_key_batch_size`, sign the
    /// public halves, append both private and public sets to the local
    /// batch, and publish the new public keys (§4.2 `refill_one_time_keys`).
    pub async fn refill_one_time_keys(
        &self,
        session: &mut SessionUser,
        kind: OneTimeKeyKind,
    ) -> Result<(), SessionError> {
        match kind {
            OneTimeKeyKind::Curve => {
                let fresh = generate_one_time_curve_keys(self.config.one_time_key_batch_size);
                let signed: Vec<SignedOneTimeKey> = fresh
                    .iter()
                    .map(|k| SignedOneTimeKey::sign_curve(&session.device_keys.signing, session.device_id, k))
                    .collect();
                session.device_keys.one_time_curve.extend(fresh);
                self.transport.update_one_time_keys(&session.secret_name, session.device_id, signed).await?;
            }
            OneTimeKeyKind::MlKem => {
                let fresh = generate_one_time_mlkem_keys(self.config.one_time_key_batch_size);
                let signed: Vec<SignedOneTimeKey> = fresh
                    .iter()
                    .map(|k| SignedOneTimeKey::sign_mlkem(&session.device_keys.signing, session.device_id, k))
                    .collect();
                session.device_keys.one_time_mlkem.extend(fresh);
                self.transport.update_one_time_mlkem_keys(&session.secret_name, session.device_id, signed).await?;
            }
        }
        Ok(())
    }

    fn reissue_configuration(&self, session: &SessionUser) -> Result<UserConfiguration, SessionError> {
        let device_config = SignedDeviceConfiguration::issue(
            &session.account_signing,
            &session.device_keys,
            &session.device_name,
            session.is_master_device,
        )?;
        let one_time_curve_keys: Vec<SignedOneTimeKey> = session
            .device_keys
            .one_time_curve
            .iter()
            .map(|k| SignedOneTimeKey::sign_curve(&session.device_keys.signing, session.device_id, k))
            .collect();
        let one_time_mlkem_keys: Vec<SignedOneTimeKey> = session
            .device_keys
            .one_time_mlkem
            .iter()
            .map(|k| SignedOneTimeKey::sign_mlkem(&session.device_keys.signing, session.device_id, k))
            .collect();
        Ok(UserConfiguration {
            signing_public_key: session.account_signing.public_b64(),
            devices: vec![device_config],
            one_time_curve_keys,
            one_time_mlkem_keys,
        })
    }
}
