//! `SessionContext` — the encrypted-at-rest root of one device's local
//! state (§3, §4.3): the local `SessionUser`, its published
//! `UserConfiguration`, and whether this device has completed initial
//! registration.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use dl_crypto::identity::{
    generate_device_bundle, DeviceKeys, DeviceKeysSnapshot, SigningKeyPair, UserConfiguration,
};
use dl_crypto::kdf::{generate_salt, vault_key_from_password};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dl_store::models::{DeviceSaltRow, SessionContextRow};
use dl_store::{Store, Vault};

use crate::config::EngineConfig;
use crate::error::SessionError;

const ENVELOPE_AAD: &[u8] = b"dl-session-context-v1";

/// This device's local identity: the account it belongs to plus its own
/// key material. One `SessionUser` per device, one account (`secret_name`)
/// potentially shared by several linked devices.
pub struct SessionUser {
    pub secret_name: String,
    pub device_id: Uuid,
    pub device_name: String,
    pub is_master_device: bool,
    /// The account-level Ed25519 key. Signs every `SignedDeviceConfiguration`
    /// and `SignedOneTimeKey` published under `secret_name`; distinct from
    /// `device_keys.signing`, which is this device's own per-device key.
    pub account_signing: SigningKeyPair,
    pub device_keys: DeviceKeys,
}

/// Whether this device has published its `UserConfiguration` to the
/// transport yet. A freshly created session is `Unregistered` until the
/// caller completes that publish step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

/// The full local state persisted, as one opaque encrypted blob, in
/// `SessionContextRow::envelope_enc`.
pub struct SessionContext {
    pub session_context_id: Uuid,
    pub session_user: SessionUser,
    pub registration_state: RegistrationState,
    pub published_configuration: UserConfiguration,
}

#[derive(Serialize, Deserialize)]
struct SessionContextEnvelope {
    session_context_id: Uuid,
    secret_name: String,
    device_id: Uuid,
    device_name: String,
    is_master_device: bool,
    device_keys: DeviceKeysSnapshot,
    registration_state: RegistrationState,
    published_configuration: UserConfiguration,
    account_signing_secret: String,
}

impl SessionContext {
    fn to_envelope(&self) -> SessionContextEnvelope {
        SessionContextEnvelope {
            session_context_id: self.session_context_id,
            secret_name: self.session_user.secret_name.clone(),
            device_id: self.session_user.device_id,
            device_name: self.session_user.device_name.clone(),
            is_master_device: self.session_user.is_master_device,
            account_signing_secret: URL_SAFE_NO_PAD
                .encode(self.session_user.account_signing.secret_bytes()),
            device_keys: DeviceKeysSnapshot::from_device_keys(&self.session_user.device_keys),
            registration_state: self.registration_state,
            published_configuration: self.published_configuration.clone(),
        }
    }

    fn from_envelope(envelope: SessionContextEnvelope) -> Result<Self, SessionError> {
        let device_keys = envelope.device_keys.to_device_keys()?;
        let account_signing_secret = URL_SAFE_NO_PAD
            .decode(&envelope.account_signing_secret)
            .map_err(|_| SessionError::ConfigurationError("malformed account signing key".into()))?;
        let account_signing = SigningKeyPair::from_bytes(&account_signing_secret)?;
        Ok(Self {
            session_context_id: envelope.session_context_id,
            session_user: SessionUser {
                secret_name: envelope.secret_name,
                device_id: envelope.device_id,
                device_name: envelope.device_name,
                is_master_device: envelope.is_master_device,
                account_signing,
                device_keys,
            },
            registration_state: envelope.registration_state,
            published_configuration: envelope.published_configuration,
        })
    }

    /// Create a brand-new local session for `secret_name` on this device.
    /// Generates a fresh account signing key plus a full device key
    /// bundle, derives the vault key from `app_password`, and persists
    /// the encrypted envelope and its salt row. The returned context is
    /// `RegistrationState::Unregistered` until the caller publishes
    /// `published_configuration` to the transport.
    pub async fn create_session<S: Store>(
        store: &S,
        vault: &Vault,
        secret_name: &str,
        device_name: &str,
        app_password: &[u8],
        config: &EngineConfig,
    ) -> Result<Self, SessionError> {
        let device_id = Uuid::new_v4();
        let account_signing = SigningKeyPair::generate();
        let (device_keys, published_configuration) = generate_device_bundle(
            device_id,
            device_name,
            true,
            &account_signing,
            config.one_time_key_batch_size,
            config.key_rotation_interval_days,
        );

        let context = Self {
            session_context_id: Uuid::new_v4(),
            session_user: SessionUser {
                secret_name: secret_name.to_string(),
                device_id,
                device_name: device_name.to_string(),
                is_master_device: true,
                account_signing,
                device_keys,
            },
            registration_state: RegistrationState::Unregistered,
            published_configuration,
        };

        let salt = generate_salt();
        let vault_key = vault_key_from_password(app_password, &salt)?;
        vault.unlock_with_key(vault_key.0).await?;

        let envelope_enc = context.encrypt_envelope(vault).await?;

        let now = Utc::now();
        store
            .put_device_salt(&DeviceSaltRow {
                device_id: device_id.to_string(),
                salt_hex: hex::encode(salt),
            })
            .await?;
        store
            .put_session_context(&SessionContextRow {
                device_id: device_id.to_string(),
                envelope_enc,
                created_at: now,
                updated_at: now,
            })
            .await?;

        Ok(context)
    }

    /// Unlock and load the existing session for `device_id`, given the
    /// device's stored salt and the user's app password.
    pub async fn start_session<S: Store>(
        store: &S,
        vault: &Vault,
        device_id: Uuid,
        app_password: &[u8],
    ) -> Result<Self, SessionError> {
        let salt_row = store
            .get_device_salt(&device_id.to_string())
            .await?
            .ok_or_else(|| SessionError::UserNotFound(device_id.to_string()))?;
        let salt = decode_salt(&salt_row.salt_hex)?;

        let vault_key = vault_key_from_password(app_password, &salt)?;
        vault.unlock_with_key(vault_key.0).await?;

        let row = store
            .get_session_context(&device_id.to_string())
            .await?
            .ok_or(SessionError::NotInitialized)?;

        Self::decrypt_envelope(vault, &row.envelope_enc).await
    }

    /// Re-encrypt the session under a new app password, rotating the
    /// vault salt. The caller must already hold an unlocked `vault`
    /// (i.e. have called `start_session` or `create_session` first).
    pub async fn change_app_password<S: Store>(
        &self,
        store: &S,
        vault: &Vault,
        new_app_password: &[u8],
    ) -> Result<(), SessionError> {
        let new_salt = generate_salt();
        let new_key = vault_key_from_password(new_app_password, &new_salt)?;
        vault.unlock_with_key(new_key.0).await?;

        let envelope_enc = self.encrypt_envelope(vault).await?;

        store
            .put_device_salt(&DeviceSaltRow {
                device_id: self.session_user.device_id.to_string(),
                salt_hex: hex::encode(new_salt),
            })
            .await?;

        let now = Utc::now();
        store
            .put_session_context(&SessionContextRow {
                device_id: self.session_user.device_id.to_string(),
                envelope_enc,
                created_at: now,
                updated_at: now,
            })
            .await?;
        Ok(())
    }

    /// Check a candidate password against the stored envelope without
    /// mutating vault state or storage. Leaves the vault locked again
    /// afterward regardless of the outcome.
    pub async fn verify_app_password<S: Store>(
        store: &S,
        candidate_password: &[u8],
        device_id: Uuid,
    ) -> Result<bool, SessionError> {
        let salt_row = store
            .get_device_salt(&device_id.to_string())
            .await?
            .ok_or_else(|| SessionError::UserNotFound(device_id.to_string()))?;
        let salt = decode_salt(&salt_row.salt_hex)?;

        let row = store
            .get_session_context(&device_id.to_string())
            .await?
            .ok_or(SessionError::NotInitialized)?;

        let vault_key = vault_key_from_password(candidate_password, &salt)?;
        let probe = Vault::new();
        probe.unlock_with_key(vault_key.0).await?;
        let result = Self::decrypt_envelope(&probe, &row.envelope_enc).await;
        probe.lock().await;

        Ok(result.is_ok())
    }

    async fn encrypt_envelope(&self, vault: &Vault) -> Result<String, SessionError> {
        let envelope = self.to_envelope();
        let plaintext = serde_json::to_vec(&envelope)?;
        let ciphertext = vault
            .with_key(|key| {
                dl_crypto::aead::encrypt(key, &plaintext, ENVELOPE_AAD)
                    .map_err(dl_store::StoreError::Crypto)
            })
            .await?;
        Ok(URL_SAFE_NO_PAD.encode(ciphertext))
    }

    async fn decrypt_envelope(vault: &Vault, envelope_enc: &str) -> Result<Self, SessionError> {
        let ciphertext = URL_SAFE_NO_PAD
            .decode(envelope_enc)
            .map_err(|_| SessionError::ConfigurationError("malformed session envelope".into()))?;
        let plaintext = vault
            .with_key(|key| {
                dl_crypto::aead::decrypt(key, &ciphertext, ENVELOPE_AAD)
                    .map(|pt| pt.to_vec())
                    .map_err(dl_store::StoreError::Crypto)
            })
            .await?;
        let envelope: SessionContextEnvelope = serde_json::from_slice(&plaintext)?;
        Self::from_envelope(envelope)
    }
}

fn decode_salt(salt_hex: &str) -> Result<[u8; 16], SessionError> {
    let bytes = hex::decode(salt_hex)
        .map_err(|_| SessionError::ConfigurationError("malformed device salt".into()))?;
    bytes
        .try_into()
        .map_err(|_| SessionError::ConfigurationError("device salt is not 16 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::InMemoryStore;

    #[tokio::test]
    async fn create_then_start_session_round_trips() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        let config = EngineConfig::default();

        let created = SessionContext::create_session(
            &store,
            &vault,
            "alice",
            "laptop",
            b"correct horse battery staple",
            &config,
        )
        .await
        .unwrap();
        let device_id = created.session_user.device_id;
        vault.lock().await;

        let loaded = SessionContext::start_session(
            &store,
            &vault,
            device_id,
            b"correct horse battery staple",
        )
        .await
        .unwrap();

        assert_eq!(loaded.session_user.secret_name, "alice");
        assert_eq!(loaded.session_user.device_id, device_id);
        assert_eq!(loaded.registration_state, RegistrationState::Unregistered);
        assert!(loaded.published_configuration.verify_all().is_ok());
    }

    #[tokio::test]
    async fn start_session_with_wrong_password_fails() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        let config = EngineConfig::default();

        let created = SessionContext::create_session(
            &store,
            &vault,
            "bob",
            "phone",
            b"correct horse battery staple",
            &config,
        )
        .await
        .unwrap();
        let device_id = created.session_user.device_id;
        vault.lock().await;

        let result =
            SessionContext::start_session(&store, &vault, device_id, b"wrong password").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn verify_app_password_does_not_mutate_stored_envelope() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        let config = EngineConfig::default();

        let created = SessionContext::create_session(
            &store,
            &vault,
            "carol",
            "tablet",
            b"hunter2",
            &config,
        )
        .await
        .unwrap();
        let device_id = created.session_user.device_id;

        assert!(SessionContext::verify_app_password(&store, b"hunter2", device_id)
            .await
            .unwrap());
        assert!(!SessionContext::verify_app_password(&store, b"wrong", device_id)
            .await
            .unwrap());

        // Still loadable with the real password afterward.
        vault.lock().await;
        let loaded = SessionContext::start_session(&store, &vault, device_id, b"hunter2").await;
        assert!(loaded.is_ok());
    }

    #[tokio::test]
    async fn change_app_password_rotates_salt_and_envelope() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        let config = EngineConfig::default();

        let created = SessionContext::create_session(
            &store,
            &vault,
            "dave",
            "desktop",
            b"old-password",
            &config,
        )
        .await
        .unwrap();
        let device_id = created.session_user.device_id;

        created
            .change_app_password(&store, &vault, b"new-password")
            .await
            .unwrap();
        vault.lock().await;

        assert!(SessionContext::start_session(&store, &vault, device_id, b"old-password")
            .await
            .is_err());
        vault.lock().await;
        assert!(SessionContext::start_session(&store, &vault, device_id, b"new-password")
            .await
            .is_ok());
    }
}
