//! `SessionEngine` (§9) — the explicit, per-process handle tying together
//! every collaborator: no global singleton, no ambient state. Construct
//! one per unlocked device session and hand it to the application layer.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use dl_crypto::handshake::HandshakeBundle;
use dl_crypto::identity::UserConfiguration;
use tokio::sync::Mutex;
use uuid::Uuid;

use dl_proto::communication::BaseCommunication;
use dl_proto::envelope::Envelope;
use dl_proto::message::{ControlFrame, CryptoMessage, Recipient};
use dl_store::models::MessageRow;
use dl_store::{Store, Vault};

use crate::cache::{Cache, IdentityHandle};
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::event_receiver::{notify, EventReceiver};
use crate::fanout::{FanOut, FanOutTarget};
use crate::handshake;
use crate::identity_registry::IdentityRegistry;
use crate::key_rotation::KeyRotation;
use crate::session_context::{RegistrationState, SessionContext, SessionUser};
use crate::task_processor::{Job, JobHandler, TaskProcessor};
use crate::transport::Transport;

const MESSAGE_AAD: &[u8] = b"dl-session-message-v1";

/// Everything `EngineJobHandler::process`/`recover` need, shared by
/// reference with the rest of `SessionEngine` so both halves see the same
/// live `SessionUser` and cache.
struct EngineJobHandler<S: Store, T: Transport> {
    user: Arc<Mutex<SessionUser>>,
    cache: Arc<Cache<S>>,
    registry: Arc<IdentityRegistry<S, T>>,
    transport: Arc<T>,
    config: EngineConfig,
    pending_handshakes: Mutex<HashMap<Uuid, HandshakeBundle>>,
}

/// What `TaskProcessor` hands to `process`/`recover`: the logical message
/// plus which cached identity it targets.
#[derive(serde::Serialize, serde::Deserialize)]
struct JobPayload {
    message: CryptoMessage,
}

impl<S: Store, T: Transport> EngineJobHandler<S, T> {
    async fn fresh_handshake(&self, handle: &IdentityHandle) -> Result<HandshakeBundle, SessionError> {
        let remote_config = self.registry_fetch_verified(&handle.secret_name).await?;
        let user = self.user.lock().await;
        let (ratchet, bundle) = handshake::initiate_towards(
            &user,
            handle.device_id,
            &remote_config,
            &handle.remote_long_term_curve,
            &handle.remote_signing,
            &handle.remote_mlkem,
            self.config.ratchet_associated_data.clone(),
            self.config.max_skipped_message_keys,
        )?;
        drop(user);
        self.cache.establish(handle.id, ratchet).await?;
        Ok(bundle)
    }

    async fn registry_fetch_verified(&self, secret_name: &str) -> Result<UserConfiguration, SessionError> {
        let config = self
            .transport
            .fetch_user_configuration(secret_name)
            .await
            .map_err(SessionError::from)?;
        config.verify_all()?;
        Ok(config)
    }

    async fn sign_and_build_envelope(
        &self,
        ratchet_header: dl_crypto::ratchet::RatchetHeader,
        ciphertext: Vec<u8>,
        shared_message_id: Uuid,
        handshake: Option<HandshakeBundle>,
    ) -> Result<Envelope, SessionError> {
        let user = self.user.lock().await;
        let mut envelope = Envelope {
            version: 1,
            sender_secret_name: user.secret_name.clone(),
            sender_device_id: user.device_id,
            shared_message_id,
            sent_at: Utc::now(),
            ratchet_header,
            handshake,
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            signature: String::new(),
        };
        let signable = envelope.canonical_bytes();
        envelope.signature = URL_SAFE_NO_PAD.encode(user.account_signing.sign(&signable));
        Ok(envelope)
    }
}

impl<S: Store, T: Transport> JobHandler for EngineJobHandler<S, T> {
    async fn process(&self, job: &Job) -> Result<(), SessionError> {
        let payload: JobPayload = serde_json::from_slice(&job.payload)?;
        let handle = self
            .cache
            .get_handle(job.identity_id)
            .await?
            .ok_or(crate::error::CacheError::UnknownIdentity(job.identity_id))?;

        let handshake_bundle = if !handle.established {
            let bundle = self.fresh_handshake(&handle).await?;
            self.pending_handshakes.lock().await.insert(job.identity_id, bundle.clone());
            Some(bundle)
        } else {
            self.pending_handshakes.lock().await.remove(&job.identity_id)
        };

        let plaintext = serde_json::to_vec(&payload.message)?;
        let (header, ciphertext) = self
            .cache
            .with_ratchet_mut(job.identity_id, |ratchet| ratchet.encrypt_message(&plaintext))
            .await?;

        let envelope = self
            .sign_and_build_envelope(header, ciphertext, payload.message.shared_message_id, handshake_bundle)
            .await?;

        let metadata = serde_json::json!({
            "recipient_secret_name": handle.secret_name,
            "recipient_device_id": handle.device_id,
        });
        self.transport.send_message(&envelope, metadata).await?;
        Ok(())
    }

    async fn recover(&self, identity_id: Uuid) -> Result<(), SessionError> {
        let handle = self
            .cache
            .get_handle(identity_id)
            .await?
            .ok_or(crate::error::CacheError::UnknownIdentity(identity_id))?;
        self.registry.refresh(&handle.secret_name, true).await?;
        let refreshed = self
            .cache
            .get_handle(identity_id)
            .await?
            .ok_or(crate::error::CacheError::UnknownIdentity(identity_id))?;
        let bundle = self.fresh_handshake(&refreshed).await?;
        self.pending_handshakes.lock().await.insert(identity_id, bundle);
        Ok(())
    }
}

/// The top-level handle for one device's local session: owns the live
/// `SessionUser`, and wires `Cache`, `IdentityRegistry`, `FanOut`,
/// `TaskProcessor`, and `KeyRotation` to one `Transport`/`EventReceiver`
/// pair. Replaces what a less deliberate design would make a global
/// singleton (§9).
pub struct SessionEngine<S: Store, T: Transport, E: EventReceiver> {
    session_context_id: Uuid,
    user: Arc<Mutex<SessionUser>>,
    registration_state: Mutex<RegistrationState>,
    vault: Vault,
    cache: Arc<Cache<S>>,
    registry: Arc<IdentityRegistry<S, T>>,
    fanout: FanOut<S, T>,
    key_rotation: KeyRotation<S, T>,
    task_processor: TaskProcessor<EngineJobHandler<S, T>>,
    transport: Arc<T>,
    events: Arc<E>,
    config: EngineConfig,
}

impl<S: Store, T: Transport, E: EventReceiver> SessionEngine<S, T, E> {
    pub fn new(context: SessionContext, vault: Vault, store: S, transport: Arc<T>, events: Arc<E>, config: EngineConfig) -> Self {
        let cache = Arc::new(Cache::new(store, vault.clone()));
        let registry = Arc::new(IdentityRegistry::new(cache.clone(), transport.clone(), context.session_context_id));
        let fanout = FanOut::new(cache.clone(), registry.clone());
        let key_rotation = KeyRotation::new(cache.clone(), transport.clone(), config.clone());
        let user = Arc::new(Mutex::new(context.session_user));
        let handler = Arc::new(EngineJobHandler {
            user: user.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            transport: transport.clone(),
            config: config.clone(),
            pending_handshakes: Mutex::new(HashMap::new()),
        });
        let task_processor = TaskProcessor::new(handler);

        Self {
            session_context_id: context.session_context_id,
            user,
            registration_state: Mutex::new(context.registration_state),
            vault,
            cache,
            registry,
            fanout,
            key_rotation,
            task_processor,
            transport,
            events,
            config,
        }
    }

    pub fn session_context_id(&self) -> Uuid {
        self.session_context_id
    }

    pub async fn local_secret_name(&self) -> String {
        self.user.lock().await.secret_name.clone()
    }

    pub async fn local_device_id(&self) -> Uuid {
        self.user.lock().await.device_id
    }

    pub async fn registration_state(&self) -> RegistrationState {
        *self.registration_state.lock().await
    }

    /// Publish this device's configuration so others can discover it, and
    /// mark the session registered.
    pub async fn register(&self, published_configuration: &UserConfiguration) -> Result<(), SessionError> {
        let device_id = self.local_device_id().await;
        self.transport.publish_user_configuration(published_configuration, device_id).await?;
        *self.registration_state.lock().await = RegistrationState::Registered;
        Ok(())
    }

    /// Resolve `recipient`, enqueue one job per destination device, and
    /// drive every affected queue to completion. Returns once every
    /// fan-out target has been handed to the transport (or failed
    /// unrecoverably).
    pub async fn send(
        &self,
        text: String,
        recipient: Recipient,
        metadata: serde_json::Value,
        communication: Option<&BaseCommunication>,
    ) -> Result<(), SessionError> {
        let local = self.user.lock().await;
        let targets = self.fanout.resolve(&local, &recipient, communication).await?;
        drop(local);

        if targets.is_empty() {
            return Ok(());
        }

        let message = CryptoMessage {
            shared_message_id: targets[0].shared_id,
            text,
            metadata,
            recipient,
            sent_date: Utc::now(),
            destruction_time: None,
            transport_info: None,
        };

        self.enqueue_and_drain(&targets, &message).await
    }

    async fn enqueue_and_drain(&self, targets: &[FanOutTarget], message: &CryptoMessage) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(&JobPayload { message: message.clone() })?;
        for target in targets {
            self.task_processor
                .enqueue(Job { identity_id: target.identity_id, sequence_id: target.sequence_id, payload: payload.clone() })
                .await?;
        }
        for target in targets {
            self.task_processor.drain(target.identity_id).await?;
        }
        Ok(())
    }

    /// Handle one inbound envelope: verify its signature, decrypt through
    /// the ratchet (running the responder side of a handshake if the
    /// envelope carries one and no session exists yet), then either
    /// dispatch a control frame or persist and notify an application
    /// message.
    pub async fn receive(&self, envelope: Envelope) -> Result<(), SessionError> {
        let existing = self.cache.find_handle(&envelope.sender_secret_name, envelope.sender_device_id).await?;

        let identity_id = match (&existing, &envelope.handshake) {
            (Some(handle), _) => {
                dl_crypto::identity::SigningKeyPair::verify(
                    &handle.remote_signing.0,
                    &envelope.canonical_bytes(),
                    &URL_SAFE_NO_PAD.decode(&envelope.signature).map_err(|_| {
                        SessionError::ConfigurationError("malformed envelope signature".into())
                    })?,
                )?;
                handle.id
            }
            (None, Some(bundle)) => {
                let refreshed = self.registry.refresh(&envelope.sender_secret_name, true).await?;
                let handle = refreshed
                    .into_iter()
                    .find(|h| h.device_id == envelope.sender_device_id)
                    .ok_or_else(|| SessionError::UserNotFound(envelope.sender_secret_name.clone()))?;
                dl_crypto::identity::SigningKeyPair::verify(
                    &handle.remote_signing.0,
                    &envelope.canonical_bytes(),
                    &URL_SAFE_NO_PAD.decode(&envelope.signature).map_err(|_| {
                        SessionError::ConfigurationError("malformed envelope signature".into())
                    })?,
                )?;
                let mut user = self.user.lock().await;
                let ratchet = handshake::respond_to(
                    &mut user,
                    envelope.sender_device_id,
                    &handle.remote_signing,
                    bundle,
                    self.config.ratchet_associated_data.clone(),
                    self.config.max_skipped_message_keys,
                )?;
                drop(user);
                self.cache.establish(handle.id, ratchet).await?;
                handle.id
            }
            (None, None) => return Err(SessionError::UserNotFound(envelope.sender_secret_name.clone())),
        };

        let plaintext = self
            .cache
            .with_ratchet_mut(identity_id, |ratchet| ratchet.decrypt_message(&envelope.ratchet_header, &decode_b64(&envelope.ciphertext)?))
            .await?;
        let message: CryptoMessage = serde_json::from_slice(&plaintext)?;

        if let Some(frame) = &message.transport_info {
            if let Err(err) = crate::control_frames::handle_control_frame(
                &self.cache,
                &self.registry,
                &self.transport,
                &self.user,
                &envelope.sender_secret_name,
                envelope.sender_device_id,
                frame,
            )
            .await
            {
                tracing::warn!(error = %err, "control frame handling failed, swallowing per policy");
            }
            return Ok(());
        }

        self.persist_and_notify(&envelope, &message).await
    }

    async fn persist_and_notify(&self, envelope: &Envelope, message: &CryptoMessage) -> Result<(), SessionError> {
        // A channel message's `communication_id` is resolved from the
        // channel name by the caller's roster lookup before persistence;
        // absent that, fall back to `shared_message_id` as a stable key.
        let communication_id = message.shared_message_id;

        let plaintext = serde_json::to_vec(message)?;
        let ciphertext = self
            .vault
            .with_key(|key| dl_crypto::aead::encrypt(key, &plaintext, MESSAGE_AAD).map_err(dl_store::StoreError::Crypto))
            .await?;

        let sequence_number = self.cache.store().message_count(&envelope.shared_message_id.to_string()).await? as i64;
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            communication_id: communication_id.to_string(),
            session_context_id: self.session_context_id.to_string(),
            shared_id: envelope.shared_message_id.to_string(),
            sequence_number,
            data_enc: URL_SAFE_NO_PAD.encode(ciphertext),
            created_at: Utc::now(),
        };
        self.cache.store().put_message(&row).await?;
        notify("created_message", || self.events.created_message(&row));
        Ok(())
    }

    /// Rotate the ML-KEM batch if due; a no-op otherwise. Intended to be
    /// polled periodically by the application (e.g. on process start and
    /// once a day thereafter).
    pub async fn rotate_keys_if_due(&self) -> Result<bool, SessionError> {
        let mut user = self.user.lock().await;
        self.key_rotation.rotate_mlkem_if_needed(&mut user).await
    }

    /// Check the remote-reported one-time-key counts for both kinds and
    /// refill whichever has dropped below `one_time_key_low_watermark`
    /// (§4.2). Intended to be polled the same way as `rotate_keys_if_due`.
    pub async fn refill_one_time_keys_if_needed(&self) -> Result<(), SessionError> {
        let mut user = self.user.lock().await;
        self.key_rotation.refill_if_below_watermark(&mut user, dl_proto::communication::OneTimeKeyKind::Curve).await?;
        self.key_rotation.refill_if_below_watermark(&mut user, dl_proto::communication::OneTimeKeyKind::MlKem).await?;
        Ok(())
    }

    /// Full key rotation on suspected compromise: rotates signing,
    /// long-term X25519, and both one-time batches, then emits a signed
    /// `sessionReestablishment` control frame to every peer with an
    /// established session.
    pub async fn rotate_keys_on_potential_compromise(&self) -> Result<(), SessionError> {
        let notified = {
            let mut user = self.user.lock().await;
            self.key_rotation.rotate_keys_on_potential_compromise(&mut user).await?
        };

        for (secret_name, device_id) in notified {
            if let Some(handle) = self.cache.find_handle(&secret_name, device_id).await? {
                let message = CryptoMessage {
                    shared_message_id: Uuid::new_v4(),
                    text: String::new(),
                    metadata: serde_json::Value::Null,
                    recipient: Recipient::Nickname { secret_name: secret_name.clone() },
                    sent_date: Utc::now(),
                    destruction_time: None,
                    transport_info: Some(ControlFrame::SessionReestablishment),
                };
                let payload = serde_json::to_vec(&JobPayload { message })?;
                let sequence_id = self.fanout.next_control_sequence(handle.id);
                self.task_processor.enqueue(Job { identity_id: handle.id, sequence_id, payload }).await?;
                self.task_processor.drain(handle.id).await?;
            }
        }
        self.key_rotation.clear_remote_deletion_flag();
        Ok(())
    }

    /// Zero all in-memory cache state (§4.10): used on shutdown and on
    /// app-password change. Shuts down the task processor first so no job
    /// is left observing half-cleared state.
    pub async fn shutdown(&self) {
        self.task_processor.shutdown().await;
        self.cache.dump_cache().await;
    }
}

fn decode_b64(s: &str) -> Result<Vec<u8>, dl_crypto::error::RatchetError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| dl_crypto::error::RatchetError::Crypto(dl_crypto::CryptoError::InvalidKeyMaterial("malformed ciphertext".into())))
}
