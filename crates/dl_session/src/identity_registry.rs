//! `IdentityRegistry` (§4.4) — materializes `IdentityHandle` values for a
//! `(secretName, deviceId)` pair, fronted by `Cache`. Verification of the
//! remote signature chain happens here, not in `Transport` — the transport
//! is trust-on-first-use only.

use std::sync::Arc;

use dl_crypto::identity::PublicKeyBytes;
use dl_store::Store;
use uuid::Uuid;

use crate::cache::{Cache, IdentityHandle};
use crate::error::SessionError;
use crate::identity::SessionIdentity;
use crate::transport::Transport;

pub struct IdentityRegistry<S: Store, T: Transport> {
    cache: Arc<Cache<S>>,
    transport: Arc<T>,
    session_context_id: Uuid,
}

impl<S: Store, T: Transport> IdentityRegistry<S, T> {
    pub fn new(cache: Arc<Cache<S>>, transport: Arc<T>, session_context_id: Uuid) -> Self {
        Self { cache, transport, session_context_id }
    }

    /// Cached identities for every one of `secret_name`'s devices. Never
    /// touches the transport.
    pub async fn get(&self, secret_name: &str) -> Result<Vec<IdentityHandle>, SessionError> {
        self.cache.list_handles_for_secret_name(secret_name).await
    }

    /// Refresh `secret_name`'s identities against the transport. Returns
    /// the cached set unchanged when `!force` and at least one identity is
    /// already cached.
    pub async fn refresh(&self, secret_name: &str, force: bool) -> Result<Vec<IdentityHandle>, SessionError> {
        if !force {
            let cached = self.get(secret_name).await?;
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        let config = self.transport.fetch_user_configuration(secret_name).await?;
        config.verify_all()?;

        let mut handles = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let existing = self.cache.find_handle(secret_name, device.device_id).await?;
            let is_new = existing.is_none();

            let remote_long_term_curve = PublicKeyBytes::from_b64(&device.long_term_curve_pub)?;
            let remote_signing = PublicKeyBytes::from_b64(&device.signing_pub)?;
            let remote_mlkem = PublicKeyBytes::from_b64(&device.final_mlkem_pub)?;

            let remote_one_time_curve = if is_new || force {
                match self.transport.fetch_one_time_keys(secret_name, device.device_id).await {
                    Ok(keys) => keys.curve.map(|k| PublicKeyBytes::from_b64(&k.public_key)).transpose()?,
                    Err(_) => None,
                }
            } else {
                existing.as_ref().and_then(|h| h.remote_one_time_curve.clone())
            };

            let handle = match existing {
                Some(handle) => {
                    self.cache
                        .update_remote_keys(
                            handle.id,
                            device.device_name.clone(),
                            device.is_master_device,
                            remote_long_term_curve,
                            remote_signing,
                            remote_mlkem,
                            remote_one_time_curve,
                        )
                        .await?
                }
                None => {
                    let mut identity = SessionIdentity::new_unestablished(
                        secret_name.to_string(),
                        device.device_id,
                        self.session_context_id,
                        device.device_name.clone(),
                        device.is_master_device,
                        remote_long_term_curve,
                        remote_signing,
                        remote_mlkem,
                    );
                    identity.remote_one_time_curve = remote_one_time_curve;
                    self.cache.insert_identity(identity).await?
                }
            };
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Remove every cached identity for `secret_name` (friendship reset).
    pub async fn remove(&self, secret_name: &str) -> Result<(), SessionError> {
        for handle in self.get(secret_name).await? {
            self.cache.remove_identity(handle.id).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), SessionError> {
        self.cache.remove_identity(id).await
    }
}
