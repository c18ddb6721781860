//! Control-frame interpretation (§4.8). Control frames travel in-band,
//! ratchet-encrypted, inside `CryptoMessage::transport_info`; they are
//! never persisted to the message store, never handed to the
//! application, and never auto-retried.

use std::collections::HashSet;
use std::sync::Arc;

use dl_proto::communication::OneTimeKeyKind;
use dl_proto::message::ControlFrame;
use dl_store::Store;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::SessionError;
use crate::identity_registry::IdentityRegistry;
use crate::session_context::SessionUser;
use crate::transport::Transport;

/// Dispatch one inbound control frame from `sender_secret_name`'s device
/// `sender_device_id`. Errors here are logged and swallowed by the caller
/// (the task processor's receive path), per §7: "the engine logs-and-swallows
/// only in receiver-callback fanout and in control-frame interpretation."
pub async fn handle_control_frame<S: Store, T: Transport>(
    cache: &Arc<Cache<S>>,
    registry: &IdentityRegistry<S, T>,
    transport: &Arc<T>,
    local_user: &Mutex<SessionUser>,
    sender_secret_name: &str,
    sender_device_id: Uuid,
    frame: &ControlFrame,
) -> Result<(), SessionError> {
    match frame {
        ControlFrame::SessionReestablishment => {
            if let Some(handle) = cache.find_handle(sender_secret_name, sender_device_id).await? {
                cache.remove_identity(handle.id).await?;
            }
            registry.refresh(sender_secret_name, true).await?;
            Ok(())
        }
        ControlFrame::SynchronizeOneTimeKeys { kind } => synchronize_local_keys(transport, local_user, *kind).await,
    }
}

/// Reconcile this device's own one-time-key batch of `kind` against the
/// transport's authoritative set (§4.2/§4.8): fetch the remote-unconsumed
/// ID set and drop any local private key whose ID is not in it. This
/// recovers local state after a remote consumed (and deleted) a one-time
/// key the peer who sent `synchronizeOneTimeKeys` already knew about.
pub async fn synchronize_local_keys<T: Transport>(
    transport: &Arc<T>,
    local_user: &Mutex<SessionUser>,
    kind: OneTimeKeyKind,
) -> Result<(), SessionError> {
    let mut user = local_user.lock().await;
    let remote_ids: HashSet<Uuid> = transport
        .fetch_one_time_key_identities(&user.secret_name, user.device_id, kind)
        .await?
        .into_iter()
        .collect();

    match kind {
        OneTimeKeyKind::Curve => user.device_keys.retain_curve_ids(&remote_ids),
        OneTimeKeyKind::MlKem => user.device_keys.retain_mlkem_ids(&remote_ids),
    }

    tracing::debug!(
        secret_name = %user.secret_name,
        device_id = %user.device_id,
        ?kind,
        remaining_remote = remote_ids.len(),
        "synchronized one-time keys after control frame"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionIdentity;
    use crate::testutil::{InMemoryStore, StaticTransport};
    use dl_crypto::identity::{generate_device_bundle, PublicKeyBytes, SigningKeyPair};
    use dl_store::Vault;

    fn fake_key() -> PublicKeyBytes {
        PublicKeyBytes(vec![9u8; 32])
    }

    fn make_local_user(device_id: Uuid) -> SessionUser {
        let account_signing = SigningKeyPair::generate();
        let (device_keys, _config) =
            generate_device_bundle(device_id, "erin-laptop", true, &account_signing, 3, 7);
        SessionUser {
            secret_name: "erin".into(),
            device_id,
            device_name: "laptop".into(),
            is_master_device: true,
            account_signing,
            device_keys,
        }
    }

    #[tokio::test]
    async fn session_reestablishment_drops_cached_identity_and_refreshes() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        vault.unlock_with_key([4u8; 32]).await.unwrap();
        let cache = Arc::new(Cache::new(store, vault));

        let device_id = Uuid::new_v4();
        let identity = SessionIdentity::new_unestablished(
            "dave".into(),
            device_id,
            Uuid::new_v4(),
            "phone".into(),
            true,
            fake_key(),
            fake_key(),
            fake_key(),
        );
        cache.insert_identity(identity).await.unwrap();

        let transport = Arc::new(StaticTransport::new());
        // No configuration published: refresh will fail, which is fine —
        // we only assert the stale identity was dropped first.
        let registry = IdentityRegistry::new(cache.clone(), transport.clone(), Uuid::new_v4());
        let local_user = Mutex::new(make_local_user(Uuid::new_v4()));

        let _ = handle_control_frame(
            &cache,
            &registry,
            &transport,
            &local_user,
            "dave",
            device_id,
            &ControlFrame::SessionReestablishment,
        )
        .await;

        assert!(cache.find_handle("dave", device_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synchronize_local_keys_drops_curve_keys_not_in_remote_set() {
        let local_device_id = Uuid::new_v4();
        let user = make_local_user(local_device_id);
        assert!(user.device_keys.one_time_curve.len() > 1, "fixture needs >1 curve key");
        let kept = user.device_keys.one_time_curve[0].id;
        let signed_kept = dl_crypto::identity::SignedOneTimeKey::sign_curve(
            &user.device_keys.signing,
            local_device_id,
            &user.device_keys.one_time_curve[0],
        );

        let transport = Arc::new(StaticTransport::new());
        // StaticTransport's fetch_one_time_key_identities surfaces only the
        // single key it was told about here, simulating the remote set
        // shrinking to {kept} after the peer consumed the others.
        transport.set_one_time_keys(
            "erin",
            local_device_id,
            crate::transport::OneTimeKeys { curve: Some(signed_kept), mlkem: None },
        );
        let local_user = Mutex::new(user);

        synchronize_local_keys(&transport, &local_user, OneTimeKeyKind::Curve).await.unwrap();

        let after = local_user.lock().await;
        assert_eq!(after.device_keys.one_time_curve.len(), 1);
        assert_eq!(after.device_keys.one_time_curve[0].id, kept);
    }
}
