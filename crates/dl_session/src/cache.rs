//! `Cache` — write-through in-memory index over `dl_store::Store` (§4.10,
//! §4.4, §9). The sole owner of live `SessionIdentity` values (ratchet
//! state included); every other component — `IdentityRegistry`,
//! `RatchetEngine`, `TaskProcessor` — addresses an identity by its opaque
//! `Uuid` and either reads an `IdentityHandle` (no secret material) or
//! calls `with_ratchet_mut` to operate on the live ratchet for the
//! duration of one closure. This breaks the identity/session/cache
//! reference cycle the specification flags: nothing outside this module
//! ever holds a `&mut RatchetSession` across a suspension point.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use dl_crypto::identity::PublicKeyBytes;
use dl_crypto::ratchet::RatchetSession;
use dl_proto::communication::{BaseCommunication, CommunicationKind};
use tokio::sync::RwLock;
use uuid::Uuid;

use dl_store::models::{CommunicationRow, SessionIdentityRow};
use dl_store::{Store, Vault};

use crate::error::{CacheError, SessionError};
use crate::identity::SessionIdentity;

const RATCHET_AAD: &[u8] = b"dl-session-ratchet-v1";
const COMMUNICATION_AAD: &[u8] = b"dl-session-communication-v1";

/// Public-facing view of a `SessionIdentity`: everything but the live
/// ratchet. Returned by `IdentityRegistry::get`/`refresh` so callers can
/// reason about an identity without ever touching its secret state.
#[derive(Debug, Clone)]
pub struct IdentityHandle {
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
    pub established: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityHandle {
    fn from_identity(identity: &SessionIdentity) -> Self {
        Self {
            id: identity.id,
            secret_name: identity.secret_name.clone(),
            device_id: identity.device_id,
            session_context_id: identity.session_context_id,
            device_name: identity.device_name.clone(),
            is_master_device: identity.is_master_device,
            remote_long_term_curve: identity.remote_long_term_curve.clone(),
            remote_signing: identity.remote_signing.clone(),
            remote_mlkem: identity.remote_mlkem.clone(),
            remote_one_time_curve: identity.remote_one_time_curve.clone(),
            established: identity.is_established(),
            created_at: identity.created_at,
            updated_at: identity.updated_at,
        }
    }
}

/// Write-through cache keyed by identity/communication id, with a
/// secondary `(secret_name, device_id)` index for identity lookup.
pub struct Cache<S: Store> {
    store: S,
    vault: Vault,
    identities: RwLock<HashMap<Uuid, SessionIdentity>>,
    identity_index: RwLock<HashMap<(String, Uuid), Uuid>>,
    communications: RwLock<HashMap<Uuid, BaseCommunication>>,
}

impl<S: Store> Cache<S> {
    pub fn new(store: S, vault: Vault) -> Self {
        Self {
            store,
            vault,
            identities: RwLock::new(HashMap::new()),
            identity_index: RwLock::new(HashMap::new()),
            communications: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Insert a freshly constructed identity (unestablished or just past
    /// its handshake). Fails if one already exists for this
    /// `(secret_name, device_id)` pair.
    pub async fn insert_identity(&self, identity: SessionIdentity) -> Result<IdentityHandle, SessionError> {
        let key = (identity.secret_name.clone(), identity.device_id);
        {
            let index = self.identity_index.read().await;
            if index.contains_key(&key) {
                return Err(CacheError::DuplicateIdentity { secret_name: key.0, device_id: key.1 }.into());
            }
        }

        let row = self.identity_to_row(&identity).await?;
        self.store.put_identity(&row).await?;

        let handle = IdentityHandle::from_identity(&identity);
        let id = identity.id;
        self.identities.write().await.insert(id, identity);
        self.identity_index.write().await.insert(key, id);
        Ok(handle)
    }

    pub async fn get_handle(&self, id: Uuid) -> Result<Option<IdentityHandle>, SessionError> {
        if let Some(identity) = self.identities.read().await.get(&id) {
            return Ok(Some(IdentityHandle::from_identity(identity)));
        }
        let Some(row) = self.store.get_identity(id).await? else {
            return Ok(None);
        };
        let identity = self.row_to_identity(row).await?;
        Ok(Some(self.cache_and_index(identity).await))
    }

    pub async fn find_handle(
        &self,
        secret_name: &str,
        device_id: Uuid,
    ) -> Result<Option<IdentityHandle>, SessionError> {
        let key = (secret_name.to_string(), device_id);
        if let Some(id) = self.identity_index.read().await.get(&key).copied() {
            return self.get_handle(id).await;
        }

        let rows = self.store.get_identities_for_secret_name(secret_name).await?;
        let Some(row) = rows.into_iter().find(|row| row.device_id == device_id.to_string()) else {
            return Ok(None);
        };
        let identity = self.row_to_identity(row).await?;
        Ok(Some(self.cache_and_index(identity).await))
    }

    pub async fn list_handles_for_secret_name(
        &self,
        secret_name: &str,
    ) -> Result<Vec<IdentityHandle>, SessionError> {
        let rows = self.store.get_identities_for_secret_name(secret_name).await?;
        let mut handles = Vec::with_capacity(rows.len());
        for row in rows {
            let device_id: Uuid = row.device_id.parse().map_err(|_| {
                SessionError::ConfigurationError("malformed identity row device id".into())
            })?;
            let key = (secret_name.to_string(), device_id);
            let id = self.identity_index.read().await.get(&key).copied();
            let handle = match id {
                Some(id) => self.get_handle(id).await?,
                None => {
                    let identity = self.row_to_identity(row).await?;
                    Some(self.cache_and_index(identity).await)
                }
            };
            if let Some(handle) = handle {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Replace everything but the live ratchet for an identity already in
    /// the cache (a refresh picked up new published keys). The existing
    /// ratchet, if any, is preserved untouched.
    pub async fn update_remote_keys(
        &self,
        id: Uuid,
        device_name: String,
        is_master_device: bool,
        remote_long_term_curve: PublicKeyBytes,
        remote_signing: PublicKeyBytes,
        remote_mlkem: PublicKeyBytes,
        remote_one_time_curve: Option<PublicKeyBytes>,
    ) -> Result<IdentityHandle, SessionError> {
        let mut identities = self.identities.write().await;
        let identity = identities.get_mut(&id).ok_or(CacheError::UnknownIdentity(id))?;
        identity.device_name = device_name;
        identity.is_master_device = is_master_device;
        identity.remote_long_term_curve = remote_long_term_curve;
        identity.remote_signing = remote_signing;
        identity.remote_mlkem = remote_mlkem;
        identity.remote_one_time_curve = remote_one_time_curve;
        identity.updated_at = Utc::now();
        let row = self.identity_to_row(identity).await?;
        self.store.put_identity(&row).await?;
        Ok(IdentityHandle::from_identity(identity))
    }

    /// Every currently cached identity that has completed its handshake.
    /// Used to broadcast a `sessionReestablishment` after a compromise
    /// rotation (§4.9); limited to in-memory state, which is acceptable
    /// since every identity the local device has ever messaged gets
    /// touched (and so cached) over the lifetime of the process.
    pub async fn established_handles(&self) -> Vec<IdentityHandle> {
        self.identities
            .read()
            .await
            .values()
            .filter(|identity| identity.is_established())
            .map(IdentityHandle::from_identity)
            .collect()
    }

    /// Install the ratchet state produced by a just-completed handshake.
    pub async fn establish(&self, id: Uuid, ratchet: RatchetSession) -> Result<(), SessionError> {
        let mut identities = self.identities.write().await;
        let identity = identities.get_mut(&id).ok_or(CacheError::UnknownIdentity(id))?;
        identity.ratchet = Some(ratchet);
        identity.updated_at = Utc::now();
        let row = self.identity_to_row(identity).await?;
        drop(identities);
        self.store.put_identity(&row).await?;
        Ok(())
    }

    /// Operate on the live ratchet for `id`, persisting the result on
    /// success and leaving cached state untouched on failure (mirrors the
    /// ratchet's own "no mutation on failure" contract at the identity
    /// level). Errors if the identity is unknown or not yet established.
    pub async fn with_ratchet_mut<F, R>(&self, id: Uuid, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut RatchetSession) -> Result<R, dl_crypto::error::RatchetError>,
    {
        let mut identities = self.identities.write().await;
        let identity = identities.get_mut(&id).ok_or(CacheError::UnknownIdentity(id))?;
        let ratchet = identity.ratchet.as_mut().ok_or(CacheError::UnknownIdentity(id))?;
        let result = f(ratchet)?;
        identity.updated_at = Utc::now();
        let row = self.identity_to_row(identity).await?;
        drop(identities);
        self.store.put_identity(&row).await?;
        Ok(result)
    }

    pub async fn remove_identity(&self, id: Uuid) -> Result<(), SessionError> {
        self.store.delete_identity(id).await?;
        if let Some(identity) = self.identities.write().await.remove(&id) {
            self.identity_index.write().await.remove(&(identity.secret_name, identity.device_id));
        }
        Ok(())
    }

    pub async fn get_communication(&self, id: Uuid) -> Result<Option<BaseCommunication>, SessionError> {
        if let Some(comm) = self.communications.read().await.get(&id) {
            return Ok(Some(comm.clone()));
        }
        let Some(row) = self.store.get_communication(id).await? else {
            return Ok(None);
        };
        let comm = self.communication_from_row(row).await?;
        self.communications.write().await.insert(id, comm.clone());
        Ok(Some(comm))
    }

    pub async fn put_communication(&self, comm: BaseCommunication) -> Result<(), SessionError> {
        let row = self.communication_to_row(&comm).await?;
        self.store.put_communication(&row).await?;
        self.communications.write().await.insert(comm.id, comm);
        Ok(())
    }

    /// Zero all in-memory state (§4.10): used on shutdown and on
    /// app-password change. The persistent store is untouched; the next
    /// read simply repopulates the cache.
    pub async fn dump_cache(&self) {
        self.identities.write().await.clear();
        self.identity_index.write().await.clear();
        self.communications.write().await.clear();
    }

    async fn cache_and_index(&self, identity: SessionIdentity) -> IdentityHandle {
        let handle = IdentityHandle::from_identity(&identity);
        let key = (identity.secret_name.clone(), identity.device_id);
        let id = identity.id;
        self.identities.write().await.insert(id, identity);
        self.identity_index.write().await.insert(key, id);
        handle
    }

    async fn identity_to_row(&self, identity: &SessionIdentity) -> Result<SessionIdentityRow, SessionError> {
        let ratchet_state_enc = match &identity.ratchet {
            Some(ratchet) => Some(self.encrypt_ratchet(ratchet).await?),
            None => None,
        };
        Ok(SessionIdentityRow {
            id: identity.id.to_string(),
            secret_name: identity.secret_name.clone(),
            device_id: identity.device_id.to_string(),
            session_context_id: identity.session_context_id.to_string(),
            device_name: identity.device_name.clone(),
            is_master_device: identity.is_master_device,
            long_term_curve_pub: identity.remote_long_term_curve.to_b64(),
            signing_pub: identity.remote_signing.to_b64(),
            mlkem_pub: identity.remote_mlkem.to_b64(),
            one_time_curve_pub: identity.remote_one_time_curve.as_ref().map(|k| k.to_b64()),
            ratchet_state_enc,
            created_at: identity.created_at,
            updated_at: identity.updated_at,
        })
    }

    async fn row_to_identity(&self, row: SessionIdentityRow) -> Result<SessionIdentity, SessionError> {
        let ratchet = match &row.ratchet_state_enc {
            Some(enc) => Some(self.decrypt_ratchet(enc).await?),
            None => None,
        };
        Ok(SessionIdentity {
            id: row.id.parse().map_err(|_| SessionError::ConfigurationError("malformed identity row id".into()))?,
            secret_name: row.secret_name,
            device_id: row
                .device_id
                .parse()
                .map_err(|_| SessionError::ConfigurationError("malformed identity row device id".into()))?,
            session_context_id: row.session_context_id.parse().map_err(|_| {
                SessionError::ConfigurationError("malformed identity row session context id".into())
            })?,
            device_name: row.device_name,
            is_master_device: row.is_master_device,
            remote_long_term_curve: PublicKeyBytes::from_b64(&row.long_term_curve_pub)?,
            remote_signing: PublicKeyBytes::from_b64(&row.signing_pub)?,
            remote_mlkem: PublicKeyBytes::from_b64(&row.mlkem_pub)?,
            remote_one_time_curve: row.one_time_curve_pub.as_deref().map(PublicKeyBytes::from_b64).transpose()?,
            ratchet,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn encrypt_ratchet(&self, ratchet: &RatchetSession) -> Result<String, SessionError> {
        let plaintext = serde_json::to_vec(ratchet)?;
        let ciphertext = self
            .vault
            .with_key(|key| dl_crypto::aead::encrypt(key, &plaintext, RATCHET_AAD).map_err(dl_store::StoreError::Crypto))
            .await?;
        Ok(URL_SAFE_NO_PAD.encode(ciphertext))
    }

    async fn decrypt_ratchet(&self, enc: &str) -> Result<RatchetSession, SessionError> {
        let ciphertext = URL_SAFE_NO_PAD
            .decode(enc)
            .map_err(|_| SessionError::ConfigurationError("malformed ratchet envelope".into()))?;
        let plaintext = self
            .vault
            .with_key(|key| {
                dl_crypto::aead::decrypt(key, &ciphertext, RATCHET_AAD).map(|pt| pt.to_vec()).map_err(dl_store::StoreError::Crypto)
            })
            .await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn communication_to_row(&self, comm: &BaseCommunication) -> Result<CommunicationRow, SessionError> {
        let plaintext = serde_json::to_vec(comm)?;
        let metadata_enc = self
            .vault
            .with_key(|key| dl_crypto::aead::encrypt(key, &plaintext, COMMUNICATION_AAD).map_err(dl_store::StoreError::Crypto))
            .await?;
        Ok(CommunicationRow {
            id: comm.id.to_string(),
            kind: match comm.kind {
                CommunicationKind::Direct => "direct".to_string(),
                CommunicationKind::Channel => "channel".to_string(),
            },
            metadata_enc: URL_SAFE_NO_PAD.encode(metadata_enc),
            message_count: comm.message_count as i64,
            created_at: comm.created_at,
            updated_at: comm.updated_at,
        })
    }

    async fn communication_from_row(&self, row: CommunicationRow) -> Result<BaseCommunication, SessionError> {
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&row.metadata_enc)
            .map_err(|_| SessionError::ConfigurationError("malformed communication envelope".into()))?;
        let plaintext = self
            .vault
            .with_key(|key| {
                dl_crypto::aead::decrypt(key, &ciphertext, COMMUNICATION_AAD).map(|pt| pt.to_vec()).map_err(dl_store::StoreError::Crypto)
            })
            .await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::InMemoryStore;

    fn fake_key() -> PublicKeyBytes {
        PublicKeyBytes(vec![1u8; 32])
    }

    #[tokio::test]
    async fn insert_then_get_identity_round_trips() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await.unwrap();
        let cache = Cache::new(store, vault);

        let identity = SessionIdentity::new_unestablished(
            "alice".into(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "laptop".into(),
            true,
            fake_key(),
            fake_key(),
            fake_key(),
        );
        let id = identity.id;
        let secret_name = identity.secret_name.clone();
        let device_id = identity.device_id;
        cache.insert_identity(identity).await.unwrap();

        let fetched = cache.get_handle(id).await.unwrap().unwrap();
        assert_eq!(fetched.secret_name, secret_name);
        assert!(!fetched.established);

        let by_index = cache.find_handle(&secret_name, device_id).await.unwrap().unwrap();
        assert_eq!(by_index.id, id);
    }

    #[tokio::test]
    async fn duplicate_identity_for_same_pair_is_rejected() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await.unwrap();
        let cache = Cache::new(store, vault);

        let device_id = Uuid::new_v4();
        let secret_name = "bob".to_string();
        let session_context_id = Uuid::new_v4();

        let first = SessionIdentity::new_unestablished(
            secret_name.clone(),
            device_id,
            session_context_id,
            "phone".into(),
            false,
            fake_key(),
            fake_key(),
            fake_key(),
        );
        cache.insert_identity(first).await.unwrap();

        let second = SessionIdentity::new_unestablished(
            secret_name,
            device_id,
            session_context_id,
            "phone".into(),
            false,
            fake_key(),
            fake_key(),
            fake_key(),
        );
        let err = cache.insert_identity(second).await.unwrap_err();
        assert!(matches!(err, SessionError::Cache(CacheError::DuplicateIdentity { .. })));
    }

    #[tokio::test]
    async fn dump_cache_clears_in_memory_state_but_not_store() {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await.unwrap();
        let cache = Cache::new(store, vault);

        let identity = SessionIdentity::new_unestablished(
            "carol".into(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tablet".into(),
            false,
            fake_key(),
            fake_key(),
            fake_key(),
        );
        let id = identity.id;
        cache.insert_identity(identity).await.unwrap();

        cache.dump_cache().await;
        assert!(cache.identities.read().await.is_empty());

        let reloaded = cache.get_handle(id).await.unwrap();
        assert!(reloaded.is_some());
    }
}
