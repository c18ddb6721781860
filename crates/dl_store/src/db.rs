//! `Store` — the persistence contract, plus a minimal SQLite implementation.
//!
//! The specification treats the durable database as an external
//! collaborator; `Store` is that contract as a trait so `dl_session` can be
//! exercised against an in-memory test double instead of `SqliteStore` in
//! unit tests. `SqliteStore` is a reference implementation good enough to
//! run the engine and its tests, not a production database layer.

use std::path::Path;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    Row,
};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CommunicationRow, ContactRow, DeviceSaltRow, JobRow, MediaJobRow, MessageRow,
    SessionContextRow, SessionIdentityRow,
};
use crate::vault::Vault;

/// CRUD plus ordered-stream access for every §3 entity that is persisted
/// rather than held transiently. Single-entity writes are atomic; the store
/// makes no cross-entity (multi-row) transactional guarantees.
pub trait Store {
    async fn get_session_context(&self, device_id: &str) -> Result<Option<SessionContextRow>, StoreError>;
    async fn put_session_context(&self, row: &SessionContextRow) -> Result<(), StoreError>;

    async fn get_device_salt(&self, device_id: &str) -> Result<Option<DeviceSaltRow>, StoreError>;
    async fn put_device_salt(&self, row: &DeviceSaltRow) -> Result<(), StoreError>;

    async fn get_identity(&self, id: Uuid) -> Result<Option<SessionIdentityRow>, StoreError>;
    async fn get_identities_for_secret_name(
        &self,
        secret_name: &str,
    ) -> Result<Vec<SessionIdentityRow>, StoreError>;
    /// Fails with `StoreError::DuplicateIdentity` if another row already
    /// exists for this `(secret_name, device_id)` pair and has a different id.
    async fn put_identity(&self, row: &SessionIdentityRow) -> Result<(), StoreError>;
    async fn delete_identity(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactRow>, StoreError>;
    async fn get_contacts_for_owner(&self, owner_secret_name: &str) -> Result<Vec<ContactRow>, StoreError>;
    async fn put_contact(&self, row: &ContactRow) -> Result<(), StoreError>;

    async fn get_communication(&self, id: Uuid) -> Result<Option<CommunicationRow>, StoreError>;
    async fn put_communication(&self, row: &CommunicationRow) -> Result<(), StoreError>;

    async fn put_message(&self, row: &MessageRow) -> Result<(), StoreError>;
    /// All messages sharing `shared_id`, oldest first. The specification
    /// calls for a "lazy finite sequence"; this reference implementation
    /// materializes the result set, which is sufficient for the engine's
    /// own bounded per-conversation history.
    async fn stream_messages(&self, shared_id: &str) -> Result<Vec<MessageRow>, StoreError>;
    async fn message_count(&self, shared_id: &str) -> Result<u64, StoreError>;

    async fn put_job(&self, row: &JobRow) -> Result<(), StoreError>;
    /// The lowest-`sequence_id` job for `communication_id`, or `None` if
    /// the queue is empty. Callers MUST consume strictly in this order.
    async fn next_job(&self, communication_id: &str) -> Result<Option<JobRow>, StoreError>;
    async fn delete_job(&self, id: &str) -> Result<(), StoreError>;

    async fn put_media_job(&self, row: &MediaJobRow) -> Result<(), StoreError>;
    async fn media_jobs_for_job(&self, job_id: &str) -> Result<Vec<MediaJobRow>, StoreError>;
}

/// Central SQLite-backed store handle. Cheap to clone (pool is internally
/// reference-counted).
#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `db_path`, running all
    /// pending migrations.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at
    /// connection time here — NOT inside a migration, because SQLite
    /// forbids changing `journal_mode` inside a transaction and sqlx wraps
    /// every migration in one.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(path = %db_path.display(), "store opened");
        Ok(Self { pool, vault })
    }

    /// Encrypt a plaintext value with the vault key.
    pub async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = dl_crypto::aead::encrypt(key, plaintext, b"dl-store-v1")
                    .map_err(StoreError::Crypto)?;
                Ok(base64::Engine::encode(
                    &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                    &ct,
                ))
            })
            .await
    }

    /// Decrypt a vault-encrypted value.
    pub async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let ct = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, b64)
            .map_err(|e| StoreError::Crypto(dl_crypto::CryptoError::Base64Decode(e)))?;

        self.vault
            .with_key(|key| {
                let pt = dl_crypto::aead::decrypt(key, &ct, b"dl-store-v1").map_err(StoreError::Crypto)?;
                Ok(pt.to_vec())
            })
            .await
    }
}

impl Store for SqliteStore {
    async fn get_session_context(&self, device_id: &str) -> Result<Option<SessionContextRow>, StoreError> {
        let row = sqlx::query_as::<_, SessionContextRow>(
            "SELECT device_id, envelope_enc, created_at, updated_at FROM session_context WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_session_context(&self, row: &SessionContextRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_context (device_id, envelope_enc, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET envelope_enc = excluded.envelope_enc, updated_at = excluded.updated_at",
        )
        .bind(&row.device_id)
        .bind(&row.envelope_enc)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_device_salt(&self, device_id: &str) -> Result<Option<DeviceSaltRow>, StoreError> {
        let row = sqlx::query_as::<_, DeviceSaltRow>(
            "SELECT device_id, salt_hex FROM device_salt WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_device_salt(&self, row: &DeviceSaltRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device_salt (device_id, salt_hex) VALUES (?, ?)
             ON CONFLICT(device_id) DO UPDATE SET salt_hex = excluded.salt_hex",
        )
        .bind(&row.device_id)
        .bind(&row.salt_hex)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_identity(&self, id: Uuid) -> Result<Option<SessionIdentityRow>, StoreError> {
        let row = sqlx::query_as::<_, SessionIdentityRow>(
            "SELECT id, secret_name, device_id, session_context_id, device_name, is_master_device,
                    long_term_curve_pub, signing_pub, mlkem_pub, one_time_curve_pub,
                    ratchet_state_enc, created_at, updated_at
             FROM session_identities WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_identities_for_secret_name(
        &self,
        secret_name: &str,
    ) -> Result<Vec<SessionIdentityRow>, StoreError> {
        let rows = sqlx::query_as::<_, SessionIdentityRow>(
            "SELECT id, secret_name, device_id, session_context_id, device_name, is_master_device,
                    long_term_curve_pub, signing_pub, mlkem_pub, one_time_curve_pub,
                    ratchet_state_enc, created_at, updated_at
             FROM session_identities WHERE secret_name = ?",
        )
        .bind(secret_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_identity(&self, row: &SessionIdentityRow) -> Result<(), StoreError> {
        let existing = sqlx::query(
            "SELECT id FROM session_identities WHERE secret_name = ? AND device_id = ? AND id != ?",
        )
        .bind(&row.secret_name)
        .bind(&row.device_id)
        .bind(&row.id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(StoreError::DuplicateIdentity {
                secret_name: row.secret_name.clone(),
                device_id: row.device_id.clone(),
            });
        }

        sqlx::query(
            "INSERT INTO session_identities
                (id, secret_name, device_id, session_context_id, device_name, is_master_device,
                 long_term_curve_pub, signing_pub, mlkem_pub, one_time_curve_pub,
                 ratchet_state_enc, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                one_time_curve_pub = excluded.one_time_curve_pub,
                ratchet_state_enc = excluded.ratchet_state_enc,
                device_name = excluded.device_name,
                updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.secret_name)
        .bind(&row.device_id)
        .bind(&row.session_context_id)
        .bind(&row.device_name)
        .bind(row.is_master_device)
        .bind(&row.long_term_curve_pub)
        .bind(&row.signing_pub)
        .bind(&row.mlkem_pub)
        .bind(&row.one_time_curve_pub)
        .bind(&row.ratchet_state_enc)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_identity(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM session_identities WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactRow>, StoreError> {
        let row = sqlx::query_as::<_, ContactRow>(
            "SELECT id, owner_secret_name, contact_secret_name, display_name, identity_pubkey,
                    verified_fingerprint, key_change_pending, added_at
             FROM contacts WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_contacts_for_owner(&self, owner_secret_name: &str) -> Result<Vec<ContactRow>, StoreError> {
        let rows = sqlx::query_as::<_, ContactRow>(
            "SELECT id, owner_secret_name, contact_secret_name, display_name, identity_pubkey,
                    verified_fingerprint, key_change_pending, added_at
             FROM contacts WHERE owner_secret_name = ?",
        )
        .bind(owner_secret_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_contact(&self, row: &ContactRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO contacts
                (id, owner_secret_name, contact_secret_name, display_name, identity_pubkey,
                 verified_fingerprint, key_change_pending, added_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                identity_pubkey = excluded.identity_pubkey,
                verified_fingerprint = excluded.verified_fingerprint,
                key_change_pending = excluded.key_change_pending",
        )
        .bind(&row.id)
        .bind(&row.owner_secret_name)
        .bind(&row.contact_secret_name)
        .bind(&row.display_name)
        .bind(&row.identity_pubkey)
        .bind(&row.verified_fingerprint)
        .bind(row.key_change_pending)
        .bind(row.added_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_communication(&self, id: Uuid) -> Result<Option<CommunicationRow>, StoreError> {
        let row = sqlx::query_as::<_, CommunicationRow>(
            "SELECT id, kind, metadata_enc, message_count, created_at, updated_at
             FROM communications WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_communication(&self, row: &CommunicationRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO communications (id, kind, metadata_enc, message_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                metadata_enc = excluded.metadata_enc,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.kind)
        .bind(&row.metadata_enc)
        .bind(row.message_count)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_message(&self, row: &MessageRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages
                (id, communication_id, session_context_id, shared_id, sequence_number, data_enc, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.communication_id)
        .bind(&row.session_context_id)
        .bind(&row.shared_id)
        .bind(row.sequence_number)
        .bind(&row.data_enc)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stream_messages(&self, shared_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, communication_id, session_context_id, shared_id, sequence_number, data_enc, created_at
             FROM messages WHERE shared_id = ? ORDER BY sequence_number ASC",
        )
        .bind(shared_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn message_count(&self, shared_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE shared_id = ?")
            .bind(shared_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn put_job(&self, row: &JobRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, communication_id, sequence_id, props_enc, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.communication_id)
        .bind(row.sequence_id)
        .bind(&row.props_enc)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_job(&self, communication_id: &str) -> Result<Option<JobRow>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, communication_id, sequence_id, props_enc, created_at
             FROM jobs WHERE communication_id = ? ORDER BY sequence_id ASC LIMIT 1",
        )
        .bind(communication_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn put_media_job(&self, row: &MediaJobRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO media_jobs (id, job_id, media_ref, props_enc, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.job_id)
        .bind(&row.media_ref)
        .bind(&row.props_enc)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn media_jobs_for_job(&self, job_id: &str) -> Result<Vec<MediaJobRow>, StoreError> {
        let rows = sqlx::query_as::<_, MediaJobRow>(
            "SELECT id, job_id, media_ref, props_enc, created_at FROM media_jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::{SqliteStore, Store};
    use crate::models::{CommunicationRow, JobRow, MessageRow};
    use crate::vault::Vault;
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_tmp() -> (SqliteStore, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/dl-store-test-{}.db", Uuid::new_v4()));
        let store = SqliteStore::open(&db_path, Vault::new()).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &PathBuf) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn jobs_are_returned_in_ascending_sequence_order() {
        let (store, db_path) = open_tmp().await;
        let comm_id = Uuid::new_v4().to_string();

        for seq in [3_i64, 1, 2] {
            store
                .put_job(&JobRow {
                    id: Uuid::new_v4().to_string(),
                    communication_id: comm_id.clone(),
                    sequence_id: seq,
                    props_enc: "x".into(),
                    created_at: Utc::now(),
                })
                .await
                .expect("insert job");
        }

        let next = store.next_job(&comm_id).await.expect("query next job").unwrap();
        assert_eq!(next.sequence_id, 1);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn message_count_and_stream_agree() {
        let (store, db_path) = open_tmp().await;
        let comm = CommunicationRow {
            id: Uuid::new_v4().to_string(),
            kind: "direct".into(),
            metadata_enc: "enc".into(),
            message_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_communication(&comm).await.expect("insert communication");

        let shared_id = Uuid::new_v4().to_string();
        for n in 0..3 {
            store
                .put_message(&MessageRow {
                    id: Uuid::new_v4().to_string(),
                    communication_id: comm.id.clone(),
                    session_context_id: "ctx".into(),
                    shared_id: shared_id.clone(),
                    sequence_number: n,
                    data_enc: "x".into(),
                    created_at: Utc::now(),
                })
                .await
                .expect("insert message");
        }

        assert_eq!(store.message_count(&shared_id).await.unwrap(), 3);
        assert_eq!(store.stream_messages(&shared_id).await.unwrap().len(), 3);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn duplicate_identity_for_same_device_is_rejected() {
        use crate::models::SessionIdentityRow;

        let (store, db_path) = open_tmp().await;
        let row = SessionIdentityRow {
            id: Uuid::new_v4().to_string(),
            secret_name: "alice".into(),
            device_id: "device-1".into(),
            session_context_id: "ctx".into(),
            device_name: "phone".into(),
            is_master_device: true,
            long_term_curve_pub: "pub".into(),
            signing_pub: "pub".into(),
            mlkem_pub: "pub".into(),
            one_time_curve_pub: None,
            ratchet_state_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_identity(&row).await.expect("insert first identity");

        let mut conflicting = row.clone();
        conflicting.id = Uuid::new_v4().to_string();
        let err = store.put_identity(&conflicting).await.unwrap_err();
        assert!(matches!(err, crate::error::StoreError::DuplicateIdentity { .. }));

        cleanup(&db_path);
    }
}
