//! In-memory `Store` double so the engine and its tests never need a real
//! SQLite file. Mirrors `dl_store::SqliteStore`'s semantics (uniqueness,
//! ascending job order) without touching disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

use dl_crypto::identity::{SignedOneTimeKey, UserConfiguration};
use dl_proto::communication::OneTimeKeyKind;

use dl_store::models::{
    CommunicationRow, ContactRow, DeviceSaltRow, JobRow, MediaJobRow, MessageRow,
    SessionContextRow, SessionIdentityRow,
};
use dl_store::{Store, StoreError};

use crate::error::TransportError;
use crate::transport::{OneTimeKeys, RotatedKeys, Transport};

#[derive(Default)]
struct Tables {
    session_context: HashMap<String, SessionContextRow>,
    device_salt: HashMap<String, DeviceSaltRow>,
    identities: HashMap<Uuid, SessionIdentityRow>,
    contacts: HashMap<Uuid, ContactRow>,
    communications: HashMap<Uuid, CommunicationRow>,
    messages: Vec<MessageRow>,
    jobs: Vec<JobRow>,
    media_jobs: Vec<MediaJobRow>,
}

/// A single-process `Store` backed by in-memory maps behind a mutex.
/// Good enough to drive two `SessionEngine`s against each other in a test;
/// not shared across OS processes.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    async fn get_session_context(
        &self,
        device_id: &str,
    ) -> Result<Option<SessionContextRow>, StoreError> {
        Ok(self.tables.lock().unwrap().session_context.get(device_id).cloned())
    }

    async fn put_session_context(&self, row: &SessionContextRow) -> Result<(), StoreError> {
        self.tables
            .lock()
            .unwrap()
            .session_context
            .insert(row.device_id.clone(), row.clone());
        Ok(())
    }

    async fn get_device_salt(&self, device_id: &str) -> Result<Option<DeviceSaltRow>, StoreError> {
        Ok(self.tables.lock().unwrap().device_salt.get(device_id).cloned())
    }

    async fn put_device_salt(&self, row: &DeviceSaltRow) -> Result<(), StoreError> {
        self.tables.lock().unwrap().device_salt.insert(row.device_id.clone(), row.clone());
        Ok(())
    }

    async fn get_identity(&self, id: Uuid) -> Result<Option<SessionIdentityRow>, StoreError> {
        Ok(self.tables.lock().unwrap().identities.get(&id).cloned())
    }

    async fn get_identities_for_secret_name(
        &self,
        secret_name: &str,
    ) -> Result<Vec<SessionIdentityRow>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .identities
            .values()
            .filter(|row| row.secret_name == secret_name)
            .cloned()
            .collect())
    }

    async fn put_identity(&self, row: &SessionIdentityRow) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let id: Uuid = row.id.parse().expect("identity row id is a valid uuid");
        let conflict = tables.identities.values().any(|existing| {
            existing.secret_name == row.secret_name
                && existing.device_id == row.device_id
                && existing.id != row.id
        });
        if conflict {
            return Err(StoreError::DuplicateIdentity {
                secret_name: row.secret_name.clone(),
                device_id: row.device_id.clone(),
            });
        }
        tables.identities.insert(id, row.clone());
        Ok(())
    }

    async fn delete_identity(&self, id: Uuid) -> Result<(), StoreError> {
        self.tables.lock().unwrap().identities.remove(&id);
        Ok(())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactRow>, StoreError> {
        Ok(self.tables.lock().unwrap().contacts.get(&id).cloned())
    }

    async fn get_contacts_for_owner(
        &self,
        owner_secret_name: &str,
    ) -> Result<Vec<ContactRow>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .contacts
            .values()
            .filter(|row| row.owner_secret_name == owner_secret_name)
            .cloned()
            .collect())
    }

    async fn put_contact(&self, row: &ContactRow) -> Result<(), StoreError> {
        let id: Uuid = row.id.parse().expect("contact row id is a valid uuid");
        self.tables.lock().unwrap().contacts.insert(id, row.clone());
        Ok(())
    }

    async fn get_communication(&self, id: Uuid) -> Result<Option<CommunicationRow>, StoreError> {
        Ok(self.tables.lock().unwrap().communications.get(&id).cloned())
    }

    async fn put_communication(&self, row: &CommunicationRow) -> Result<(), StoreError> {
        let id: Uuid = row.id.parse().expect("communication row id is a valid uuid");
        self.tables.lock().unwrap().communications.insert(id, row.clone());
        Ok(())
    }

    async fn put_message(&self, row: &MessageRow) -> Result<(), StoreError> {
        self.tables.lock().unwrap().messages.push(row.clone());
        Ok(())
    }

    async fn stream_messages(&self, shared_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let mut rows: Vec<MessageRow> = self
            .tables
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|row| row.shared_id == shared_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn message_count(&self, shared_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|row| row.shared_id == shared_id)
            .count() as u64)
    }

    async fn put_job(&self, row: &JobRow) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let pos = tables
            .jobs
            .iter()
            .position(|existing| {
                existing.communication_id == row.communication_id
                    && existing.sequence_id > row.sequence_id
            })
            .unwrap_or(tables.jobs.len());
        tables.jobs.insert(pos, row.clone());
        Ok(())
    }

    async fn next_job(&self, communication_id: &str) -> Result<Option<JobRow>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|row| row.communication_id == communication_id)
            .min_by_key(|row| row.sequence_id)
            .cloned())
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().jobs.retain(|row| row.id != id);
        Ok(())
    }

    async fn put_media_job(&self, row: &MediaJobRow) -> Result<(), StoreError> {
        self.tables.lock().unwrap().media_jobs.push(row.clone());
        Ok(())
    }

    async fn media_jobs_for_job(&self, job_id: &str) -> Result<Vec<MediaJobRow>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .media_jobs
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect())
    }
}

/// In-memory `Transport` double holding at most one published
/// `UserConfiguration` per `secret_name`, with no actual network I/O.
/// `fail_next_fetch` makes the next `fetch_user_configuration` call error,
/// to exercise callers that must not hit the transport when cached.
pub struct StaticTransport {
    configurations: Mutex<HashMap<String, UserConfiguration>>,
    one_time_keys: Mutex<HashMap<(String, Uuid), OneTimeKeys>>,
    fail_next_fetch: AtomicBool,
    sent: Mutex<Vec<dl_proto::envelope::Envelope>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self {
            configurations: Mutex::new(HashMap::new()),
            one_time_keys: Mutex::new(HashMap::new()),
            fail_next_fetch: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_configuration(secret_name: &str, config: UserConfiguration) -> Self {
        let transport = Self::new();
        transport.configurations.lock().unwrap().insert(secret_name.to_string(), config);
        transport
    }

    pub fn publish(&self, secret_name: &str, config: UserConfiguration) {
        self.configurations.lock().unwrap().insert(secret_name.to_string(), config);
    }

    pub fn set_one_time_keys(&self, secret_name: &str, device_id: Uuid, keys: OneTimeKeys) {
        self.one_time_keys.lock().unwrap().insert((secret_name.to_string(), device_id), keys);
    }

    pub fn fail_next_fetch(&self) {
        self.fail_next_fetch.store(true, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<dl_proto::envelope::Envelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for StaticTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for StaticTransport {
    async fn send_message(
        &self,
        envelope: &dl_proto::envelope::Envelope,
        _metadata: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    async fn fetch_user_configuration(&self, secret_name: &str) -> Result<UserConfiguration, TransportError> {
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Failed("injected test failure".into()));
        }
        self.configurations
            .lock()
            .unwrap()
            .get(secret_name)
            .cloned()
            .ok_or_else(|| TransportError::Failed(format!("no configuration published for {secret_name}")))
    }

    async fn fetch_one_time_keys(&self, secret_name: &str, device_id: Uuid) -> Result<OneTimeKeys, TransportError> {
        Ok(self
            .one_time_keys
            .lock()
            .unwrap()
            .get(&(secret_name.to_string(), device_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_one_time_key_identities(
        &self,
        secret_name: &str,
        device_id: Uuid,
        kind: OneTimeKeyKind,
    ) -> Result<Vec<Uuid>, TransportError> {
        let keys = self.fetch_one_time_keys(secret_name, device_id).await?;
        Ok(match kind {
            OneTimeKeyKind::Curve => keys.curve.map(|k| k.id).into_iter().collect(),
            OneTimeKeyKind::MlKem => keys.mlkem.map(|k| k.id).into_iter().collect(),
        })
    }

    async fn publish_user_configuration(
        &self,
        _config: &UserConfiguration,
        _recipient_device_id: Uuid,
    ) -> Result<(), TransportError> {
        // This double keeps configurations keyed by secret_name, which the
        // wire payload does not carry; tests call `publish` directly.
        Ok(())
    }

    async fn publish_rotated_keys(
        &self,
        secret_name: &str,
        _device_id: Uuid,
        rotated: &RotatedKeys,
    ) -> Result<(), TransportError> {
        self.configurations.lock().unwrap().insert(secret_name.to_string(), rotated.configuration.clone());
        Ok(())
    }

    async fn update_one_time_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        keys: Vec<SignedOneTimeKey>,
    ) -> Result<(), TransportError> {
        let mut guard = self.one_time_keys.lock().unwrap();
        let entry = guard.entry((secret_name.to_string(), device_id)).or_default();
        entry.curve = keys.into_iter().next();
        Ok(())
    }

    async fn update_one_time_mlkem_keys(
        &self,
        secret_name: &str,
        device_id: Uuid,
        keys: Vec<SignedOneTimeKey>,
    ) -> Result<(), TransportError> {
        let mut guard = self.one_time_keys.lock().unwrap();
        let entry = guard.entry((secret_name.to_string(), device_id)).or_default();
        entry.mlkem = keys.into_iter().next();
        Ok(())
    }

    async fn batch_delete_one_time_keys(
        &self,
        _secret_name: &str,
        _device_id: Uuid,
        _kind: OneTimeKeyKind,
        _ids: Vec<Uuid>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// In-memory `EventReceiver` double recording every callback invocation,
/// for assertions in engine-level tests.
#[derive(Default)]
pub struct RecordingEventReceiver {
    events: Mutex<Vec<String>>,
}

impl RecordingEventReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl crate::event_receiver::EventReceiver for RecordingEventReceiver {
    fn created_message(&self, message: &MessageRow) {
        self.record(format!("created_message:{}", message.id));
    }

    fn updated_message(&self, message: &MessageRow) {
        self.record(format!("updated_message:{}", message.id));
    }

    fn deleted_message(&self, id: Uuid) {
        self.record(format!("deleted_message:{id}"));
    }

    fn created_contact(&self, contact: &ContactRow) {
        self.record(format!("created_contact:{}", contact.id));
    }

    fn updated_contact(&self, contact: &ContactRow) {
        self.record(format!("updated_contact:{}", contact.id));
    }

    fn removed_contact(&self, id: Uuid) {
        self.record(format!("removed_contact:{id}"));
    }

    fn created_channel(&self, communication: &dl_proto::communication::BaseCommunication) {
        self.record(format!("created_channel:{}", communication.id));
    }

    fn updated_communication(
        &self,
        communication: &dl_proto::communication::BaseCommunication,
        members: &[Uuid],
    ) {
        self.record(format!("updated_communication:{}:{}", communication.id, members.len()));
    }

    fn removed_communication(&self, id: Uuid) {
        self.record(format!("removed_communication:{id}"));
    }

    fn synchronize(&self, contact: &ContactRow, request_friendship: bool) {
        self.record(format!("synchronize:{}:{}", contact.id, request_friendship));
    }

    fn contact_metadata_changed(&self, contact: &ContactRow) {
        self.record(format!("contact_metadata_changed:{}", contact.id));
    }
}
