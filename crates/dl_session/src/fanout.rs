//! `FanOut` (§4.8) — resolves a `Recipient` into one job per destination
//! device, all sharing one `sharedId` but each device queue getting its
//! own monotonic `sequenceId`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dl_proto::communication::BaseCommunication;
use dl_proto::message::Recipient;
use dl_store::Store;
use uuid::Uuid;

use crate::cache::{Cache, IdentityHandle};
use crate::error::SessionError;
use crate::identity_registry::IdentityRegistry;
use crate::session_context::SessionUser;
use crate::transport::Transport;

/// One destination: the device to encrypt towards, plus the ordering
/// counter its queue must enforce.
#[derive(Debug, Clone)]
pub struct FanOutTarget {
    pub identity_id: Uuid,
    pub secret_name: String,
    pub device_id: Uuid,
    pub shared_id: Uuid,
    pub sequence_id: u64,
}

/// Issues monotonically increasing `sequenceId`s per `communicationId`, as
/// required by §4.7/§4.8 (FanOut owns the counter; TaskProcessor just
/// enforces ordering on what it's handed).
#[derive(Default)]
pub struct SequenceCounters {
    counters: std::sync::Mutex<HashMap<Uuid, Arc<AtomicU64>>>,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, communication_id: Uuid) -> u64 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(communication_id).or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct FanOut<S: Store, T: Transport> {
    cache: Arc<Cache<S>>,
    registry: Arc<IdentityRegistry<S, T>>,
    sequence_counters: SequenceCounters,
}

impl<S: Store, T: Transport> FanOut<S, T> {
    pub fn new(cache: Arc<Cache<S>>, registry: Arc<IdentityRegistry<S, T>>) -> Self {
        Self { cache, registry, sequence_counters: SequenceCounters::new() }
    }

    /// Next ordering counter for an out-of-band send not tied to a
    /// `BaseCommunication` (e.g. a control frame), keyed directly by
    /// destination identity so it never collides with a channel's own
    /// counter namespace.
    pub fn next_control_sequence(&self, identity_id: Uuid) -> u64 {
        self.sequence_counters.next(identity_id)
    }

    /// Map a `BaseCommunication` member id to the account `secret_name`(s)
    /// it resolves to via the local contact roster (`ContactRow`). A
    /// channel member whose id is the local account itself, or who has no
    /// contact row yet (never messaged directly), resolves to nothing
    /// rather than erroring — fan-out simply skips an unreachable member.
    async fn resolve_member_secret_name(&self, member: Uuid) -> Result<Vec<String>, SessionError> {
        Ok(self
            .cache
            .store()
            .get_contact(member)
            .await?
            .map(|contact| contact.contact_secret_name)
            .into_iter()
            .collect())
    }

    /// Resolve `recipient` into fan-out targets for `local`. A
    /// `personalMessage` fans to the local user's other devices; a
    /// `nickname(N)` fans to all of N's verified devices; a `channel(C)`
    /// fans to every member's every device, skipping blocked members.
    pub async fn resolve(
        &self,
        local: &SessionUser,
        recipient: &Recipient,
        communication: Option<&BaseCommunication>,
    ) -> Result<Vec<FanOutTarget>, SessionError> {
        let shared_id = Uuid::new_v4();
        let communication_id = communication.map(|c| c.id).unwrap_or(shared_id);

        let handles: Vec<IdentityHandle> = match recipient {
            Recipient::PersonalMessage => {
                let mut handles = self.registry.refresh(&local.secret_name, false).await?;
                handles.retain(|h| h.device_id != local.device_id);
                handles
            }
            Recipient::Nickname { secret_name } => self.registry.refresh(secret_name, false).await?,
            Recipient::Channel { name } => {
                let communication = communication
                    .ok_or_else(|| SessionError::ConfigurationError(format!("no communication loaded for channel {name}")))?;
                let mut handles = Vec::new();
                for member in communication.deliverable_members() {
                    if *member == local.device_id {
                        continue;
                    }
                    for secret_name in self.resolve_member_secret_name(*member).await? {
                        handles.extend(self.registry.refresh(&secret_name, false).await?);
                    }
                }
                handles
            }
            Recipient::Broadcast => {
                let mut handles = Vec::new();
                for contact in self.cache.store().get_contacts_for_owner(&local.secret_name).await? {
                    handles.extend(self.registry.refresh(&contact.contact_secret_name, false).await?);
                }
                handles
            }
        };

        Ok(handles
            .into_iter()
            .map(|handle| FanOutTarget {
                identity_id: handle.id,
                secret_name: handle.secret_name,
                device_id: handle.device_id,
                shared_id,
                sequence_id: self.sequence_counters.next(communication_id),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_registry::IdentityRegistry;
    use crate::testutil::{InMemoryStore, StaticTransport};
    use dl_crypto::identity::{generate_device_bundle, SigningKeyPair};
    use dl_proto::communication::CommunicationKind;
    use dl_store::models::ContactRow;
    use dl_store::{Store, Vault};

    #[test]
    fn sequence_counters_are_monotonic_per_communication() {
        let counters = SequenceCounters::new();
        let comm_a = Uuid::new_v4();
        let comm_b = Uuid::new_v4();
        assert_eq!(counters.next(comm_a), 0);
        assert_eq!(counters.next(comm_a), 1);
        assert_eq!(counters.next(comm_b), 0);
        assert_eq!(counters.next(comm_a), 2);
    }

    fn make_local() -> SessionUser {
        let account_signing = SigningKeyPair::generate();
        let device_id = Uuid::new_v4();
        let (device_keys, _config) =
            generate_device_bundle(device_id, "ann-laptop", true, &account_signing, 3, 7);
        SessionUser {
            secret_name: "ann".into(),
            device_id,
            device_name: "laptop".into(),
            is_master_device: true,
            account_signing,
            device_keys,
        }
    }

    async fn make_fanout() -> (FanOut<InMemoryStore, StaticTransport>, Arc<StaticTransport>) {
        let store = InMemoryStore::new();
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await.unwrap();
        let cache = Arc::new(Cache::new(store, vault));
        let transport = Arc::new(StaticTransport::new());
        let registry = Arc::new(IdentityRegistry::new(cache.clone(), transport.clone(), Uuid::new_v4()));
        (FanOut::new(cache, registry), transport)
    }

    async fn publish_member(transport: &StaticTransport, secret_name: &str) -> Uuid {
        let account_signing = SigningKeyPair::generate();
        let device_id = Uuid::new_v4();
        let (_device_keys, config) =
            generate_device_bundle(device_id, &format!("{secret_name}-phone"), true, &account_signing, 3, 7);
        transport.publish(secret_name, config);
        device_id
    }

    #[tokio::test]
    async fn channel_fans_out_to_each_member_exactly_once() {
        let (fanout, transport) = make_fanout().await;
        let local = make_local();

        publish_member(&transport, "bob").await;
        publish_member(&transport, "joe").await;

        let bob_member_id = Uuid::new_v4();
        let joe_member_id = Uuid::new_v4();
        fanout
            .cache
            .store()
            .put_contact(&ContactRow {
                id: bob_member_id.to_string(),
                owner_secret_name: local.secret_name.clone(),
                contact_secret_name: "bob".into(),
                display_name: None,
                identity_pubkey: String::new(),
                verified_fingerprint: None,
                key_change_pending: false,
                added_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        fanout
            .cache
            .store()
            .put_contact(&ContactRow {
                id: joe_member_id.to_string(),
                owner_secret_name: local.secret_name.clone(),
                contact_secret_name: "joe".into(),
                display_name: None,
                identity_pubkey: String::new(),
                verified_fingerprint: None,
                key_change_pending: false,
                added_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let communication = BaseCommunication::new_channel(
            Uuid::new_v4(),
            "team".into(),
            local.device_id,
            std::collections::HashSet::from([local.device_id]),
            std::collections::HashSet::from([local.device_id, bob_member_id, joe_member_id]),
        )
        .unwrap();
        assert_eq!(communication.kind, CommunicationKind::Channel);

        let targets = fanout
            .resolve(&local, &Recipient::Channel { name: "team".into() }, Some(&communication))
            .await
            .unwrap();

        let mut secret_names: Vec<_> = targets.iter().map(|t| t.secret_name.clone()).collect();
        secret_names.sort();
        assert_eq!(secret_names, vec!["bob".to_string(), "joe".to_string()]);
        assert_eq!(targets.len(), 2, "each member device should receive exactly one job");
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_contact() {
        let (fanout, transport) = make_fanout().await;
        let local = make_local();

        publish_member(&transport, "bob").await;
        publish_member(&transport, "joe").await;

        fanout
            .cache
            .store()
            .put_contact(&ContactRow {
                id: Uuid::new_v4().to_string(),
                owner_secret_name: local.secret_name.clone(),
                contact_secret_name: "bob".into(),
                display_name: None,
                identity_pubkey: String::new(),
                verified_fingerprint: None,
                key_change_pending: false,
                added_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        fanout
            .cache
            .store()
            .put_contact(&ContactRow {
                id: Uuid::new_v4().to_string(),
                owner_secret_name: local.secret_name.clone(),
                contact_secret_name: "joe".into(),
                display_name: None,
                identity_pubkey: String::new(),
                verified_fingerprint: None,
                key_change_pending: false,
                added_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let targets = fanout.resolve(&local, &Recipient::Broadcast, None).await.unwrap();
        let mut secret_names: Vec<_> = targets.iter().map(|t| t.secret_name.clone()).collect();
        secret_names.sort();
        assert_eq!(secret_names, vec!["bob".to_string(), "joe".to_string()]);
    }
}
