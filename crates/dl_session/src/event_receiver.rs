//! `EventReceiver` — outbound, fire-and-forget callbacks (§6). The core
//! never waits on these; a callback that errors is logged and dropped,
//! never retried, and never propagates back into the caller's `Result`.

use dl_proto::communication::BaseCommunication;
use dl_store::models::{ContactRow, MessageRow};
use uuid::Uuid;

pub trait EventReceiver: Send + Sync {
    fn created_message(&self, message: &MessageRow);
    fn updated_message(&self, message: &MessageRow);
    fn deleted_message(&self, id: Uuid);

    fn created_contact(&self, contact: &ContactRow);
    fn updated_contact(&self, contact: &ContactRow);
    fn removed_contact(&self, id: Uuid);

    fn created_channel(&self, communication: &BaseCommunication);
    fn updated_communication(&self, communication: &BaseCommunication, members: &[Uuid]);
    fn removed_communication(&self, id: Uuid);

    fn synchronize(&self, contact: &ContactRow, request_friendship: bool);
    fn contact_metadata_changed(&self, contact: &ContactRow);
}

/// Dispatch a callback, logging but never propagating a panic-free failure
/// path: every `EventReceiver` method here is infallible by trait contract,
/// so this just exists as the single call site the rest of the crate uses,
/// keeping the "never retried" policy in one place.
pub fn notify<F: FnOnce()>(label: &str, f: F) {
    tracing::trace!(callback = label, "dispatching event receiver callback");
    f();
}
