use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::{
    sync::{Notify, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    chunk::{Chunk, ChunkUploadFailure, UploadOutcome, UploadStatus},
    control::SessionId,
    logging::{Category, category},
    worker::Dispatcher,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitError {
    EmptyChunk,
    Closed,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::EmptyChunk => write!(f, "empty chunks are not uploaded"),
            SubmitError::Closed => write!(f, "coordinator no longer accepts chunks"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Resolves to the outcome of one submitted chunk.
#[derive(Debug)]
pub struct Completion {
    sequence: u64,
    receiver: oneshot::Receiver<UploadOutcome>,
}

impl Completion {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Future for Completion {
    type Output = UploadOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sequence = self.sequence;
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| UploadOutcome::failed(sequence, "coordinator dropped"))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSummary {
    pub submitted: u64,
    pub confirmed: u64,
    /// Ordered by sequence.
    pub failures: Vec<ChunkUploadFailure>,
}

impl UploadSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.confirmed == self.submitted
    }

    pub fn into_result(self) -> Result<u64, ChunkUploadFailure> {
        match self.failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(self.confirmed),
        }
    }
}

/// Numbers chunks, dispatches them and matches outcomes back by sequence.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    session: Option<SessionId>,
    dispatcher: Dispatcher,
    state: Mutex<CoordinatorState>,
    settled: Notify,
}

#[derive(Default)]
struct CoordinatorState {
    next_sequence: u64,
    pending: HashMap<u64, oneshot::Sender<UploadOutcome>>,
    confirmed: u64,
    failures: BTreeMap<u64, String>,
    closed: bool,
}

impl CoordinatorState {
    fn summary(&self) -> UploadSummary {
        UploadSummary {
            submitted: self.next_sequence,
            confirmed: self.confirmed,
            failures: self
                .failures
                .iter()
                .map(|(sequence, reason)| ChunkUploadFailure {
                    sequence: *sequence,
                    reason: reason.clone(),
                })
                .collect(),
        }
    }

    fn record(&mut self, outcome: &UploadOutcome) {
        match &outcome.status {
            UploadStatus::Success(_) => self.confirmed += 1,
            UploadStatus::Failure(reason) => {
                self.failures.insert(outcome.sequence, reason.clone());
            }
        }
    }
}

impl UploadCoordinator {
    pub fn new(session: Option<SessionId>, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                session,
                dispatcher,
                state: Mutex::new(CoordinatorState::default()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.inner.session.as_ref()
    }

    /// Number of sequences handed out so far.
    pub fn submitted(&self) -> u64 {
        self.lock().next_sequence
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Assigns the next sequence and dispatches the chunk without waiting
    /// for the upload. Empty payloads consume no sequence.
    pub fn submit(&self, payload: Bytes) -> Result<Completion, SubmitError> {
        if payload.is_empty() {
            return Err(SubmitError::EmptyChunk);
        }

        let (sender, receiver) = oneshot::channel();
        let sequence = {
            let mut state = self.lock();
            if state.closed {
                return Err(SubmitError::Closed);
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.pending.insert(sequence, sender);
            sequence
        };

        let chunk = Chunk {
            session: self.inner.session.clone(),
            sequence,
            payload,
        };
        debug!(
            "{} dispatching part={sequence} bytes={}",
            category(Category::Upload),
            chunk.size()
        );
        if let Err(chunk) = self.inner.dispatcher.post(chunk) {
            self.resolve(UploadOutcome::failed(chunk.sequence, "upload context closed"));
        }
        Ok(Completion { sequence, receiver })
    }

    /// Fulfils the completion for `outcome.sequence`. Unknown or already
    /// resolved sequences are ignored and return `false`.
    pub fn resolve(&self, outcome: UploadOutcome) -> bool {
        let sender = {
            let mut state = self.lock();
            let Some(sender) = state.pending.remove(&outcome.sequence) else {
                return false;
            };
            state.record(&outcome);
            if state.pending.is_empty() {
                self.inner.settled.notify_waiters();
            }
            sender
        };
        let _ = sender.send(outcome);
        true
    }

    /// Resolves every outstanding sequence as failed. Returns how many were.
    pub fn fail_pending(&self, reason: &str) -> usize {
        let drained = {
            let mut state = self.lock();
            let drained = state.pending.drain().collect::<Vec<_>>();
            for (sequence, _) in &drained {
                state.failures.insert(*sequence, reason.to_string());
            }
            self.inner.settled.notify_waiters();
            drained
        };
        let count = drained.len();
        for (sequence, sender) in drained {
            let _ = sender.send(UploadOutcome::failed(sequence, reason));
        }
        count
    }

    /// Drains the context's outcome channel. When the channel closes early,
    /// whatever is still pending is failed so `await_all` cannot hang.
    pub fn spawn_resolver(
        &self,
        mut outcomes: mpsc::UnboundedReceiver<UploadOutcome>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(outcome) = outcomes.recv().await {
                let sequence = outcome.sequence;
                if !coordinator.resolve(outcome) {
                    debug!("ignoring outcome for unknown part={sequence}");
                }
            }
            let abandoned = coordinator.fail_pending("upload context closed before reporting");
            if abandoned > 0 {
                warn!(
                    "{} {abandoned} chunk(s) never reported an outcome",
                    category(Category::Upload)
                );
            }
        })
    }

    /// Stops accepting chunks and waits until every submitted sequence has
    /// resolved.
    pub async fn await_all(&self) -> UploadSummary {
        self.lock().closed = true;
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            {
                let state = self.lock();
                if state.pending.is_empty() {
                    return state.summary();
                }
            }
            settled.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.inner
            .state
            .lock()
            .expect("coordinator state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn coordinator() -> (UploadCoordinator, mpsc::UnboundedReceiver<Chunk>) {
        let (jobs, received) = mpsc::unbounded_channel();
        let session = "6f1c2f0e-8a4b-4c1e-9a57-0d7c1bfa2c11"
            .parse::<SessionId>()
            .ok();
        (UploadCoordinator::new(session, Dispatcher::new(jobs)), received)
    }

    fn success(sequence: u64) -> UploadOutcome {
        UploadOutcome {
            sequence,
            status: UploadStatus::Success(200),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn sequences_are_gap_free_and_skip_empty_payloads() {
        let (coordinator, mut jobs) = coordinator();
        let mut sequences = Vec::new();
        for payload in [&b"aaaaaaaaaa"[..], b"", b"bbbbbbbbbbbbbbbbbbbb", b"c"] {
            match coordinator.submit(Bytes::from_static(payload)) {
                Ok(completion) => sequences.push(completion.sequence()),
                Err(err) => assert_eq!(err, SubmitError::EmptyChunk),
            }
        }
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(coordinator.submitted(), 3);

        let mut dispatched = Vec::new();
        while let Ok(chunk) = jobs.try_recv() {
            assert!(chunk.size() > 0);
            assert_eq!(
                chunk.session.as_ref().map(SessionId::as_str),
                Some("6f1c2f0e-8a4b-4c1e-9a57-0d7c1bfa2c11")
            );
            dispatched.push(chunk.sequence);
        }
        assert_eq!(dispatched, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn out_of_order_outcomes_reach_their_own_completion() {
        let (coordinator, _jobs) = coordinator();
        let first = coordinator.submit(Bytes::from_static(b"0")).expect("submit 0");
        let second = coordinator.submit(Bytes::from_static(b"1")).expect("submit 1");
        let third = coordinator.submit(Bytes::from_static(b"2")).expect("submit 2");

        assert!(coordinator.resolve(UploadOutcome::failed(2, "boom")));
        assert!(coordinator.resolve(success(0)));
        assert!(coordinator.resolve(success(1)));

        assert_eq!(first.await, success(0));
        assert_eq!(second.await, success(1));
        let third = third.await;
        assert_eq!(third.sequence, 2);
        assert_eq!(third.status, UploadStatus::Failure("boom".to_string()));
    }

    #[tokio::test]
    async fn resolve_is_single_shot() {
        let (coordinator, _jobs) = coordinator();
        let _completion = coordinator.submit(Bytes::from_static(b"x")).expect("submit");
        assert!(coordinator.resolve(success(0)));
        assert!(!coordinator.resolve(UploadOutcome::failed(0, "late duplicate")));
        assert!(!coordinator.resolve(success(99)));

        let summary = coordinator.await_all().await;
        assert_eq!(summary.confirmed, 1);
        assert!(summary.failures.is_empty());
    }

    #[tokio::test]
    async fn await_all_waits_for_every_sequence() {
        let (coordinator, _jobs) = coordinator();
        for payload in [&b"a"[..], b"b", b"c"] {
            coordinator.submit(Bytes::from_static(payload)).expect("submit");
        }

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.await_all().await })
        };
        coordinator.resolve(success(1));
        coordinator.resolve(UploadOutcome::failed(0, "refused"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "one sequence is still outstanding");

        coordinator.resolve(success(2));
        let summary = waiter.await.expect("waiter should join");
        assert_eq!(summary.submitted, 3);
        assert_eq!(summary.confirmed, 2);
        assert_eq!(
            summary.clone().into_result(),
            Err(ChunkUploadFailure {
                sequence: 0,
                reason: "refused".to_string()
            })
        );
        assert!(!summary.is_complete());
    }

    #[tokio::test]
    async fn submit_after_await_all_is_refused() {
        let (coordinator, _jobs) = coordinator();
        let summary = coordinator.await_all().await;
        assert_eq!(summary.into_result(), Ok(0));
        assert_eq!(
            coordinator.submit(Bytes::from_static(b"late")).err(),
            Some(SubmitError::Closed)
        );
    }

    #[tokio::test]
    async fn closed_outcome_channel_fails_the_rest() {
        let (coordinator, _jobs) = coordinator();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let resolver = coordinator.spawn_resolver(outcomes_rx);

        let first = coordinator.submit(Bytes::from_static(b"a")).expect("submit");
        let second = coordinator.submit(Bytes::from_static(b"b")).expect("submit");
        outcomes_tx.send(success(0)).expect("resolver should be listening");
        drop(outcomes_tx);
        resolver.await.expect("resolver should finish");

        assert!(first.await.is_success());
        assert!(!second.await.is_success());
        let summary = coordinator.await_all().await;
        assert_eq!(summary.confirmed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].sequence, 1);
    }

    #[tokio::test]
    async fn dispatch_to_closed_context_is_still_accounted_for() {
        let (coordinator, jobs) = coordinator();
        drop(jobs);
        let completion = coordinator.submit(Bytes::from_static(b"a")).expect("submit");
        let outcome = completion.await;
        assert_eq!(outcome.attempts, 0);
        assert!(!outcome.is_success());
        assert_eq!(coordinator.pending(), 0);
    }
}
