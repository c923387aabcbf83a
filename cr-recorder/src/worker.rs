use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    chunk::{Chunk, UploadOutcome},
    gate::{LocalResource, ResourceGateRejection},
    logging::{Category, category},
    transport::TransportClient,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// A dedicated worker task holding an admitted resource.
    Worker,
    /// One task per upload without a resource, used when the gate rejected
    /// the worker.
    Inline,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Worker => f.write_str("worker"),
            TransportMode::Inline => f.write_str("inline"),
        }
    }
}

/// Hands chunks to an [`UploadContext`]. Posting never waits for the upload.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    jobs: mpsc::UnboundedSender<Chunk>,
    closed: Arc<AtomicBool>,
}

impl Dispatcher {
    pub(crate) fn new(jobs: mpsc::UnboundedSender<Chunk>) -> Self {
        Self {
            jobs,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Gives the chunk back when the context is gone.
    pub fn post(&self, chunk: Chunk) -> Result<(), Chunk> {
        if self.closed.load(Ordering::Acquire) {
            return Err(chunk);
        }
        self.jobs.send(chunk).map_err(|err| err.0)
    }
}

/// Owns the upload transport for one recording session.
pub struct UploadContext {
    dispatcher: Dispatcher,
    task: JoinHandle<()>,
    resource: Option<LocalResource>,
    mode: TransportMode,
    terminated: bool,
}

impl UploadContext {
    /// Starts the context. An admitted resource runs the worker; a rejection
    /// falls back to inline uploads.
    pub fn spawn(
        transport: TransportClient,
        admission: Result<LocalResource, ResourceGateRejection>,
    ) -> (Self, mpsc::UnboundedReceiver<UploadOutcome>) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let (mode, resource, task) = match admission {
            Ok(resource) => {
                info!(
                    "{} upload worker started with resource {}",
                    category(Category::Gate),
                    resource.handle()
                );
                let task = tokio::spawn(run_worker(
                    transport,
                    jobs_rx,
                    outcomes_tx,
                    resource.clone(),
                ));
                (TransportMode::Worker, Some(resource), task)
            }
            Err(rejection) => {
                warn!(
                    "{} {rejection}; uploading inline",
                    category(Category::Gate)
                );
                let task = tokio::spawn(run_inline(transport, jobs_rx, outcomes_tx));
                (TransportMode::Inline, None, task)
            }
        };

        let context = Self {
            dispatcher: Dispatcher::new(jobs_tx),
            task,
            resource,
            mode,
            terminated: false,
        };
        (context, outcomes_rx)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn resource(&self) -> Option<&LocalResource> {
        self.resource.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Closes the job channel, stops the task and revokes the resource.
    /// Returns `true` only for the call that released them.
    pub fn terminate(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        self.dispatcher.closed.store(true, Ordering::Release);
        self.task.abort();
        if let Some(resource) = &self.resource {
            resource.revoke();
        }
        debug!("{} upload context terminated ({})", category(Category::Upload), self.mode);
        true
    }
}

impl Drop for UploadContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn run_worker(
    transport: TransportClient,
    jobs: mpsc::UnboundedReceiver<Chunk>,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
    resource: LocalResource,
) {
    run_uploads(transport, jobs, outcomes, Some(resource)).await;
}

async fn run_inline(
    transport: TransportClient,
    jobs: mpsc::UnboundedReceiver<Chunk>,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
) {
    run_uploads(transport, jobs, outcomes, None).await;
}

/// Uploads run inside a `JoinSet` owned by this task, so aborting the task
/// cancels every upload still in flight.
async fn run_uploads(
    transport: TransportClient,
    mut jobs: mpsc::UnboundedReceiver<Chunk>,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
    resource: Option<LocalResource>,
) {
    let mut uploads = JoinSet::new();
    let mut in_flight = HashMap::new();
    let mut accepting = true;

    while accepting || !uploads.is_empty() {
        tokio::select! {
            job = jobs.recv(), if accepting => match job {
                Some(chunk) if resource.as_ref().is_some_and(LocalResource::is_revoked) => {
                    let _ = outcomes.send(UploadOutcome::failed(
                        chunk.sequence,
                        "worker resource revoked",
                    ));
                }
                Some(chunk) => {
                    let sequence = chunk.sequence;
                    let transport = transport.clone();
                    let handle = uploads.spawn(async move { transport.upload(&chunk).await });
                    in_flight.insert(handle.id(), sequence);
                }
                None => accepting = false,
            },
            Some(joined) = uploads.join_next_with_id() => {
                let outcome = match joined {
                    Ok((id, outcome)) => {
                        in_flight.remove(&id);
                        outcome
                    }
                    Err(err) => match in_flight.remove(&err.id()) {
                        Some(sequence) => {
                            UploadOutcome::failed(sequence, format!("upload task failed: {err}"))
                        }
                        None => continue,
                    },
                };
                if outcomes.send(outcome).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{
        gate::{GateMode, ResourceGate},
        transport::RetryPolicy,
    };

    fn unreachable_transport() -> TransportClient {
        let port = {
            let listener =
                std::net::TcpListener::bind("127.0.0.1:0").expect("listener should bind");
            listener.local_addr().expect("listener should have addr").port()
        };
        TransportClient::new(
            format!("http://127.0.0.1:{port}"),
            Some(Duration::from_secs(2)),
            RetryPolicy::default(),
        )
    }

    /// Accepts the upload connection and never answers it.
    async fn stalled_transport() -> (TransportClient, tokio::net::TcpListener) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have addr");
        let transport = TransportClient::new(format!("http://{addr}"), None, RetryPolicy::default());
        (transport, listener)
    }

    /// Posts one chunk, terminates while its upload is in flight and reports
    /// whether the server side saw the connection close.
    async fn connection_closes_on_terminate(
        admission: impl FnOnce(&mut ResourceGate) -> Result<LocalResource, ResourceGateRejection>,
        expected_mode: TransportMode,
    ) -> bool {
        let (transport, listener) = stalled_transport().await;
        let mut gate = ResourceGate::new(GateMode::Enforced);
        let (mut context, _outcomes) = UploadContext::spawn(transport, admission(&mut gate));
        assert_eq!(context.mode(), expected_mode);
        context
            .dispatcher()
            .post(chunk(0))
            .expect("post should succeed");

        let (mut socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("upload should connect")
            .expect("accept should succeed");
        assert!(context.terminate());

        let mut buf = [0u8; 1024];
        let closed = async {
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .is_ok()
    }

    fn chunk(sequence: u64) -> Chunk {
        Chunk {
            session: None,
            sequence,
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[tokio::test]
    async fn terminate_releases_once() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        let minted = gate.mint();
        let admission = gate.admit(minted.handle());
        let (mut context, _outcomes) = UploadContext::spawn(unreachable_transport(), admission);
        assert_eq!(context.mode(), TransportMode::Worker);
        let dispatcher = context.dispatcher();

        assert!(context.terminate());
        assert!(!context.terminate());
        assert!(context.is_terminated());
        assert!(minted.is_revoked());

        let returned = dispatcher
            .post(chunk(0))
            .expect_err("terminated context refuses chunks");
        assert_eq!(returned.sequence, 0);
    }

    #[tokio::test]
    async fn drop_revokes_resource() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        let minted = gate.mint();
        let (context, _outcomes) =
            UploadContext::spawn(unreachable_transport(), gate.admit(minted.handle()));
        drop(context);
        assert!(minted.is_revoked());
    }

    #[tokio::test]
    async fn worker_reports_transport_failures_as_outcomes() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        let minted = gate.mint();
        let (context, mut outcomes) =
            UploadContext::spawn(unreachable_transport(), gate.admit(minted.handle()));
        let dispatcher = context.dispatcher();
        dispatcher.post(chunk(0)).expect("post should succeed");
        dispatcher.post(chunk(1)).expect("post should succeed");

        let mut seen = Vec::new();
        for _ in 0..2 {
            let outcome = outcomes.recv().await.expect("outcome should arrive");
            assert!(!outcome.is_success());
            seen.push(outcome.sequence);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn rejected_gate_uploads_inline() {
        let mut gate = ResourceGate::new(GateMode::Enforced);
        gate.mint();
        let admission = gate.admit("https://cdn.example.com/worker.js");
        let (mut context, mut outcomes) = UploadContext::spawn(unreachable_transport(), admission);
        assert_eq!(context.mode(), TransportMode::Inline);
        assert!(context.resource().is_none());

        context
            .dispatcher()
            .post(chunk(4))
            .expect("post should succeed");
        let outcome = outcomes.recv().await.expect("outcome should arrive");
        assert_eq!(outcome.sequence, 4);
        assert!(context.terminate());
    }

    #[tokio::test]
    async fn terminate_cancels_worker_upload_in_flight() {
        let closed = connection_closes_on_terminate(
            |gate| {
                let minted = gate.mint();
                gate.admit(minted.handle())
            },
            TransportMode::Worker,
        )
        .await;
        assert!(closed, "worker upload connection stayed open after terminate");
    }

    #[tokio::test]
    async fn terminate_cancels_inline_upload_in_flight() {
        let closed = connection_closes_on_terminate(
            |gate| {
                gate.mint();
                gate.admit("https://cdn.example.com/worker.js")
            },
            TransportMode::Inline,
        )
        .await;
        assert!(closed, "inline upload connection stayed open after terminate");
    }
}
