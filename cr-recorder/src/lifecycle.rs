use std::{io, time::Duration};

use bytes::Bytes;
use proto::ArtifactRef;
use tokio::{io::AsyncRead, sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    chunk::ChunkUploadFailure,
    control::{MergeFailure, SessionAcquisitionError, SessionId, acquire_session, request_merge},
    coordinator::{Completion, SubmitError, UploadCoordinator},
    gate::{GateMode, LocalResource, ResourceGate},
    logging::{Category, category},
    producer::ChunkProducer,
    transport::{RetryPolicy, TransportClient},
    worker::{TransportMode, UploadContext},
};

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub server_url: String,
    pub chunk_interval: Duration,
    /// When false no session is requested and the server binds uploads to
    /// its sole active session.
    pub session_aware: bool,
    pub retry: RetryPolicy,
    pub upload_timeout: Option<Duration>,
    pub gate: GateMode,
    /// Resource handle offered to the gate instead of the minted one.
    pub worker_resource: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            server_url: proto::DEFAULT_SERVER_URL.to_string(),
            chunk_interval: Duration::from_millis(proto::DEFAULT_CHUNK_INTERVAL_MS),
            session_aware: true,
            retry: RetryPolicy::default(),
            upload_timeout: None,
            gate: GateMode::Enforced,
            worker_resource: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    AcquiringSession,
    Recording,
    Finalizing,
    Merged,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Merged | SessionPhase::Failed)
    }
}

/// The session a recording runs under. Immutable once acquired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub id: Option<SessionId>,
    pub base_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingReport {
    pub session_id: Option<SessionId>,
    pub produced: u64,
    pub confirmed: u64,
    pub artifact: ArtifactRef,
    pub transport: TransportMode,
}

#[derive(Debug)]
pub enum RecordingError {
    Session(SessionAcquisitionError),
    Capture(io::Error),
    Uploads {
        session_id: Option<SessionId>,
        failures: Vec<ChunkUploadFailure>,
        merge: Result<ArtifactRef, MergeFailure>,
    },
    Merge {
        session_id: Option<SessionId>,
        error: MergeFailure,
    },
    InvalidPhase {
        expected: SessionPhase,
        actual: SessionPhase,
    },
}

impl std::fmt::Display for RecordingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingError::Session(err) => write!(f, "could not start recording: {err}"),
            RecordingError::Capture(err) => write!(f, "capture source failed: {err}"),
            RecordingError::Uploads {
                failures, merge, ..
            } => {
                write!(f, "{} chunk(s) failed to upload", failures.len())?;
                if let Some(first) = failures.first() {
                    write!(f, " (first: {first})")?;
                }
                match merge {
                    Ok(artifact) => write!(f, "; merged {} anyway", artifact.file_name),
                    Err(err) => write!(f, "; {err}"),
                }
            }
            RecordingError::Merge { error, .. } => write!(f, "{error}"),
            RecordingError::InvalidPhase { expected, actual } => {
                write!(f, "recorder is {actual:?}, expected {expected:?}")
            }
        }
    }
}

impl std::error::Error for RecordingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordingError::Session(err) => Some(err),
            RecordingError::Capture(err) => Some(err),
            RecordingError::Merge { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Brackets one recording: acquire a session, accept chunks, then wait for
/// every upload, merge and release the transport.
pub struct SessionLifecycle {
    config: RecorderConfig,
    phase: SessionPhase,
    transport: TransportClient,
    context: Option<SessionContext>,
    uploads: Option<UploadContext>,
    coordinator: Option<UploadCoordinator>,
    resolver: Option<JoinHandle<()>>,
    resource: Option<LocalResource>,
}

impl SessionLifecycle {
    pub fn new(config: RecorderConfig) -> Self {
        let transport = TransportClient::new(
            config.server_url.clone(),
            config.upload_timeout,
            config.retry,
        );
        Self {
            config,
            phase: SessionPhase::Uninitialized,
            transport,
            context: None,
            uploads: None,
            coordinator: None,
            resolver: None,
            resource: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn transport_mode(&self) -> Option<TransportMode> {
        self.uploads.as_ref().map(UploadContext::mode)
    }

    /// The resource minted for the upload worker, admitted or not.
    pub fn resource(&self) -> Option<&LocalResource> {
        self.resource.as_ref()
    }

    pub fn submitted(&self) -> u64 {
        self.coordinator
            .as_ref()
            .map(UploadCoordinator::submitted)
            .unwrap_or(0)
    }

    /// Acquires the session and starts the upload context. A failed
    /// acquisition is terminal and nothing is started.
    pub async fn begin(&mut self) -> Result<&SessionContext, RecordingError> {
        self.expect_phase(SessionPhase::Uninitialized)?;
        self.phase = SessionPhase::AcquiringSession;

        let id = if self.config.session_aware {
            match acquire_session(self.transport.http(), self.transport.base_url()).await {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!("{} {err}", category(Category::Session));
                    self.phase = SessionPhase::Failed;
                    return Err(RecordingError::Session(err));
                }
            }
        } else {
            None
        };

        let mut gate = ResourceGate::new(self.config.gate);
        let minted = gate.mint();
        let candidate = self
            .config
            .worker_resource
            .clone()
            .unwrap_or_else(|| minted.handle().to_string());
        let (uploads, outcomes) =
            UploadContext::spawn(self.transport.clone(), gate.admit(&candidate));
        // An unused minted resource is revoked right away.
        let resource = match uploads.resource() {
            Some(admitted) => {
                if admitted.handle() != minted.handle() {
                    minted.revoke();
                }
                admitted.clone()
            }
            None => {
                minted.revoke();
                minted
            }
        };
        let coordinator = UploadCoordinator::new(id.clone(), uploads.dispatcher());
        self.resolver = Some(coordinator.spawn_resolver(outcomes));
        self.resource = Some(resource);
        self.coordinator = Some(coordinator);
        self.uploads = Some(uploads);

        match &id {
            Some(id) => info!("{} recording session={id}", category(Category::Session)),
            None => info!(
                "{} recording without a session id",
                category(Category::Session)
            ),
        }
        self.phase = SessionPhase::Recording;
        let context = self.context.insert(SessionContext {
            id,
            base_url: self.config.server_url.clone(),
        });
        Ok(&*context)
    }

    /// Submits one captured slice. Empty slices are dropped and yield `None`.
    pub fn submit(&self, payload: Bytes) -> Result<Option<Completion>, RecordingError> {
        self.expect_phase(SessionPhase::Recording)?;
        let Some(coordinator) = &self.coordinator else {
            return Err(self.invalid_phase(SessionPhase::Recording));
        };
        match coordinator.submit(payload) {
            Ok(completion) => Ok(Some(completion)),
            Err(SubmitError::EmptyChunk) => Ok(None),
            Err(SubmitError::Closed) => Err(self.invalid_phase(SessionPhase::Recording)),
        }
    }

    /// Waits for every submitted chunk, asks the server to merge `produced`
    /// parts, then releases the upload context.
    pub async fn finish(&mut self, produced: u64) -> Result<RecordingReport, RecordingError> {
        self.expect_phase(SessionPhase::Recording)?;
        let (Some(coordinator), Some(context)) = (self.coordinator.clone(), self.context.clone())
        else {
            return Err(self.invalid_phase(SessionPhase::Recording));
        };
        self.phase = SessionPhase::Finalizing;

        let summary = coordinator.await_all().await;
        if summary.submitted != produced {
            warn!(
                "{} producer reported {produced} chunk(s) but {} were submitted",
                category(Category::Upload),
                summary.submitted
            );
        }
        info!(
            "{} {}/{} chunk(s) confirmed, merging",
            category(Category::Merge),
            summary.confirmed,
            summary.submitted
        );
        let merge = request_merge(
            self.transport.http(),
            &context.base_url,
            context.id.as_ref(),
            produced,
        )
        .await;

        let transport = self
            .uploads
            .as_ref()
            .map(UploadContext::mode)
            .unwrap_or(TransportMode::Inline);
        if !self.release_transport() {
            warn!("{} upload context was already released", category(Category::Upload));
        }

        if !summary.failures.is_empty() {
            self.phase = SessionPhase::Failed;
            warn!(
                "{} {} chunk(s) lost",
                category(Category::Upload),
                summary.failures.len()
            );
            return Err(RecordingError::Uploads {
                session_id: context.id,
                failures: summary.failures,
                merge,
            });
        }

        match merge {
            Ok(artifact) => {
                self.phase = SessionPhase::Merged;
                info!(
                    "{} merged {} ({} bytes, {} parts)",
                    category(Category::Merge),
                    artifact.file_name,
                    artifact.bytes,
                    artifact.parts
                );
                Ok(RecordingReport {
                    session_id: context.id,
                    produced,
                    confirmed: summary.confirmed,
                    artifact,
                    transport,
                })
            }
            Err(error) => {
                self.phase = SessionPhase::Failed;
                warn!("{} {error}", category(Category::Merge));
                Err(RecordingError::Merge {
                    session_id: context.id,
                    error,
                })
            }
        }
    }

    /// Terminates the upload context and stops the resolver. Returns `true`
    /// only for the call that released the context.
    pub fn release_transport(&mut self) -> bool {
        let released = self.uploads.as_mut().is_some_and(UploadContext::terminate);
        if let Some(resolver) = self.resolver.take() {
            resolver.abort();
        }
        released
    }

    pub fn transport_released(&self) -> bool {
        self.uploads.as_ref().is_some_and(UploadContext::is_terminated)
    }

    fn expect_phase(&self, expected: SessionPhase) -> Result<(), RecordingError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(self.invalid_phase(expected))
        }
    }

    fn invalid_phase(&self, expected: SessionPhase) -> RecordingError {
        RecordingError::InvalidPhase {
            expected,
            actual: self.phase,
        }
    }
}

/// Records `source` until it ends or `stop` flips, then finalizes.
pub async fn record<R>(
    config: RecorderConfig,
    source: R,
    stop: watch::Receiver<bool>,
) -> Result<RecordingReport, RecordingError>
where
    R: AsyncRead + Unpin,
{
    let interval = config.chunk_interval;
    let mut lifecycle = SessionLifecycle::new(config);
    lifecycle.begin().await?;

    let captured = ChunkProducer::new(source, interval)
        .run(stop, |payload| lifecycle.submit(payload).is_ok())
        .await;
    let (produced, capture_error) = match captured {
        Ok(produced) => (produced, None),
        Err(err) => (lifecycle.submitted(), Some(err)),
    };

    let finished = lifecycle.finish(produced).await;
    match (finished, capture_error) {
        (Ok(report), Some(err)) => {
            warn!(
                "{} source failed after {} was merged: {err}",
                category(Category::Session),
                report.artifact.file_name
            );
            Err(RecordingError::Capture(err))
        }
        (Err(finish_err), Some(err)) => {
            warn!("{} source failed: {err}", category(Category::Session));
            Err(finish_err)
        }
        (finished, None) => finished,
    }
}
