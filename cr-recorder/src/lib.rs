mod chunk;
mod control;
mod coordinator;
mod gate;
mod lifecycle;
pub mod logging;
mod producer;
mod transport;
mod worker;

pub use chunk::{Chunk, ChunkUploadFailure, UploadOutcome, UploadStatus};
pub use control::{
    MergeFailure, SessionAcquisitionError, SessionId, acquire_session, request_merge,
};
pub use coordinator::{Completion, SubmitError, UploadCoordinator, UploadSummary};
pub use gate::{GateMode, LocalResource, RejectionReason, ResourceGate, ResourceGateRejection};
pub use lifecycle::{
    RecorderConfig, RecordingError, RecordingReport, SessionContext, SessionLifecycle,
    SessionPhase, record,
};
pub use producer::ChunkProducer;
pub use transport::{RetryPolicy, TransportClient};
pub use worker::{Dispatcher, TransportMode, UploadContext};

pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()
}
