use bytes::Bytes;

use crate::control::SessionId;

/// One time slice of the capture stream, addressed by its position.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub session: Option<SessionId>,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Chunk {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    Success(u16),
    Failure(String),
}

impl UploadStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadStatus::Success(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    pub sequence: u64,
    pub status: UploadStatus,
    pub attempts: u32,
}

impl UploadOutcome {
    /// An outcome for a chunk that never reached the network.
    pub fn failed(sequence: u64, reason: impl Into<String>) -> Self {
        Self {
            sequence,
            status: UploadStatus::Failure(reason.into()),
            attempts: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkUploadFailure {
    pub sequence: u64,
    pub reason: String,
}

impl std::fmt::Display for ChunkUploadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk {} failed to upload: {}", self.sequence, self.reason)
    }
}

impl std::error::Error for ChunkUploadFailure {}
