use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Finalizing,
    Merged,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Merged | SessionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Finalizing => "finalizing",
            SessionState::Merged => "merged",
            SessionState::Failed => "failed",
        }
    }
}

/// Reference to a merged recording, returned by every successful merge of a
/// session (including retried merges).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub session_id: String,
    pub file_name: String,
    pub bytes: u64,
    pub parts: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeFailureKind {
    MissingParts,
    NoParts,
    CountMismatch,
    SessionNotFound,
    AmbiguousSession,
    PartLimit,
    Storage,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeFailureResponse {
    pub kind: MergeFailureKind,
    pub error: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub missing: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub state: SessionState,
    pub parts_received: u64,
    pub bytes_received: u64,
    #[serde(default)]
    pub expected_parts: Option<u64>,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}
