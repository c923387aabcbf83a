use proto::{
    ArtifactRef, MergeFailureResponse, PATH_MERGE, PATH_SESSION, QUERY_PARTS, QUERY_SESSION,
};
use uuid::Uuid;

/// Server-issued recording session token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = SessionAcquisitionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Uuid::parse_str(trimmed)
            .map(|id| SessionId(id.to_string()))
            .map_err(|_| SessionAcquisitionError::InvalidToken(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAcquisitionError {
    Transport(String),
    Status(u16),
    InvalidToken(String),
}

impl std::fmt::Display for SessionAcquisitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionAcquisitionError::Transport(message) => {
                write!(f, "session request failed: {message}")
            }
            SessionAcquisitionError::Status(status) => {
                write!(f, "session request returned status {status}")
            }
            SessionAcquisitionError::InvalidToken(token) => {
                write!(f, "server returned an invalid session token: {token:?}")
            }
        }
    }
}

impl std::error::Error for SessionAcquisitionError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeFailure {
    Transport(String),
    Rejected {
        status: u16,
        detail: Option<MergeFailureResponse>,
        body: String,
    },
    InvalidResponse(String),
}

impl MergeFailure {
    /// Sequences the server reported missing, if it said so.
    pub fn missing(&self) -> &[u64] {
        match self {
            MergeFailure::Rejected {
                detail: Some(detail),
                ..
            } => &detail.missing,
            _ => &[],
        }
    }
}

impl std::fmt::Display for MergeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeFailure::Transport(message) => write!(f, "merge request failed: {message}"),
            MergeFailure::Rejected {
                status,
                detail: Some(detail),
                ..
            } => write!(f, "merge rejected with status {status}: {}", detail.error),
            MergeFailure::Rejected { status, body, .. } => {
                write!(f, "merge rejected with status {status}: {body}")
            }
            MergeFailure::InvalidResponse(message) => {
                write!(f, "merge response could not be read: {message}")
            }
        }
    }
}

impl std::error::Error for MergeFailure {}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

pub async fn acquire_session(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<SessionId, SessionAcquisitionError> {
    let response = client
        .get(endpoint(base_url, PATH_SESSION))
        .send()
        .await
        .map_err(|err| SessionAcquisitionError::Transport(err.to_string()))?;
    if !response.status().is_success() {
        return Err(SessionAcquisitionError::Status(response.status().as_u16()));
    }
    let token = response
        .text()
        .await
        .map_err(|err| SessionAcquisitionError::Transport(err.to_string()))?;
    token.parse()
}

/// Asks the server to concatenate `[0, parts)` of the session. Without a
/// session id the server binds the merge to its sole active session.
pub async fn request_merge(
    client: &reqwest::Client,
    base_url: &str,
    session: Option<&SessionId>,
    parts: u64,
) -> Result<ArtifactRef, MergeFailure> {
    let mut query = vec![(QUERY_PARTS, parts.to_string())];
    if let Some(session) = session {
        query.push((QUERY_SESSION, session.to_string()));
    }
    let response = client
        .post(endpoint(base_url, PATH_MERGE))
        .query(&query)
        .send()
        .await
        .map_err(|err| MergeFailure::Transport(err.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<ArtifactRef>()
            .await
            .map_err(|err| MergeFailure::InvalidResponse(err.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(MergeFailure::Rejected {
        status: status.as_u16(),
        detail: serde_json::from_str::<MergeFailureResponse>(&body).ok(),
        body,
    })
}
