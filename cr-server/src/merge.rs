use std::collections::BTreeMap;

use axum::http::StatusCode;
use proto::{ARTIFACT_EXTENSION, ArtifactRef, MergeFailureKind, MergeFailureResponse, SessionState};
use tracing::{info, warn};

use crate::{
    now_unix_ms,
    registry::{RegistryError, SessionRegistry},
    store::PartStore,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeError {
    SessionNotFound(String),
    /// The request named no usable session.
    Unresolved(RegistryError),
    NoParts {
        session_id: String,
    },
    MissingParts {
        session_id: String,
        missing: Vec<u64>,
    },
    CountMismatch {
        session_id: String,
        expected: u64,
        highest: u64,
    },
    PartLimit {
        session_id: String,
        limit: u64,
    },
    Storage {
        session_id: String,
        message: String,
    },
}

impl MergeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MergeError::SessionNotFound(_) | MergeError::Unresolved(_) => StatusCode::NOT_FOUND,
            MergeError::PartLimit { .. } => StatusCode::BAD_REQUEST,
            MergeError::NoParts { .. }
            | MergeError::MissingParts { .. }
            | MergeError::CountMismatch { .. } => StatusCode::CONFLICT,
            MergeError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> MergeFailureKind {
        match self {
            MergeError::SessionNotFound(_) => MergeFailureKind::SessionNotFound,
            MergeError::Unresolved(RegistryError::AmbiguousSession(_)) => {
                MergeFailureKind::AmbiguousSession
            }
            MergeError::Unresolved(_) => MergeFailureKind::SessionNotFound,
            MergeError::PartLimit { .. } => MergeFailureKind::PartLimit,
            MergeError::NoParts { .. } => MergeFailureKind::NoParts,
            MergeError::MissingParts { .. } => MergeFailureKind::MissingParts,
            MergeError::CountMismatch { .. } => MergeFailureKind::CountMismatch,
            MergeError::Storage { .. } => MergeFailureKind::Storage,
        }
    }

    /// Failures that end the session. Storage errors and oversized requests
    /// leave it open.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MergeError::NoParts { .. }
                | MergeError::MissingParts { .. }
                | MergeError::CountMismatch { .. }
        )
    }

    pub fn to_response(&self) -> MergeFailureResponse {
        let (session_id, missing) = match self {
            MergeError::SessionNotFound(id)
            | MergeError::Unresolved(RegistryError::SessionNotFound(id)) => {
                (Some(id.clone()), Vec::new())
            }
            MergeError::Unresolved(_) => (None, Vec::new()),
            MergeError::NoParts { session_id }
            | MergeError::CountMismatch { session_id, .. }
            | MergeError::PartLimit { session_id, .. }
            | MergeError::Storage { session_id, .. } => (Some(session_id.clone()), Vec::new()),
            MergeError::MissingParts {
                session_id,
                missing,
            } => (Some(session_id.clone()), missing.clone()),
        };
        MergeFailureResponse {
            kind: self.kind(),
            error: self.to_string(),
            session_id,
            missing,
        }
    }
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            MergeError::Unresolved(err) => write!(f, "{err}"),
            MergeError::NoParts { session_id } => {
                write!(f, "session {session_id} received no parts")
            }
            MergeError::MissingParts {
                session_id,
                missing,
            } => write!(
                f,
                "session {session_id} is missing {} part(s): {}",
                missing.len(),
                format_sequences(missing)
            ),
            MergeError::CountMismatch {
                session_id,
                expected,
                highest,
            } => write!(
                f,
                "session {session_id} expected {expected} part(s) but received sequence {highest}"
            ),
            MergeError::PartLimit { session_id, limit } => write!(
                f,
                "session {session_id} spans more than the {limit} part(s) a merge accepts"
            ),
            MergeError::Storage {
                session_id,
                message,
            } => write!(f, "failed to assemble session {session_id}: {message}"),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<RegistryError> for MergeError {
    fn from(err: RegistryError) -> Self {
        MergeError::Unresolved(err)
    }
}

/// Decides which sequences make up the artifact. The range is `[0, expected)`
/// when the client states a count, otherwise `[0, highest received]`. Ranges
/// longer than `max_parts` are refused before anything is enumerated.
pub fn plan_merge(
    session_id: &str,
    parts: &BTreeMap<u64, u64>,
    expected: Option<u64>,
    max_parts: u64,
) -> Result<Vec<u64>, MergeError> {
    let highest = parts.keys().next_back().copied();
    let count = match (expected, highest) {
        (_, None) if expected.unwrap_or(0) == 0 => {
            return Err(MergeError::NoParts {
                session_id: session_id.to_string(),
            });
        }
        (Some(expected), Some(highest)) if highest >= expected => {
            return Err(MergeError::CountMismatch {
                session_id: session_id.to_string(),
                expected,
                highest,
            });
        }
        (Some(expected), _) => Some(expected),
        (None, Some(highest)) => highest.checked_add(1),
        (None, None) => Some(0),
    };
    let count = match count {
        Some(count) if count <= max_parts => count,
        _ => {
            return Err(MergeError::PartLimit {
                session_id: session_id.to_string(),
                limit: max_parts,
            });
        }
    };

    let missing = (0..count)
        .filter(|sequence| !parts.contains_key(sequence))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(MergeError::MissingParts {
            session_id: session_id.to_string(),
            missing,
        });
    }
    Ok((0..count).collect())
}

enum MergeStep {
    Finished(Result<ArtifactRef, MergeError>),
    Assemble { sequences: Vec<u64>, implicit: bool },
}

/// Merges a session into one artifact. Concurrent and repeated calls for the
/// same session are serialized; once merged, the stored artifact reference is
/// returned without touching disk again. A stated count above `max_parts` is
/// refused without changing the session.
pub async fn merge_session(
    registry: &SessionRegistry,
    store: &PartStore,
    session_id: &str,
    expected: Option<u64>,
    max_parts: u64,
) -> Result<ArtifactRef, MergeError> {
    if expected.is_some_and(|count| count > max_parts) {
        return Err(MergeError::PartLimit {
            session_id: session_id.to_string(),
            limit: max_parts,
        });
    }
    let not_found = || MergeError::SessionNotFound(session_id.to_string());
    let lock = registry.merge_lock(session_id).await.ok_or_else(not_found)?;
    let _merging = lock.lock().await;

    let step = registry
        .with_record(session_id, |record| match record.state {
            SessionState::Merged => match record.artifact.clone() {
                Some(artifact) => MergeStep::Finished(Ok(artifact)),
                None => MergeStep::Finished(Err(MergeError::Storage {
                    session_id: session_id.to_string(),
                    message: "merged session lost its artifact reference".to_string(),
                })),
            },
            SessionState::Failed => MergeStep::Finished(Err(record
                .failure
                .clone()
                .unwrap_or_else(|| MergeError::NoParts {
                    session_id: session_id.to_string(),
                }))),
            SessionState::Active | SessionState::Finalizing => {
                if expected.is_some() {
                    record.expected_parts = expected;
                }
                record.state = SessionState::Finalizing;
                record.touch();
                match plan_merge(session_id, &record.parts, record.expected_parts, max_parts) {
                    Ok(sequences) => MergeStep::Assemble {
                        sequences,
                        implicit: record.implicit,
                    },
                    Err(err) if err.is_terminal() => {
                        record.state = SessionState::Failed;
                        record.failure = Some(err.clone());
                        MergeStep::Finished(Err(err))
                    }
                    Err(err) => {
                        record.state = SessionState::Active;
                        MergeStep::Finished(Err(err))
                    }
                }
            }
        })
        .await
        .ok_or_else(not_found)?;

    let (sequences, implicit) = match step {
        MergeStep::Finished(Ok(artifact)) => {
            info!(session_id, file = %artifact.file_name, "merge already completed");
            return Ok(artifact);
        }
        MergeStep::Finished(Err(err)) => {
            warn!(session_id, error = %err, "merge rejected");
            return Err(err);
        }
        MergeStep::Assemble {
            sequences,
            implicit,
        } => (sequences, implicit),
    };

    let file_name = format!("{session_id}_{}.{ARTIFACT_EXTENSION}", now_unix_ms());
    let assembled = {
        let store = store.clone();
        let session = session_id.to_string();
        let sequences = sequences.clone();
        let file_name = file_name.clone();
        tokio::task::spawn_blocking(move || store.concatenate(&session, &sequences, &file_name))
            .await
    };
    let bytes = match assembled {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => return Err(revert_to_active(registry, session_id, err.to_string()).await),
        Err(err) => return Err(revert_to_active(registry, session_id, err.to_string()).await),
    };

    let artifact = ArtifactRef {
        session_id: session_id.to_string(),
        file_name,
        bytes,
        parts: sequences.len() as u64,
    };
    registry
        .with_record(session_id, |record| {
            record.state = SessionState::Merged;
            record.artifact = Some(artifact.clone());
            record.touch();
        })
        .await;
    info!(
        session_id,
        file = %artifact.file_name,
        bytes = artifact.bytes,
        parts = artifact.parts,
        implicit,
        "session merged"
    );

    let cleanup = {
        let store = store.clone();
        let session = session_id.to_string();
        tokio::task::spawn_blocking(move || store.discard_session(&session)).await
    };
    match cleanup {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(session_id, "failed to remove merged parts: {err}"),
        Err(err) => warn!(session_id, "part cleanup task failed: {err}"),
    }
    Ok(artifact)
}

async fn revert_to_active(registry: &SessionRegistry, session_id: &str, message: String) -> MergeError {
    registry
        .with_record(session_id, |record| {
            record.state = SessionState::Active;
            record.touch();
        })
        .await;
    let err = MergeError::Storage {
        session_id: session_id.to_string(),
        message,
    };
    warn!(session_id, error = %err, "merge failed; session left open for retry");
    err
}

fn format_sequences(sequences: &[u64]) -> String {
    const SHOWN: usize = 16;
    let mut out = sequences
        .iter()
        .take(SHOWN)
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if sequences.len() > SHOWN {
        out.push_str(&format!(", ... (+{})", sequences.len() - SHOWN));
    }
    out
}
