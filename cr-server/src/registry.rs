use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::http::StatusCode;
use proto::{ArtifactRef, SessionState, SessionStatusResponse};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{merge::MergeError, now_unix_ms};

/// Issues session ids and tracks what each session has received.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

pub(crate) struct SessionRecord {
    pub(crate) state: SessionState,
    pub(crate) parts: BTreeMap<u64, u64>,
    pub(crate) expected_parts: Option<u64>,
    pub(crate) artifact: Option<ArtifactRef>,
    pub(crate) failure: Option<MergeError>,
    pub(crate) implicit: bool,
    pub(crate) merge_lock: Arc<Mutex<()>>,
    created_unix_ms: u64,
    updated_unix_ms: u64,
}

impl SessionRecord {
    fn new(implicit: bool) -> Self {
        let now = now_unix_ms();
        Self {
            state: SessionState::Active,
            parts: BTreeMap::new(),
            expected_parts: None,
            artifact: None,
            failure: None,
            implicit,
            merge_lock: Arc::new(Mutex::new(())),
            created_unix_ms: now,
            updated_unix_ms: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_unix_ms = now_unix_ms();
    }

    fn to_status(&self, session_id: &str) -> SessionStatusResponse {
        SessionStatusResponse {
            session_id: session_id.to_string(),
            state: self.state,
            parts_received: self.parts.len() as u64,
            bytes_received: self.parts.values().sum(),
            expected_parts: self.expected_parts,
            artifact: self.artifact.clone(),
            message: self.failure.as_ref().map(ToString::to_string),
            created_unix_ms: self.created_unix_ms,
            updated_unix_ms: self.updated_unix_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    SessionNotFound(String),
    SessionNotActive {
        session_id: String,
        state: SessionState,
    },
    NoActiveSession,
    AmbiguousSession(usize),
}

impl RegistryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::SessionNotFound(_) | RegistryError::NoActiveSession => {
                StatusCode::NOT_FOUND
            }
            RegistryError::SessionNotActive { .. } => StatusCode::CONFLICT,
            RegistryError::AmbiguousSession(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            RegistryError::SessionNotActive { session_id, state } => write!(
                f,
                "session {session_id} is {} and no longer accepts parts",
                state.as_str()
            ),
            RegistryError::NoActiveSession => write!(f, "no active session"),
            RegistryError::AmbiguousSession(count) => write!(
                f,
                "{count} sessions are active; the session parameter is required"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// What to do when a request names no session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImplicitSession {
    /// Bind to the sole active session, or open one when none is active.
    OpenIfNone,
    /// Bind to the sole active session only.
    RequireActive,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(&self) -> String {
        self.insert(false).await
    }

    /// Resolves the session a request targets. Named sessions must exist;
    /// unnamed requests bind to the only active session.
    pub async fn resolve(
        &self,
        requested: Option<&str>,
        implicit: ImplicitSession,
    ) -> Result<String, RegistryError> {
        if let Some(id) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            let guard = self.sessions.read().await;
            return if guard.contains_key(id) {
                Ok(id.to_string())
            } else {
                Err(RegistryError::SessionNotFound(id.to_string()))
            };
        }

        let mut guard = self.sessions.write().await;
        let active = guard
            .iter()
            .filter(|(_, record)| record.state == SessionState::Active)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        match (active.len(), implicit) {
            (1, _) => Ok(active.into_iter().next().unwrap_or_default()),
            (0, ImplicitSession::OpenIfNone) => {
                let id = Uuid::new_v4().to_string();
                guard.insert(id.clone(), SessionRecord::new(true));
                Ok(id)
            }
            (0, ImplicitSession::RequireActive) => Err(RegistryError::NoActiveSession),
            (count, _) => Err(RegistryError::AmbiguousSession(count)),
        }
    }

    pub async fn ensure_active(&self, session_id: &str) -> Result<(), RegistryError> {
        let guard = self.sessions.read().await;
        let record = guard
            .get(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        check_active(session_id, record)
    }

    /// Records a stored part. Re-sending a sequence replaces its size.
    pub async fn record_part(
        &self,
        session_id: &str,
        sequence: u64,
        bytes: u64,
    ) -> Result<(), RegistryError> {
        let mut guard = self.sessions.write().await;
        let record = guard
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        check_active(session_id, record)?;
        record.parts.insert(sequence, bytes);
        record.touch();
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatusResponse> {
        let guard = self.sessions.read().await;
        guard
            .get(session_id)
            .map(|record| record.to_status(session_id))
    }

    pub async fn active_session_ids(&self) -> Vec<String> {
        let guard = self.sessions.read().await;
        let mut ids = guard
            .iter()
            .filter(|(_, record)| record.state == SessionState::Active)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn count_by_state(&self) -> HashMap<SessionState, usize> {
        let guard = self.sessions.read().await;
        let mut counts = HashMap::new();
        for record in guard.values() {
            *counts.entry(record.state).or_default() += 1;
        }
        counts
    }

    pub(crate) async fn merge_lock(&self, session_id: &str) -> Option<Arc<Mutex<()>>> {
        let guard = self.sessions.read().await;
        guard
            .get(session_id)
            .map(|record| record.merge_lock.clone())
    }

    pub(crate) async fn with_record<T>(
        &self,
        session_id: &str,
        update: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Option<T> {
        let mut guard = self.sessions.write().await;
        guard.get_mut(session_id).map(update)
    }

    async fn insert(&self, implicit: bool) -> String {
        let id = Uuid::new_v4().to_string();
        let mut guard = self.sessions.write().await;
        guard.insert(id.clone(), SessionRecord::new(implicit));
        id
    }
}

fn check_active(session_id: &str, record: &SessionRecord) -> Result<(), RegistryError> {
    if record.state == SessionState::Active {
        Ok(())
    } else {
        Err(RegistryError::SessionNotActive {
            session_id: session_id.to_string(),
            state: record.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_ids_are_unique_uuids() {
        let registry = SessionRegistry::new();
        let first = registry.issue().await;
        let second = registry.issue().await;
        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
        let status = registry.status(&first).await.expect("status should exist");
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.parts_received, 0);
    }

    #[tokio::test]
    async fn unnamed_request_binds_to_sole_active_session() {
        let registry = SessionRegistry::new();
        let id = registry.issue().await;
        let resolved = registry
            .resolve(None, ImplicitSession::RequireActive)
            .await
            .expect("sole session should resolve");
        assert_eq!(resolved, id);

        registry.issue().await;
        let err = registry
            .resolve(None, ImplicitSession::RequireActive)
            .await
            .expect_err("two active sessions are ambiguous");
        assert_eq!(err, RegistryError::AmbiguousSession(2));
    }

    #[tokio::test]
    async fn unnamed_upload_opens_implicit_session_when_none_active() {
        let registry = SessionRegistry::new();
        let err = registry
            .resolve(None, ImplicitSession::RequireActive)
            .await
            .expect_err("nothing to bind to");
        assert_eq!(err, RegistryError::NoActiveSession);

        let opened = registry
            .resolve(None, ImplicitSession::OpenIfNone)
            .await
            .expect("implicit session should open");
        let again = registry
            .resolve(None, ImplicitSession::OpenIfNone)
            .await
            .expect("implicit session should be reused");
        assert_eq!(opened, again);
    }

    #[tokio::test]
    async fn unknown_named_session_is_rejected() {
        let registry = SessionRegistry::new();
        let err = registry
            .resolve(Some("nope"), ImplicitSession::OpenIfNone)
            .await
            .expect_err("unknown session should fail");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn parts_are_refused_once_session_leaves_active() {
        let registry = SessionRegistry::new();
        let id = registry.issue().await;
        registry
            .record_part(&id, 0, 10)
            .await
            .expect("active session accepts parts");
        registry
            .with_record(&id, |record| record.state = SessionState::Finalizing)
            .await;
        let err = registry
            .record_part(&id, 1, 10)
            .await
            .expect_err("finalizing session refuses parts");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
