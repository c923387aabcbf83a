use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Path, Query, Request, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
        },
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use proto::{
    ArtifactRef, MergeFailureResponse, PATH_HEALTHZ, PATH_MERGE, PATH_SESSION, PATH_UPLOAD,
    SessionState, SessionStatusResponse, StatusResponse, is_chunk_content_type, parse_sequence,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    merge::{MergeError, merge_session, plan_merge},
    registry::{ImplicitSession, RegistryError, SessionRegistry},
    store::PartStore,
};

mod handlers;

use handlers::*;

pub const DEFAULT_MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_PARTS: u64 = 100_000;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub record_dir: PathBuf,
    pub max_chunk_bytes: usize,
    /// Upper bound on parts per session. Uploads need `part < max_parts`
    /// and merges may state at most `max_parts`.
    pub max_parts: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            record_dir: PathBuf::from("recordings"),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    registry: SessionRegistry,
    store: PartStore,
    metrics: Arc<ServerMetrics>,
    config: ServerConfig,
}

struct ServerMetrics {
    started_at: Instant,
    sessions_issued_total: AtomicU64,
    parts_received_total: AtomicU64,
    bytes_received_total: AtomicU64,
    uploads_rejected_total: AtomicU64,
    merges_ok_total: AtomicU64,
    merges_failed_total: AtomicU64,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_issued_total: AtomicU64::new(0),
            parts_received_total: AtomicU64::new(0),
            bytes_received_total: AtomicU64::new(0),
            uploads_rejected_total: AtomicU64::new(0),
            merges_ok_total: AtomicU64::new(0),
            merges_failed_total: AtomicU64::new(0),
        }
    }
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            store: PartStore::new(config.record_dir.clone()),
            metrics: Arc::new(ServerMetrics::default()),
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &PartStore {
        &self.store
    }

    pub async fn merge(
        &self,
        session_id: &str,
        expected: Option<u64>,
    ) -> Result<ArtifactRef, MergeError> {
        let result = merge_session(
            &self.registry,
            &self.store,
            session_id,
            expected,
            self.config.max_parts,
        )
        .await;
        let counter = if result.is_ok() {
            &self.metrics.merges_ok_total
        } else {
            &self.metrics.merges_failed_total
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Merges every still-active session whose parts are contiguous. Sessions
    /// with gaps are logged and left as they are.
    pub async fn finalize_open_sessions(&self) -> Vec<(String, Result<ArtifactRef, MergeError>)> {
        let mut results = Vec::new();
        for session_id in self.registry.active_session_ids().await {
            let plan = self
                .registry
                .with_record(&session_id, |record| {
                    plan_merge(
                        &session_id,
                        &record.parts,
                        record.expected_parts,
                        self.config.max_parts,
                    )
                })
                .await;
            match plan {
                Some(Ok(_)) => {
                    let result = self.merge(&session_id, None).await;
                    results.push((session_id, result));
                }
                Some(Err(err)) => {
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        "leaving incomplete session unmerged at shutdown"
                    );
                }
                None => {}
            }
        }
        results
    }
}

pub fn build_server_app(state: ServerState) -> Router {
    Router::new()
        .route(PATH_HEALTHZ, get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route(PATH_SESSION, get(issue_session_handler))
        .route("/session/{session_id}", get(session_status_handler))
        .route(PATH_UPLOAD, post(upload_handler))
        .route(PATH_MERGE, post(merge_handler))
        .layer(middleware::from_fn(cors_middleware))
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    part: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeQuery {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    parts: Option<String>,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn merge_failure_response(err: &MergeError) -> Response {
    let body: MergeFailureResponse = err.to_response();
    (err.status_code(), Json(body)).into_response()
}
