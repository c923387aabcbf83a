use super::*;

pub(super) async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    info!(
        method = %method,
        uri = %uri,
        status = status.as_u16(),
        elapsed_ms = elapsed_ms,
        "http access"
    );
    response
}

/// Capture scripts post from whatever page hosts the media element, so every
/// response allows any origin and preflights are answered directly.
pub(super) async fn cors_middleware(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        let headers = response.headers_mut();
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        response
    } else {
        next.run(request).await
    };
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

pub(super) async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let counts = state.registry.count_by_state().await;
    let count = |session_state: SessionState| counts.get(&session_state).copied().unwrap_or(0);
    let metrics = &state.metrics;
    let text = format!(
        concat!(
            "cr_server_uptime_seconds {}\n",
            "cr_server_sessions_active {}\n",
            "cr_server_sessions_finalizing {}\n",
            "cr_server_sessions_merged {}\n",
            "cr_server_sessions_failed {}\n",
            "cr_server_sessions_issued_total {}\n",
            "cr_server_parts_received_total {}\n",
            "cr_server_bytes_received_total {}\n",
            "cr_server_uploads_rejected_total {}\n",
            "cr_server_merges_ok_total {}\n",
            "cr_server_merges_failed_total {}\n"
        ),
        metrics.started_at.elapsed().as_secs(),
        count(SessionState::Active),
        count(SessionState::Finalizing),
        count(SessionState::Merged),
        count(SessionState::Failed),
        metrics.sessions_issued_total.load(Ordering::Relaxed),
        metrics.parts_received_total.load(Ordering::Relaxed),
        metrics.bytes_received_total.load(Ordering::Relaxed),
        metrics.uploads_rejected_total.load(Ordering::Relaxed),
        metrics.merges_ok_total.load(Ordering::Relaxed),
        metrics.merges_failed_total.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
}

pub(super) async fn issue_session_handler(State(state): State<ServerState>) -> Response {
    let session_id = state.registry.issue().await;
    state
        .metrics
        .sessions_issued_total
        .fetch_add(1, Ordering::Relaxed);
    info!(session_id = %session_id, "session issued");
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        session_id,
    )
        .into_response()
}

pub(super) async fn session_status_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, Response> {
    state
        .registry
        .status(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| {
            let err = RegistryError::SessionNotFound(session_id);
            error_response(err.status_code(), &err.to_string())
        })
}

pub(super) async fn upload_handler(
    State(state): State<ServerState>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Response {
    let response = accept_upload(&state, query, request).await;
    if !response.status().is_success() {
        state
            .metrics
            .uploads_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }
    response
}

async fn accept_upload(state: &ServerState, query: UploadQuery, request: Request) -> Response {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if !is_chunk_content_type(content_type) {
        warn!("rejected upload with content-type {content_type:?}");
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "content-type must be video/webm",
        );
    }

    let Some(sequence) = query.part.as_deref().and_then(parse_sequence) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "part must be a non-negative integer",
        );
    };
    let max_parts = state.config.max_parts;
    if sequence >= max_parts {
        warn!(part = sequence, max_parts, "upload rejected");
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("part must be below {max_parts}"),
        );
    }

    let session_id = match state
        .registry
        .resolve(query.session.as_deref(), ImplicitSession::OpenIfNone)
        .await
    {
        Ok(session_id) => session_id,
        Err(err) => {
            warn!(part = sequence, error = %err, "upload rejected");
            return error_response(err.status_code(), &err.to_string());
        }
    };
    if let Err(err) = state.registry.ensure_active(&session_id).await {
        warn!(session_id = %session_id, part = sequence, error = %err, "upload rejected");
        return error_response(err.status_code(), &err.to_string());
    }

    let limit = state.config.max_chunk_bytes;
    let body = match to_bytes(request.into_body(), limit + 1).await {
        Ok(body) if body.len() <= limit => body,
        Ok(_) | Err(_) => {
            warn!(
                session_id = %session_id,
                part = sequence,
                limit,
                "upload body unreadable or over limit"
            );
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
        }
    };
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty chunk");
    }

    let size = body.len() as u64;
    let written = {
        let store = state.store.clone();
        let session = session_id.clone();
        tokio::task::spawn_blocking(move || store.write_part(&session, sequence, &body)).await
    };
    match written {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(session_id = %session_id, part = sequence, "failed to store part: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to store part");
        }
        Err(err) => {
            warn!(session_id = %session_id, part = sequence, "store task failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to store part");
        }
    }

    if let Err(err) = state.registry.record_part(&session_id, sequence, size).await {
        // The session closed while the body was being written; the stray file
        // is not referenced by the registry and is never merged.
        warn!(session_id = %session_id, part = sequence, error = %err, "upload rejected");
        return error_response(err.status_code(), &err.to_string());
    }

    state
        .metrics
        .parts_received_total
        .fetch_add(1, Ordering::Relaxed);
    state
        .metrics
        .bytes_received_total
        .fetch_add(size, Ordering::Relaxed);
    info!(session_id = %session_id, part = sequence, bytes = size, "part stored");
    (StatusCode::OK, "ok").into_response()
}

pub(super) async fn merge_handler(
    State(state): State<ServerState>,
    Query(query): Query<MergeQuery>,
) -> Response {
    let expected = match query.parts.as_deref() {
        None => None,
        Some(raw) => match parse_sequence(raw) {
            Some(count) => Some(count),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "parts must be a non-negative integer",
                );
            }
        },
    };

    let session_id = match state
        .registry
        .resolve(query.session.as_deref(), ImplicitSession::RequireActive)
        .await
    {
        Ok(session_id) => session_id,
        Err(err) => {
            warn!(error = %err, "merge target not resolved");
            return merge_failure_response(&MergeError::from(err));
        }
    };

    match state.merge(&session_id, expected).await {
        Ok(artifact) => (StatusCode::OK, Json(artifact)).into_response(),
        Err(err) => merge_failure_response(&err),
    }
}
