use std::time::Duration;

use proto::{CHUNK_CONTENT_TYPE, PATH_UPLOAD, QUERY_PART, QUERY_SESSION};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::{
    chunk::{Chunk, UploadOutcome, UploadStatus},
    control::endpoint,
    logging::{Category, category, status_label},
};

/// Retries are opt-in. A failed attempt `n` (zero-based) waits
/// `backoff * 2^n` before the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.checked_pow(attempt).unwrap_or(u32::MAX))
    }
}

/// Performs single chunk upload calls against one server.
#[derive(Clone, Debug)]
pub struct TransportClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl TransportClient {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn upload(&self, chunk: &Chunk) -> UploadOutcome {
        let mut attempt = 0u32;
        loop {
            let status = self.attempt(chunk).await;
            attempt += 1;
            match &status {
                UploadStatus::Success(code) => {
                    debug!(
                        "{} part={} bytes={} status={}",
                        category(Category::Upload),
                        chunk.sequence,
                        chunk.size(),
                        status_label(*code)
                    );
                }
                UploadStatus::Failure(reason) if attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        "{} part={} attempt={attempt} failed: {reason}; retrying in {}ms",
                        category(Category::Upload),
                        chunk.sequence,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                UploadStatus::Failure(reason) => {
                    warn!(
                        "{} part={} failed after {attempt} attempt(s): {reason}",
                        category(Category::Upload),
                        chunk.sequence
                    );
                }
            }
            return UploadOutcome {
                sequence: chunk.sequence,
                status,
                attempts: attempt,
            };
        }
    }

    async fn attempt(&self, chunk: &Chunk) -> UploadStatus {
        let mut query = vec![(QUERY_PART, chunk.sequence.to_string())];
        if let Some(session) = &chunk.session {
            query.push((QUERY_SESSION, session.to_string()));
        }
        let mut request = self
            .client
            .post(endpoint(&self.base_url, PATH_UPLOAD))
            .query(&query)
            .header(CONTENT_TYPE, CHUNK_CONTENT_TYPE)
            .body(chunk.payload.clone());
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                UploadStatus::Success(response.status().as_u16())
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let body = body.trim();
                if body.is_empty() {
                    UploadStatus::Failure(format!("server returned status {status}"))
                } else {
                    UploadStatus::Failure(format!("server returned status {status}: {body}"))
                }
            }
            Err(err) if err.is_timeout() => UploadStatus::Failure(format!("timed out: {err}")),
            Err(err) => UploadStatus::Failure(format!("request failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(RetryPolicy::default().max_retries, 0);
    }

    #[test]
    fn huge_attempts_saturate() {
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(64), Duration::from_secs(u64::from(u32::MAX)));
    }

    #[tokio::test]
    async fn refused_connection_is_a_failure_with_attempt_count() {
        let port = {
            let listener =
                std::net::TcpListener::bind("127.0.0.1:0").expect("listener should bind");
            listener.local_addr().expect("listener should have addr").port()
        };
        let transport = TransportClient::new(
            format!("http://127.0.0.1:{port}"),
            Some(Duration::from_secs(2)),
            RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(1),
            },
        );
        let outcome = transport
            .upload(&Chunk {
                session: None,
                sequence: 7,
                payload: bytes::Bytes::from_static(b"data"),
            })
            .await;
        assert_eq!(outcome.sequence, 7);
        assert_eq!(outcome.attempts, 3);
        assert!(!outcome.is_success());
    }
}
