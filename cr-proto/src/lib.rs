mod bodies;

pub use bodies::{
    ArtifactRef, MergeFailureKind, MergeFailureResponse, SessionState, SessionStatusResponse,
    StatusResponse,
};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
pub const DEFAULT_CHUNK_INTERVAL_MS: u64 = 1_000;

pub const PATH_SESSION: &str = "/session";
pub const PATH_UPLOAD: &str = "/upload";
pub const PATH_MERGE: &str = "/merge";
pub const PATH_HEALTHZ: &str = "/healthz";

pub const QUERY_PART: &str = "part";
pub const QUERY_SESSION: &str = "session";
pub const QUERY_PARTS: &str = "parts";

pub const CHUNK_CONTENT_TYPE: &str = "video/webm";
pub const ARTIFACT_EXTENSION: &str = "webm";

/// Accepts the `Content-Type` values a chunk upload may carry. Parameters such
/// as `;codecs=vp9,opus` are ignored; a missing header is tolerated because
/// older capture scripts never set one.
pub fn is_chunk_content_type(value: Option<&str>) -> bool {
    let Some(value) = value else {
        return true;
    };
    value
        .split(';')
        .next()
        .map(|essence| {
            let essence = essence.trim();
            essence.eq_ignore_ascii_case(CHUNK_CONTENT_TYPE)
                || essence.eq_ignore_ascii_case("application/octet-stream")
        })
        .unwrap_or(false)
}

pub fn parse_sequence(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('+') {
        return None;
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_content_type_ignores_codec_parameters() {
        assert!(is_chunk_content_type(Some("video/webm")));
        assert!(is_chunk_content_type(Some("video/webm;codecs=vp9,opus")));
        assert!(is_chunk_content_type(Some("Video/WebM ; codecs=vp8")));
        assert!(is_chunk_content_type(None));
        assert!(!is_chunk_content_type(Some("application/json")));
    }

    #[test]
    fn sequence_must_be_a_plain_unsigned_integer() {
        assert_eq!(parse_sequence("0"), Some(0));
        assert_eq!(parse_sequence(" 42 "), Some(42));
        assert_eq!(parse_sequence("-1"), None);
        assert_eq!(parse_sequence("+1"), None);
        assert_eq!(parse_sequence(""), None);
        assert_eq!(parse_sequence("1.5"), None);
    }
}
