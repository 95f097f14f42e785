use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote authorization failed: {0}")]
    Unauthorized(String),

    #[error("remote resource not found: {0}")]
    NotFound(String),

    #[error("remote rate limited retry_after={retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("remote transport error: {0}")]
    TransportTransient(String),

    #[error("remote rejected request: {0}")]
    BadRequest(String),

    #[error("remote throttled retry_after={retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Maps a non-success Graph response onto the error taxonomy.
    pub fn from_status(status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let body = truncate(body);
        let retry_after = parse_retry_after(headers);
        match status.as_u16() {
            401 | 403 => RemoteError::Unauthorized(format!("status={} body={}", status, body)),
            404 => RemoteError::NotFound(format!("status={} body={}", status, body)),
            429 => RemoteError::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            503 | 504 if retry_after.is_some() => RemoteError::Throttled {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            500..=599 => {
                RemoteError::TransportTransient(format!("status={} body={}", status, body))
            }
            400..=499 => RemoteError::BadRequest(format!("status={} body={}", status, body)),
            _ => RemoteError::Other(format!("status={} body={}", status, body)),
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return RemoteError::Other(format!("invalid response body: {err}"));
        }
        if let Some(status) = err.status() {
            return RemoteError::from_status(status, &HeaderMap::new(), &err.to_string());
        }
        RemoteError::TransportTransient(err.to_string())
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    /// Errors worth another attempt after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::Throttled { .. }
                | RemoteError::TransportTransient(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } | RemoteError::Throttled { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Other(format!("invalid graph payload: {err}"))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use test_case::test_case;

    use super::*;

    fn headers(retry_after: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test_case(401, "unauthorized" ; "unauthorized")]
    #[test_case(403, "unauthorized" ; "forbidden")]
    #[test_case(404, "not_found" ; "missing")]
    #[test_case(500, "transient" ; "server error")]
    #[test_case(503, "transient" ; "unavailable without retry after")]
    #[test_case(400, "bad_request" ; "bad request")]
    #[test_case(409, "bad_request" ; "conflict")]
    fn status_is_classified(status: u16, expected: &str) {
        let err = RemoteError::from_status(
            StatusCode::from_u16(status).unwrap(),
            &headers(None),
            "{}",
        );
        let actual = match err {
            RemoteError::Unauthorized(_) => "unauthorized",
            RemoteError::NotFound(_) => "not_found",
            RemoteError::TransportTransient(_) => "transient",
            RemoteError::BadRequest(_) => "bad_request",
            _ => "other",
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn rate_limit_keeps_server_delay() {
        let err = RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, &headers(Some("7")), "");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, &headers(None), "");
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn unavailable_with_retry_after_is_throttled() {
        let err = RemoteError::from_status(StatusCode::SERVICE_UNAVAILABLE, &headers(Some("3")), "");
        assert!(matches!(err, RemoteError::Throttled { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(600);
        let err = RemoteError::from_status(StatusCode::BAD_REQUEST, &headers(None), &body);
        assert!(err.to_string().len() < 700);
    }
}
