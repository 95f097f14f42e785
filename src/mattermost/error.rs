use reqwest::StatusCode;
use thiserror::Error;

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Error)]
pub enum LocalError {
    #[error("local authorization failed: {0}")]
    Unauthorized(String),

    #[error("local resource not found: {0}")]
    NotFound(String),

    #[error("local rejected request: {0}")]
    BadRequest(String),

    #[error("local transport error: {0}")]
    Transient(String),

    #[error("local error: {0}")]
    Other(String),
}

impl LocalError {
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("status={} body={}", status, truncate(body));
        match status.as_u16() {
            401 | 403 => LocalError::Unauthorized(detail),
            404 => LocalError::NotFound(detail),
            429 | 500..=599 => LocalError::Transient(detail),
            400..=499 => LocalError::BadRequest(detail),
            _ => LocalError::Other(detail),
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return LocalError::Other(format!("invalid response body: {err}"));
        }
        if let Some(status) = err.status() {
            return LocalError::from_status(status, &err.to_string());
        }
        LocalError::Transient(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LocalError::NotFound(_))
    }
}

fn truncate(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
