use reqwest::StatusCode;
use thiserror::Error;

/// Errors produced by weather providers.
///
/// Providers absorb most of these internally and degrade to empty results.
/// Only [`ProviderError::Cancelled`] and, on the standalone station-listing
/// path, [`ProviderError::NotConfigured`] ever reach a caller.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} is not configured.\nHint: {hint}")]
    NotConfigured {
        provider: &'static str,
        hint: &'static str,
    },

    #[error("request was cancelled")]
    Cancelled,

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to parse response JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
}

impl ProviderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    pub(crate) fn status(status: StatusCode, body: &str) -> Self {
        ProviderError::Status {
            status,
            body: truncate_body(body),
        }
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
