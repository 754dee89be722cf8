use std::time::Duration;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{step}: invalid status code returned ({code})")]
    UnexpectedStatus { step: &'static str, code: u16 },

    #[error("{step}: {reason}")]
    MalformedResponse { step: &'static str, reason: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("stream parse failure: {0}")]
    StreamParse(String),

    #[error("unexpected status code: {code}, body: {body}")]
    Upstream { code: u16, body: String },

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("precondition violation: {0}")]
    Precondition(String),

    #[error("captcha error: {0}")]
    Captcha(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// 构造响应格式错误
    pub fn malformed(step: &'static str, reason: impl Into<String>) -> Self {
        ChatError::MalformedResponse {
            step,
            reason: reason.into(),
        }
    }
}
