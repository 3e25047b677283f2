use thiserror::Error;

use crate::refresh::RefreshError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Login rejected (status {status})")]
    LoginRejected { status: u16 },

    #[error("Login response carried no access credential")]
    MissingCredentials,

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Credential produced an invalid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}
