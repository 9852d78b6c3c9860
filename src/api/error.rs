use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error")]
    Transport(#[from] reqwest::Error),
    /// Terminal: the session is gone and the user has to sign in again.
    #[error("session expired")]
    AuthExpired,
    /// A second 401 after the one refresh-and-retry cycle.
    #[error("unauthorized")]
    Unauthorized,
    #[error("request failed ({status})")]
    Status { status: u16, body: String },
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("auth response carried no identity")]
    MissingIdentity,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Unauthorized => Some(401),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}
