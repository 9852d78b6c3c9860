use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::redact::redact_secrets;
use crate::types::TokenPair;

pub const REFRESH_PATH: &str = "/auth/refresh/";

#[derive(Debug, Error)]
pub enum RenewError {
    #[error("no refresh credential")]
    MissingRefreshToken,
    #[error("network error: {0}")]
    Transport(String),
    #[error("refresh rejected ({status})")]
    Rejected { status: u16 },
    #[error("invalid refresh response")]
    Decode,
}

/// Performs one credential renewal call. Implementations do not dedupe;
/// that is the coordinator's job.
pub trait TokenRenewer: Send + Sync {
    fn renew(&self, refresh_token: String) -> BoxFuture<'static, Result<TokenPair, RenewError>>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// `POST {users}/auth/refresh/` with `{ "refresh": ... }`.
#[derive(Clone)]
pub struct HttpRenewer {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRenewer {
    pub fn new(http: reqwest::Client, users_base_url: &str, timeout: Duration) -> Self {
        Self {
            http,
            url: format!("{}{REFRESH_PATH}", users_base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

impl TokenRenewer for HttpRenewer {
    fn renew(&self, refresh_token: String) -> BoxFuture<'static, Result<TokenPair, RenewError>> {
        let http = self.http.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        async move {
            let res = http
                .post(&url)
                .timeout(timeout)
                .json(&json!({ "refresh": refresh_token }))
                .send()
                .await
                .map_err(|e| RenewError::Transport(redact_secrets(&e.to_string()).into_owned()))?;

            if !res.status().is_success() {
                return Err(RenewError::Rejected {
                    status: res.status().as_u16(),
                });
            }

            let body: RefreshResponse = res.json().await.map_err(|_| RenewError::Decode)?;
            let access = body.access.trim().to_string();
            if access.is_empty() {
                return Err(RenewError::Decode);
            }
            let refresh = body
                .refresh
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or(refresh_token);
            Ok(TokenPair { access, refresh })
        }
        .boxed()
    }
}
