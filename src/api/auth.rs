use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::client::check_status;
use super::{ApiError, Service, ServiceUrls};
use crate::state::{SessionBus, SessionStore};
use crate::token;
use crate::types::{Identity, Session, SessionSignal, TokenPair};

pub const LOGIN_PATH: &str = "/auth/login/";
pub const REGISTER_PATH: &str = "/auth/register/";

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access: String,
    refresh: String,
    #[serde(default)]
    user: Option<Identity>,
}

/// Unauthenticated calls that create a session. They never enter the
/// refresh cycle: a 401 here means bad credentials.
#[derive(Clone)]
pub struct AuthApi {
    http: reqwest::Client,
    urls: ServiceUrls,
    store: SessionStore,
    bus: SessionBus,
    timeout: Duration,
}

impl AuthApi {
    pub fn new(
        http: reqwest::Client,
        urls: ServiceUrls,
        store: SessionStore,
        bus: SessionBus,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            urls,
            store,
            bus,
            timeout,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, ApiError> {
        #[derive(Serialize)]
        struct Credentials<'a> {
            username: &'a str,
            password: &'a str,
        }

        let url = self.urls.url(Service::Users, LOGIN_PATH);
        self.authenticate(&url, &Credentials { username, password })
            .await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Identity, ApiError> {
        let url = self.urls.url(Service::Users, REGISTER_PATH);
        self.authenticate(&url, request).await
    }

    async fn authenticate<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<Identity, ApiError> {
        let res = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        let res = check_status(res).await?;
        let parsed: AuthResponse = serde_json::from_slice(&res.bytes().await?)?;
        let session = session_from_response(parsed)?;
        let identity = session.identity.clone();

        self.store.set(session);
        info!(user_id = identity.id, role = identity.role.as_str(), "signed in");
        self.bus.emit(SessionSignal::SignedIn(identity.clone()));
        Ok(identity)
    }
}

fn session_from_response(parsed: AuthResponse) -> Result<Session, ApiError> {
    let identity = match parsed.user {
        Some(identity) => identity,
        None => token::decode_claims(&parsed.access)
            .and_then(|claims| claims.identity())
            .map_err(|_| ApiError::MissingIdentity)?,
    };
    Ok(Session::new(
        TokenPair {
            access: parsed.access,
            refresh: parsed.refresh,
        },
        identity,
    ))
}
