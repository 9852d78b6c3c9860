use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ApiError, OutboundRequest, Service, ServiceUrls};
use crate::redact::redact_secrets;
use crate::refresh::RefreshCoordinator;
use crate::state::SessionStore;

/// The only path from the client to the backend services.
///
/// Attaches the bearer credential, recovers from exactly one 401 per request
/// via the refresh coordinator, and passes every other failure through.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    urls: ServiceUrls,
    store: SessionStore,
    coordinator: RefreshCoordinator,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        urls: ServiceUrls,
        store: SessionStore,
        coordinator: RefreshCoordinator,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            urls,
            store,
            coordinator,
            timeout,
        }
    }

    pub fn urls(&self) -> &ServiceUrls {
        &self.urls
    }

    pub fn request(&self, method: Method, service: Service, path: &str) -> OutboundRequest {
        OutboundRequest::new(method, self.urls.url(service, path))
    }

    pub async fn send(&self, mut request: OutboundRequest) -> Result<Response, ApiError> {
        let mut token = self.token_for_dispatch().await?;

        loop {
            let res = self.dispatch(&request, token.as_deref()).await?;
            if res.status() != StatusCode::UNAUTHORIZED {
                return check_status(res).await;
            }

            if request.retried {
                debug!(method = %request.method, url = %request.url, "unauthorized after retry");
                return Err(ApiError::Unauthorized);
            }
            request.retried = true;

            match self.recover(token.as_deref()).await {
                Some(fresh) => {
                    debug!(
                        method = %request.method,
                        url = %request.url,
                        "retrying with renewed credential"
                    );
                    token = Some(fresh);
                }
                None => return Err(ApiError::AuthExpired),
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
    ) -> Result<T, ApiError> {
        let res = self.send(self.request(Method::GET, service, path)).await?;
        decode_json(res).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let req = self.request(Method::POST, service, path).json(body)?;
        decode_json(self.send(req).await?).await
    }

    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let req = self.request(Method::PUT, service, path).json(body)?;
        decode_json(self.send(req).await?).await
    }

    pub async fn patch_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let req = self.request(Method::PATCH, service, path).json(body)?;
        decode_json(self.send(req).await?).await
    }

    pub async fn delete(&self, service: Service, path: &str) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, service, path))
            .await
            .map(|_| ())
    }

    /// Current access token, renewed first if it has already expired.
    async fn token_for_dispatch(&self) -> Result<Option<String>, ApiError> {
        let Some(access) = self.store.get_access() else {
            return Ok(None);
        };
        if !self.store.is_expired(&access) {
            return Ok(Some(access));
        }

        debug!("access token expired before dispatch; renewing");
        match self.coordinator.refresh().await {
            Some(fresh) => Ok(Some(fresh)),
            None => Err(ApiError::AuthExpired),
        }
    }

    /// Token to retry with after a 401, or `None` when the session is over.
    async fn recover(&self, sent: Option<&str>) -> Option<String> {
        if !self.store.is_present() {
            self.coordinator.expire_session();
            return None;
        }

        // Someone else already rotated the credential while this request was out.
        if let Some(current) = self.store.get_access() {
            if sent != Some(current.as_str()) {
                return Some(current);
            }
        }

        let fresh = self.coordinator.refresh().await;
        if fresh.is_none() {
            info!("credential renewal failed; session expired");
        }
        fresh
    }

    async fn dispatch(
        &self,
        request: &OutboundRequest,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(self.timeout);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| {
            warn!(
                method = %request.method,
                error = %redact_secrets(&e.to_string()),
                "request failed"
            );
            ApiError::Transport(e)
        })
    }
}

pub(crate) async fn check_status(res: Response) -> Result<Response, ApiError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %redact_secrets(&body), "request rejected");
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode_json<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
    let bytes = res.bytes().await?;
    if bytes.is_empty() {
        return Ok(serde_json::from_slice(b"null")?);
    }
    Ok(serde_json::from_slice(&bytes)?)
}
