use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use super::ApiError;
use crate::settings::{
    SettingsStore, KEY_ASSIGNMENTS_BASE_URL, KEY_NOTIFICATIONS_BASE_URL, KEY_TICKETS_BASE_URL,
    KEY_USERS_BASE_URL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Tickets,
    Notifications,
    Assignments,
    Users,
}

/// Base URLs of the four backend services, without trailing slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    pub tickets: String,
    pub notifications: String,
    pub assignments: String,
    pub users: String,
}

impl ServiceUrls {
    pub fn from_settings(settings: &SettingsStore) -> Self {
        Self {
            tickets: settings.base_url(KEY_TICKETS_BASE_URL),
            notifications: settings.base_url(KEY_NOTIFICATIONS_BASE_URL),
            assignments: settings.base_url(KEY_ASSIGNMENTS_BASE_URL),
            users: settings.base_url(KEY_USERS_BASE_URL),
        }
    }

    /// All services on one origin; handy for local stacks behind a gateway.
    pub fn single(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            tickets: base.clone(),
            notifications: base.clone(),
            assignments: base.clone(),
            users: base,
        }
    }

    pub fn base(&self, service: Service) -> &str {
        match service {
            Service::Tickets => &self.tickets,
            Service::Notifications => &self.notifications,
            Service::Assignments => &self.assignments,
            Service::Users => &self.users,
        }
    }

    pub fn url(&self, service: Service, path: &str) -> String {
        let path = path.trim();
        if path.starts_with('/') {
            format!("{}{path}", self.base(service))
        } else {
            format!("{}/{path}", self.base(service))
        }
    }
}

/// One logical call. `retried` flips at most once, on the first 401.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub retried: bool,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ApiError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ApiError::InvalidRequest(format!("bad header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ApiError::InvalidRequest(format!("bad value for header {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}
