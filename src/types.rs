use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Deserializes through [`Role::parse`], so payloads and token claims agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Role {
    Admin,
    Agent,
    Customer,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Agent => "agent",
            Self::Customer => "customer",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "agent" => Self::Agent,
            "customer" => Self::Customer,
            _ => Self::Unknown,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub role: Role,
}

/// Access/refresh pair as returned by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Credential material plus identity for the signed-in user.
///
/// A `Session` is always whole; the store holds `Option<Session>` so the
/// absent state is the only alternative.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub identity: Identity,
}

impl Session {
    pub fn new(tokens: TokenPair, identity: Identity) -> Self {
        Self {
            access_token: tokens.access,
            refresh_token: tokens.refresh,
            identity,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"REDACTED")
            .field("refresh_token", &"REDACTED")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Payload of a `notification` stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub ticket_id: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Errored,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    SignedIn(Identity),
    Refreshed,
    /// Refresh failed or no credential was left; the UI should route to sign-in.
    Expired,
    SignedOut,
}
