mod auth;
mod client;
mod error;
mod request;

pub use auth::{AuthApi, RegisterRequest, LOGIN_PATH, REGISTER_PATH};
pub use client::ApiClient;
pub use error::ApiError;
pub use request::{OutboundRequest, Service, ServiceUrls};
