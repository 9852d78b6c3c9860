pub mod api;
pub mod app;
pub mod hub;
mod redact;
pub mod refresh;
pub mod settings;
pub mod state;
pub mod stream;
pub mod token;
pub mod types;
pub mod view;

pub use app::App;
