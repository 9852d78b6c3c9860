mod coordinator;
mod renewer;

pub use coordinator::RefreshCoordinator;
pub use renewer::{HttpRenewer, RenewError, TokenRenewer, REFRESH_PATH};
