pub mod connection_service;
pub mod connection_store;
pub mod token_vault;

pub use connection_service::{AuthorizationRequest, ConnectionManager, OAuthCallback};
pub use connection_store::{ConnectionStore, PendingOAuthState};
pub use token_vault::TokenVault;
