//! Core library for marketdesk.
//!
//! An authenticated client for the marketplace backend. Requests carry the
//! session's bearer token; when the server rejects it, the token is refreshed
//! (once, no matter how many requests noticed) and the request is resent,
//! so callers never see a routine credential expiry.
//!
//! - [`auth`]: session state machine and credential persistence
//! - [`api`]: request pipeline, refresh coordinator, transport, resources
//! - [`config`]: configuration file and environment overrides
//! - [`routes`]: navigation guard for front ends

pub mod api;
pub mod auth;
pub mod config;
pub mod routes;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, ResourceKind};
pub use auth::{
    AuthState, CredentialStore, EmailConfirmation, LoginCredentials, SessionManager,
    SessionSnapshot, User, UserId,
};
pub use config::{Config, StoreBackend};

use anyhow::Result;

/// Open the credential store selected in `config`.
pub fn open_store(config: &Config) -> Result<Box<dyn CredentialStore>> {
    Ok(match config.store {
        StoreBackend::File => Box::new(auth::FileStore::new(Config::data_dir()?)),
        StoreBackend::Keyring => Box::new(auth::KeyringStore::new(config::APP_NAME)),
        StoreBackend::Memory => Box::new(auth::MemoryStore::new()),
    })
}
