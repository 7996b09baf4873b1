//! Authentication module for managing the user session and its credentials.
//!
//! This module provides:
//! - `SessionManager`: the auth state machine and sole writer of the session
//! - `Session`: access/refresh credentials, user, loading and error state
//! - `CredentialStore`: persistence of the session across restarts
//!   (file, OS keychain, or memory)
//! - Payload normalization for the several login response layouts

pub mod manager;
pub mod payload;
pub mod session;
pub mod store;

pub use manager::SessionManager;
pub use payload::{EmailConfirmation, LoginCredentials, LoginGrant, TokenPair};
pub use session::{AuthState, Session, SessionSnapshot, User, UserId};
pub use store::{CredentialStore, FileStore, KeyringStore, MemoryStore};
