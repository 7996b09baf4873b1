//! REST API client module for the marketplace backend.
//!
//! This module provides the `ApiClient` request pipeline, the
//! `RefreshCoordinator` that keeps credential refreshes single-flight, the
//! `Transport` seam over reqwest, and typed CRUD wrappers for each backend
//! collection.
//!
//! The API uses bearer token authentication obtained through the login
//! endpoint and renewed through the refresh endpoint.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod resources;
pub mod transport;

pub use client::{ApiClient, PendingRequest, MAX_AUTH_RETRIES};
pub use coordinator::{RefreshCoordinator, RefreshOutcome};
pub use error::{extract_message, ApiError};
pub use resources::{ResourceKind, Resources};
pub use transport::{decode_payload, ApiRequest, ApiResponse, ReqwestTransport, Transport};
