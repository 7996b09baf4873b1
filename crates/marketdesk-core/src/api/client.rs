//! Credential-aware API client.
//!
//! [`ApiClient::send`] is the request primitive every resource service uses.
//! It attaches the current access token, and when the server answers 401 it
//! obtains a refreshed token through the [`RefreshCoordinator`] and resends
//! the request once. Any other failure is returned untouched.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::coordinator::{RefreshCoordinator, RefreshOutcome};
use super::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::{CredentialStore, SessionManager, User};
use crate::config::Config;

/// How many times one request may be resent after a credential refresh.
pub const MAX_AUTH_RETRIES: u32 = 1;

/// A request on its way through the pipeline, with the token to attach and
/// how many refresh retries it has used.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    request: ApiRequest,
    credential: Option<String>,
    retries: u32,
}

impl PendingRequest {
    pub fn new(request: ApiRequest, credential: Option<String>) -> Self {
        Self {
            request,
            credential,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn can_retry(&self) -> bool {
        self.retries < MAX_AUTH_RETRIES
    }

    /// The same request, to be resent with a refreshed token.
    pub fn retry_with(self, credential: String) -> Self {
        Self {
            request: self.request,
            credential: Some(credential),
            retries: self.retries + 1,
        }
    }

    /// The request as it goes on the wire.
    fn prepare(&self) -> Result<ApiRequest, ApiError> {
        let mut request = self.request.clone();
        if let Some(ref token) = self.credential {
            request.set_bearer(token)?;
        }
        Ok(request)
    }
}

/// API client for the marketplace backend.
/// Clone is cheap - everything inside is shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionManager>) -> Self {
        let coordinator = Arc::new(RefreshCoordinator::new(session.clone()));
        Self {
            transport,
            session,
            coordinator,
        }
    }

    /// Build a client talking to `config.base_url`, restoring any session
    /// persisted in `store`.
    pub fn from_config(config: &Config, store: Box<dyn CredentialStore>) -> Result<Self, ApiError> {
        let transport: Arc<dyn Transport> =
            Arc::new(ReqwestTransport::new(&config.base_url, config.request_timeout())?);
        let session = Arc::new(SessionManager::new(
            transport.clone(),
            store,
            config.endpoints.clone(),
        ));
        Ok(Self::new(transport, session))
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn current_user(&self) -> Option<User> {
        self.session.current_user()
    }

    /// Send a request with the current credentials, refreshing them and
    /// resending once if the server rejects them.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut pending = PendingRequest::new(request, self.session.access_token());

        loop {
            let wire = pending.prepare()?;
            let response = self.transport.send(&wire).await?;

            if !response.is_unauthorized() {
                return response.error_for_status();
            }
            if !pending.can_retry() {
                debug!(path = %wire.path, retries = pending.retries(), "Still unauthorized after refresh");
                return response.error_for_status();
            }

            match self
                .coordinator
                .acquire_refreshed_credential(wire.bearer())
                .await
            {
                RefreshOutcome::Refreshed(tokens) => {
                    debug!(path = %wire.path, "Retrying request with refreshed token");
                    pending = pending.retry_with(tokens.access_token);
                }
                RefreshOutcome::Skipped => {
                    warn!(path = %wire.path, "Unauthorized and no refresh token, logging out");
                    self.session.logout().await;
                    return Err(ApiError::SessionExpired(
                        "No refresh token available. Please log in again.".into(),
                    ));
                }
                RefreshOutcome::Failed(e) => {
                    // A login while the refresh ran leaves a usable token behind
                    if let Some(current) = self.session.access_token() {
                        if wire.bearer() != Some(current.as_str()) {
                            debug!(path = %wire.path, "Refresh discarded, retrying with the current token");
                            pending = pending.retry_with(current);
                            continue;
                        }
                    }
                    warn!(path = %wire.path, error = %e, "Token refresh failed");
                    return Err(ApiError::SessionExpired(format!("Token refresh failed: {}", e)));
                }
            }
        }
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).with_json(body)?).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::put(path).with_json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.send(ApiRequest::delete(path)).await?.payload()
    }
}
