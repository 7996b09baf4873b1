//! The session manager: sole owner and writer of the [`Session`].
//!
//! Every public operation marks the session as loading and clears the last
//! error on entry, and releases the loading mark when it finishes, however it
//! finishes (including when the future is dropped mid-flight).
//!
//! State machine:
//!
//! ```text
//! LoggedOut --login--> Authenticating --ok--> Authenticated
//!                                     --err-> (previous resting state)
//! Authenticated --refresh--> Refreshing --ok--> Authenticated
//!                                       --err-> LoggedOut
//! any --logout--> LoggedOut
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::payload::{
    logout_body, parse_login, parse_refresh, refresh_body, EmailConfirmation, LoginCredentials,
    TokenPair,
};
use super::session::{AuthState, Session, SessionSnapshot, User};
use super::store::{CredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, USER_KEY};
use crate::api::{ApiError, ApiRequest, Transport};
use crate::config::AuthEndpoints;

const LOGIN_FAILED: &str = "Login failed";
const REGISTRATION_FAILED: &str = "Registration failed";
const CONFIRMATION_FAILED: &str = "Email confirmation failed";
const REFRESH_FAILED: &str = "Session expired. Please log in again.";

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Box<dyn CredentialStore>,
    endpoints: AuthEndpoints,
    session: Mutex<Session>,
    // Bumped whenever the session is replaced or ended, so a refresh that
    // resolves afterwards can tell its result is stale.
    generation: AtomicU64,
    // At most one refresh request is on the wire. A caller that waited here
    // while another refresh ran takes that result instead of sending its own.
    refresh_gate: tokio::sync::Mutex<()>,
    // Completed refresh requests.
    refreshes: AtomicU64,
    // Store writes are applied in the order of the session updates they mirror.
    store_lock: Mutex<()>,
}

/// A pending write-through to the credential store. `None` removes the key.
type StoreWrite = (&'static str, Option<String>);

/// Holds the loading mark for one operation.
struct OperationGuard<'a> {
    manager: &'a SessionManager,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut session = self.manager.lock();
        session.loading_depth = session.loading_depth.saturating_sub(1);
    }
}

impl SessionManager {
    /// Create a manager, restoring any session persisted in `store`.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Box<dyn CredentialStore>,
        endpoints: AuthEndpoints,
    ) -> Self {
        let session = Session::restore(store.as_ref());
        debug!(
            authenticated = session.is_authenticated(),
            has_refresh_token = session.refresh_token().is_some(),
            "Session restored"
        );
        Self {
            transport,
            store,
            endpoints,
            session: Mutex::new(session),
            generation: AtomicU64::new(0),
            refresh_gate: tokio::sync::Mutex::new(()),
            refreshes: AtomicU64::new(0),
            store_lock: Mutex::new(()),
        }
    }

    // ===== Accessors =====

    pub fn is_authenticated(&self) -> bool {
        self.lock().is_authenticated()
    }

    pub fn current_user(&self) -> Option<User> {
        self.lock().user().cloned()
    }

    pub fn state(&self) -> AuthState {
        self.lock().state()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().is_loading()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error().map(str::to_string)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    /// The access credential to attach to outgoing requests.
    pub fn access_token(&self) -> Option<String> {
        self.lock().access_token().map(str::to_string)
    }

    pub(crate) fn refresh_token(&self) -> Option<String> {
        self.lock().refresh_token().map(str::to_string)
    }

    // ===== Operations =====

    /// Log in and store the returned credentials.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<User, ApiError> {
        let _op = self.begin();
        self.lock().state = AuthState::Authenticating;

        let result = async {
            let request = ApiRequest::post(&self.endpoints.login).with_json(credentials)?;
            let response = self.transport.send(&request).await?.error_for_status()?;
            let payload = response.payload()?;
            parse_login(&payload, credentials).ok_or_else(|| {
                ApiError::InvalidResponse("Login response did not include an access token".into())
            })
        }
        .await;

        let mut session = self.lock();
        match result {
            Ok((shape, grant)) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                let mut writes = install_tokens(&mut session, &grant.tokens);
                writes.push(user_write(&grant.user));
                session.user = Some(grant.user.clone());
                session.settle();
                self.commit(session, writes);
                info!(shape = shape, user_id = ?grant.user.id, "Logged in");
                Ok(grant.user)
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                session.last_error = Some(failure_message(&e, LOGIN_FAILED));
                session.settle();
                Err(e)
            }
        }
    }

    /// Create an account. Does not touch credentials.
    pub async fn register<B: Serialize + ?Sized>(&self, user_data: &B) -> Result<Value, ApiError> {
        let path = self.endpoints.register.clone();
        self.forward(ApiRequest::post(path).with_json(user_data), REGISTRATION_FAILED)
            .await
    }

    /// Second registration step. Does not touch credentials.
    pub async fn complete_registration<B: Serialize + ?Sized>(
        &self,
        data: &B,
    ) -> Result<Value, ApiError> {
        let path = self.endpoints.complete_registration.clone();
        self.forward(ApiRequest::post(path).with_json(data), REGISTRATION_FAILED)
            .await
    }

    /// Confirm an email address with the code from the confirmation link.
    pub async fn confirm_email(&self, confirmation: &EmailConfirmation) -> Result<Value, ApiError> {
        let request = ApiRequest::get(&self.endpoints.confirm_email)
            .with_query("userId", &confirmation.user_id)
            .with_query("code", &confirmation.code);
        self.forward(Ok(request), CONFIRMATION_FAILED).await
    }

    /// Exchange the refresh credential for a new pair.
    ///
    /// Returns `Ok(None)` without touching the session when no refresh
    /// credential is held. Any failure logs the session out. A result that
    /// arrives after the session was ended or replaced is discarded and
    /// reported as [`ApiError::SessionExpired`].
    ///
    /// Concurrent calls share one request: whoever arrives while a refresh
    /// is in flight waits for it and gets its outcome.
    pub async fn refresh(&self) -> Result<Option<TokenPair>, ApiError> {
        let seen = self.refreshes.load(Ordering::SeqCst);
        let entry_token = self.access_token();
        let _gate = self.refresh_gate.lock().await;
        if self.refreshes.load(Ordering::SeqCst) != seen {
            return self.joined_refresh(entry_token.as_deref());
        }

        let (access_token, refresh_token, generation) = {
            let mut session = self.lock();
            let Some(refresh_token) = session.refresh_token.clone() else {
                debug!("No refresh token held, skipping refresh");
                return Ok(None);
            };
            session.loading_depth += 1;
            session.last_error = None;
            session.state = AuthState::Refreshing;
            (
                session.access_token.clone(),
                refresh_token,
                self.generation.load(Ordering::SeqCst),
            )
        };
        let _op = OperationGuard { manager: self };

        info!("Refreshing access token");
        let result = async {
            let request = ApiRequest::post(&self.endpoints.refresh)
                .with_json(&refresh_body(access_token.as_deref(), &refresh_token))?;
            let response = self.transport.send(&request).await?.error_for_status()?;
            parse_refresh(&response.payload()?).ok_or_else(|| {
                ApiError::InvalidResponse("Refresh response did not include an access token".into())
            })
        }
        .await;

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut session = self.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            warn!("Session changed while refreshing, discarding refresh result");
            return Err(ApiError::SessionExpired(
                "Session ended while the token was being refreshed".into(),
            ));
        }

        match result {
            Ok(mut tokens) => {
                // Keep the current refresh credential if the server did not rotate it
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                let writes = install_tokens(&mut session, &tokens);
                session.settle();
                self.commit(session, writes);
                info!("Access token refreshed");
                Ok(Some(tokens))
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, logging out");
                let writes = self.end_session(&mut session);
                session.last_error = Some(failure_message(&e, REFRESH_FAILED));
                self.commit(session, writes);
                Err(e)
            }
        }
    }

    /// Log out. Notifies the server when possible, then always clears the
    /// session locally. Never fails.
    pub async fn logout(&self) {
        let _op = self.begin();
        // Any refresh still in flight must not revive this session
        self.generation.fetch_add(1, Ordering::SeqCst);

        let tokens = {
            let session = self.lock();
            session.access_token.clone().zip(session.refresh_token.clone())
        };

        if let Some((access_token, refresh_token)) = tokens {
            match self.notify_logout(&access_token, &refresh_token).await {
                Ok(()) => debug!("Server acknowledged logout"),
                Err(e) => warn!(error = %e, "Logout request failed, clearing session anyway"),
            }
        }

        let mut session = self.lock();
        let writes = self.end_session(&mut session);
        self.commit(session, writes);
        info!("Logged out");
    }

    // ===== Internals =====

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> OperationGuard<'_> {
        let mut session = self.lock();
        session.loading_depth += 1;
        session.last_error = None;
        OperationGuard { manager: self }
    }

    /// Send a request that has no effect on credentials, recording a
    /// user-facing error on failure.
    async fn forward(
        &self,
        request: Result<ApiRequest, ApiError>,
        fallback: &str,
    ) -> Result<Value, ApiError> {
        let _op = self.begin();
        let result = async {
            let response = self.transport.send(&request?).await?.error_for_status()?;
            response.payload()
        }
        .await;

        if let Err(ref e) = result {
            warn!(error = %e, "{}", fallback);
            self.lock().last_error = Some(failure_message(e, fallback));
        }
        result
    }

    async fn notify_logout(&self, access_token: &str, refresh_token: &str) -> Result<(), ApiError> {
        let mut request = ApiRequest::post(&self.endpoints.logout)
            .with_json(&logout_body(access_token, refresh_token))?;
        request.set_bearer(access_token)?;
        self.transport.send(&request).await?.error_for_status()?;
        Ok(())
    }

    /// Outcome for a caller that waited while another refresh ran: the
    /// credentials it installed, or the session it ended.
    fn joined_refresh(&self, entry_token: Option<&str>) -> Result<Option<TokenPair>, ApiError> {
        let session = self.lock();
        match session.access_token() {
            Some(current) if Some(current) != entry_token => {
                debug!("Refresh completed while waiting, sharing its result");
                Ok(Some(TokenPair {
                    access_token: current.to_string(),
                    refresh_token: session.refresh_token().map(str::to_string),
                }))
            }
            _ => Err(ApiError::SessionExpired(REFRESH_FAILED.into())),
        }
    }

    fn end_session(&self, session: &mut Session) -> Vec<StoreWrite> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        session.clear();
        SESSION_KEYS.iter().map(|key| (*key, None)).collect()
    }

    /// Release the session, then apply `writes` to the store. The store lock
    /// is taken before the session is released.
    fn commit(&self, session: MutexGuard<'_, Session>, writes: Vec<StoreWrite>) {
        let _store = self.store_lock.lock().unwrap_or_else(PoisonError::into_inner);
        drop(session);
        for (key, value) in writes {
            self.persist(key, value.as_deref());
        }
    }

    /// Write-through to the store. The in-memory session stays authoritative
    /// if the store fails.
    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.store.set(key, value),
            None => self.store.remove(key),
        };
        if let Err(e) = result {
            warn!(key = key, error = %e, "Failed to persist credential");
        }
    }
}

fn install_tokens(session: &mut Session, tokens: &TokenPair) -> Vec<StoreWrite> {
    session.access_token = Some(tokens.access_token.clone());
    session.refresh_token = tokens.refresh_token.clone();
    vec![
        (ACCESS_TOKEN_KEY, Some(tokens.access_token.clone())),
        (REFRESH_TOKEN_KEY, tokens.refresh_token.clone()),
    ]
}

fn user_write(user: &User) -> StoreWrite {
    match serde_json::to_string(user) {
        Ok(raw) => (USER_KEY, Some(raw)),
        Err(e) => {
            warn!(error = %e, "Failed to serialize user record");
            (USER_KEY, None)
        }
    }
}

/// The message to show the user for a failed operation.
fn failure_message(error: &ApiError, fallback: &str) -> String {
    error.user_message().unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::mock::MockTransport;
    use crate::auth::session::UserId;
    use crate::auth::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};

    const LOGIN: &str = "/api/login/";
    const REFRESH: &str = "/api/refresh/";
    const LOGOUT: &str = "/api/logout/";

    /// Store wrapper that lets the test inspect entries after the manager owns it.
    #[derive(Clone, Default)]
    struct SharedStore(Arc<MemoryStore>);

    impl CredentialStore for SharedStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.0.set(key, value)
        }
        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.0.remove(key)
        }
    }

    struct FailingStore;

    impl CredentialStore for FailingStore {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("store offline")
        }
        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
    }

    fn manager(transport: &MockTransport, store: &SharedStore) -> SessionManager {
        SessionManager::new(
            Arc::new(transport.clone()),
            Box::new(store.clone()),
            AuthEndpoints::default(),
        )
    }

    fn logged_in_store() -> SharedStore {
        let store = SharedStore::default();
        store.set(ACCESS_TOKEN_KEY, "T1").unwrap();
        store.set(REFRESH_TOKEN_KEY, "R1").unwrap();
        store.set(USER_KEY, r#"{"id":7,"email":"a@b.com"}"#).unwrap();
        store
    }

    #[tokio::test]
    async fn test_login_success_stores_session() {
        let transport = MockTransport::new();
        transport.push(LOGIN, 200, r#"{"accessToken":"T1","refreshToken":"R1","userId":7}"#);
        let store = SharedStore::default();
        let manager = manager(&transport, &store);

        let user = manager
            .login(&LoginCredentials::new("a@b.com", "x"))
            .await
            .unwrap();

        assert!(manager.is_authenticated());
        assert_eq!(manager.state(), AuthState::Authenticated);
        assert_eq!(user.id, Some(UserId::Number(7)));
        assert_eq!(manager.current_user().unwrap().id.unwrap(), 7i64);
        assert!(!manager.is_loading());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
        assert!(store.get(USER_KEY).unwrap().unwrap().contains("a@b.com"));

        let sent = &transport.requests()[0];
        assert_eq!(sent.body.as_ref().unwrap()["email"], "a@b.com");
        assert_eq!(sent.body.as_ref().unwrap()["password"], "x");
    }

    #[tokio::test]
    async fn test_login_accepts_double_encoded_security_token() {
        let transport = MockTransport::new();
        transport.push(
            LOGIN,
            200,
            r#""{\"securityToken\":\"S1\",\"refreshToken\":\"R1\",\"id\":\"u-9\"}""#,
        );
        let manager = manager(&transport, &SharedStore::default());

        let user = manager
            .login(&LoginCredentials::new("a@b.com", "x"))
            .await
            .unwrap();
        assert_eq!(user.id, Some(UserId::Text("u-9".into())));
        assert_eq!(manager.access_token().as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_login_failure_sets_error_and_stays_logged_out() {
        let transport = MockTransport::new();
        transport.push(LOGIN, 401, r#"{"title":"Unauthorized","detail":"Invalid email or password"}"#);
        let store = SharedStore::default();
        let manager = manager(&transport, &store);

        let err = manager
            .login(&LoginCredentials::new("a@b.com", "bad"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert!(!manager.is_authenticated());
        assert_eq!(manager.state(), AuthState::LoggedOut);
        assert_eq!(manager.last_error().as_deref(), Some("Invalid email or password"));
        assert!(!manager.is_loading());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_login_failure_without_message_uses_fallback() {
        let transport = MockTransport::new();
        transport.push(LOGIN, 200, r#"{"unexpected":true}"#);
        let manager = manager(&transport, &SharedStore::default());

        let err = manager
            .login(&LoginCredentials::new("a@b.com", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert_eq!(manager.last_error().as_deref(), Some(LOGIN_FAILED));
    }

    #[tokio::test]
    async fn test_error_cleared_on_next_operation() {
        let transport = MockTransport::new();
        transport.push(LOGIN, 400, r#"{"message":"Email required"}"#);
        transport.push(LOGIN, 200, r#"{"accessToken":"T1","refreshToken":"R1","userId":7}"#);
        let manager = manager(&transport, &SharedStore::default());
        let creds = LoginCredentials::new("a@b.com", "x");

        assert!(manager.login(&creds).await.is_err());
        assert_eq!(manager.last_error().as_deref(), Some("Email required"));

        manager.login(&creds).await.unwrap();
        assert_eq!(manager.last_error(), None);
    }

    #[tokio::test]
    async fn test_register_does_not_touch_credentials() {
        let transport = MockTransport::new();
        transport.push("/api/register/", 400, r#"{"apiError":{"errorMessage":"User already exists"}}"#);
        transport.push("/api/register/", 200, r#"{"userId":"u-1"}"#);
        let store = SharedStore::default();
        let manager = manager(&transport, &store);
        let data = serde_json::json!({"email": "a@b.com", "password": "x"});

        assert!(manager.register(&data).await.is_err());
        assert_eq!(manager.last_error().as_deref(), Some("User already exists"));

        let response = manager.register(&data).await.unwrap();
        assert_eq!(response["userId"], "u-1");
        assert!(!manager.is_authenticated());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_confirm_email_sends_query() {
        let transport = MockTransport::new();
        transport.push("/api/confirm_email/", 400, r#""Invalid token""#);
        let manager = manager(&transport, &SharedStore::default());

        let confirmation = EmailConfirmation {
            user_id: "42".into(),
            code: "abc".into(),
        };
        assert!(manager.confirm_email(&confirmation).await.is_err());
        assert_eq!(manager.last_error().as_deref(), Some("Invalid token"));

        let sent = &transport.requests()[0];
        assert_eq!(sent.method, reqwest::Method::GET);
        assert_eq!(
            sent.query,
            vec![("userId".to_string(), "42".to_string()), ("code".to_string(), "abc".to_string())]
        );
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_noop() {
        let transport = MockTransport::new();
        let store = SharedStore::default();
        store.set(ACCESS_TOKEN_KEY, "T1").unwrap();
        let manager = manager(&transport, &store);
        let before = manager.snapshot();

        assert_eq!(manager.refresh().await.unwrap(), None);
        assert_eq!(manager.snapshot(), before);
        assert_eq!(transport.requests().len(), 0);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_refresh_success_overwrites_both_credentials() {
        let transport = MockTransport::new();
        transport.push(REFRESH, 200, r#"{"accessToken":"T2","refreshToken":"R2"}"#);
        let store = logged_in_store();
        let manager = manager(&transport, &store);

        let tokens = manager.refresh().await.unwrap().unwrap();
        assert_eq!(tokens.access_token, "T2");
        assert_eq!(manager.state(), AuthState::Authenticated);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T2"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));
        // The user survives a refresh
        assert_eq!(manager.current_user().unwrap().id.unwrap(), 7i64);

        let body = transport.requests()[0].body.clone().unwrap();
        assert_eq!(body["refreshToken"], "R1");
        assert_eq!(body["accessToken"], "T1");
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let transport = MockTransport::new();
        transport.push(REFRESH, 200, r#"{"securityToken":"T2"}"#);
        let store = logged_in_store();
        let manager = manager(&transport, &store);

        let tokens = manager.refresh().await.unwrap().unwrap();
        assert_eq!(tokens.refresh_token.as_deref(), Some("R1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_refresh_failure_logs_out() {
        let transport = MockTransport::new();
        transport.push(REFRESH, 500, "boom");
        let store = logged_in_store();
        let manager = manager(&transport, &store);

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, ApiError::ServerError(_)));
        assert!(!manager.is_authenticated());
        assert_eq!(manager.state(), AuthState::LoggedOut);
        assert!(manager.current_user().is_none());
        for key in SESSION_KEYS {
            assert_eq!(store.get(key).unwrap(), None, "{} should be removed", key);
        }
        assert!(manager.last_error().is_some());
    }

    #[tokio::test]
    async fn test_logout_clears_everything_even_when_server_fails() {
        let transport = MockTransport::new();
        transport.push(LOGOUT, 503, "unavailable");
        let store = logged_in_store();
        let manager = manager(&transport, &store);

        manager.logout().await;

        assert!(!manager.is_authenticated());
        assert!(manager.current_user().is_none());
        for key in SESSION_KEYS {
            assert_eq!(store.get(key).unwrap(), None);
        }
        let sent = &transport.requests()[0];
        assert_eq!(sent.bearer(), Some("T1"));
        assert_eq!(sent.body.as_ref().unwrap()["refreshToken"], "R1");

        // Idempotent, and no server call without credentials
        manager.logout().await;
        assert_eq!(transport.count(LOGOUT), 1);
        assert!(!manager.is_loading());
    }

    #[tokio::test]
    async fn test_logout_wins_over_late_refresh() {
        let transport = MockTransport::new();
        let gate = transport.gate(REFRESH);
        transport.push(REFRESH, 200, r#"{"accessToken":"T2","refreshToken":"R2"}"#);
        transport.push(LOGOUT, 200, "");
        let store = logged_in_store();
        let manager = Arc::new(manager(&transport, &store));

        let refreshing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        while transport.count(REFRESH) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.state(), AuthState::Refreshing);

        manager.logout().await;
        gate.add_permits(1);

        let result = refreshing.await.unwrap();
        assert!(matches!(result, Err(ApiError::SessionExpired(_))));
        assert!(!manager.is_authenticated());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(manager.state(), AuthState::LoggedOut);
        assert!(!manager.is_loading());
    }

    #[tokio::test]
    async fn test_login_wins_over_late_refresh() {
        let transport = MockTransport::new();
        let gate = transport.gate(REFRESH);
        transport.push(REFRESH, 200, r#"{"accessToken":"T2","refreshToken":"R2"}"#);
        transport.push(LOGIN, 200, r#"{"accessToken":"T9","refreshToken":"R9","userId":9}"#);
        let store = logged_in_store();
        let manager = Arc::new(manager(&transport, &store));

        let refreshing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        while transport.count(REFRESH) == 0 {
            tokio::task::yield_now().await;
        }

        manager
            .login(&LoginCredentials::new("b@c.com", "y"))
            .await
            .unwrap();
        gate.add_permits(1);

        let result = refreshing.await.unwrap();
        assert!(matches!(result, Err(ApiError::SessionExpired(_))));
        assert_eq!(manager.access_token().as_deref(), Some("T9"));
        assert_eq!(manager.refresh_token().as_deref(), Some("R9"));
        assert_eq!(manager.current_user().unwrap().id.unwrap(), 9i64);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T9"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R9"));
        assert_eq!(manager.state(), AuthState::Authenticated);
        assert!(!manager.is_loading());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_calls_share_one_request() {
        let transport = MockTransport::new();
        let gate = transport.gate(REFRESH);
        transport.push(REFRESH, 200, r#"{"accessToken":"T2","refreshToken":"R2"}"#);
        let manager = Arc::new(manager(&transport, &logged_in_store()));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        while transport.count(REFRESH) == 0 {
            tokio::task::yield_now().await;
        }
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);

        let expected = TokenPair {
            access_token: "T2".into(),
            refresh_token: Some("R2".into()),
        };
        assert_eq!(first.await.unwrap().unwrap(), Some(expected.clone()));
        assert_eq!(second.await.unwrap().unwrap(), Some(expected));
        assert_eq!(transport.count(REFRESH), 1);
    }

    #[tokio::test]
    async fn test_waiter_on_failed_refresh_gets_session_expired() {
        let transport = MockTransport::new();
        let gate = transport.gate(REFRESH);
        transport.push(REFRESH, 401, r#"{"detail":"Refresh token reused"}"#);
        let manager = Arc::new(manager(&transport, &logged_in_store()));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        while transport.count(REFRESH) == 0 {
            tokio::task::yield_now().await;
        }
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);

        assert!(matches!(first.await.unwrap(), Err(ApiError::Unauthorized(_))));
        assert!(matches!(second.await.unwrap(), Err(ApiError::SessionExpired(_))));
        assert_eq!(transport.count(REFRESH), 1);
        assert!(!manager.is_authenticated());
    }

    /// Counts store writes made while the session lock was held.
    #[derive(Clone, Default)]
    struct LockCheckingStore {
        inner: Arc<MemoryStore>,
        manager: Arc<OnceLock<Weak<SessionManager>>>,
        locked_writes: Arc<AtomicUsize>,
    }

    impl LockCheckingStore {
        fn check(&self) {
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                if manager.session.try_lock().is_err() {
                    self.locked_writes.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    impl CredentialStore for LockCheckingStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.check();
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.check();
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn test_store_written_after_session_released() {
        let transport = MockTransport::new();
        transport.push(LOGIN, 200, r#"{"accessToken":"T1","refreshToken":"R1","userId":7}"#);
        transport.push(REFRESH, 200, r#"{"accessToken":"T2","refreshToken":"R2"}"#);
        transport.push(LOGOUT, 200, "");
        let store = LockCheckingStore::default();
        let manager = Arc::new(SessionManager::new(
            Arc::new(transport.clone()),
            Box::new(store.clone()),
            AuthEndpoints::default(),
        ));
        store.manager.set(Arc::downgrade(&manager)).unwrap();

        manager
            .login(&LoginCredentials::new("a@b.com", "x"))
            .await
            .unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T1"));
        manager.refresh().await.unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T2"));
        manager.logout().await;
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);

        assert_eq!(store.locked_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failures_do_not_fail_operations() {
        let transport = MockTransport::new();
        transport.push(LOGIN, 200, r#"{"accessToken":"T1","refreshToken":"R1","userId":7}"#);
        let manager = SessionManager::new(
            Arc::new(transport.clone()),
            Box::new(FailingStore),
            AuthEndpoints::default(),
        );
        assert!(!manager.is_authenticated());

        manager
            .login(&LoginCredentials::new("a@b.com", "x"))
            .await
            .unwrap();
        assert!(manager.is_authenticated());

        manager.logout().await;
        assert!(!manager.is_authenticated());
    }
}
