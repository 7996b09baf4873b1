use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::store::{CredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY};

/// Backend user identifier. Older endpoints return numbers, newer ones strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(untagged)]
pub enum UserId {
    Number(i64),
    Text(String),
}

impl PartialEq<i64> for UserId {
    fn eq(&self, other: &i64) -> bool {
        match self {
            UserId::Number(n) => n == other,
            UserId::Text(s) => s.parse::<i64>().map(|n| n == *other).unwrap_or(false),
        }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Number(n) => write!(f, "{}", n),
            UserId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct User {
    pub id: Option<UserId>,
    pub email: Option<String>,
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum AuthState {
    #[default]
    LoggedOut,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// The process-wide session. Only the session manager mutates it.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub(crate) access_token: Option<String>,
    pub(crate) refresh_token: Option<String>,
    pub(crate) user: Option<User>,
    pub(crate) state: AuthState,
    pub(crate) loading_depth: u32,
    pub(crate) last_error: Option<String>,
}

impl Session {
    /// Seed a session from persisted entries.
    ///
    /// Unreadable entries are treated as absent so a damaged store never
    /// prevents startup; the user simply has to log in again.
    pub fn restore(store: &dyn CredentialStore) -> Self {
        let read = |key: &str| match store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read persisted credential");
                None
            }
        };

        let access_token = read(ACCESS_TOKEN_KEY);
        let refresh_token = read(REFRESH_TOKEN_KEY);
        let user = read(USER_KEY).and_then(|raw| match serde_json::from_str::<User>(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable persisted user record");
                None
            }
        });

        let mut session = Self {
            access_token,
            refresh_token,
            user,
            ..Self::default()
        };
        // A user without an access credential is not a session
        if session.access_token.is_none() {
            session.user = None;
        }
        session.settle();
        session
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.loading_depth > 0
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Drop every credential, returning to `LoggedOut`.
    pub(crate) fn clear(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.user = None;
        self.state = AuthState::LoggedOut;
    }

    /// Recompute the resting state from the credentials held.
    pub(crate) fn settle(&mut self) {
        self.state = if self.access_token.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::LoggedOut
        };
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            is_authenticated: self.is_authenticated(),
            user: self.user.clone(),
            is_loading: self.is_loading(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Credential-free view of the session for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: AuthState,
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub is_loading: bool,
    pub last_error: Option<String>,
}
