//! Request bodies and response normalization for the auth endpoints.
//!
//! The backend has returned credentials under different field names over
//! time. Rather than scattering fallbacks through the session manager, each
//! known login response layout is a [`LoginShape`] tried in order; the first
//! one that recognizes the payload wins.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use super::session::{User, UserId};

#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Query parameters for the email confirmation link.
#[derive(Debug, Clone)]
pub struct EmailConfirmation {
    pub user_id: String,
    pub code: String,
}

/// A fresh pair of credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Everything a successful login yields.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginGrant {
    pub tokens: TokenPair,
    pub user: User,
}

/// One known login response layout.
pub struct LoginShape {
    pub name: &'static str,
    pub parse: fn(&Value, &LoginCredentials) -> Option<LoginGrant>,
}

/// Known login response layouts, tried in order.
///
/// - `accessToken`: `{accessToken, refreshToken, userId | id}`; the email is
///   the one the user typed since this layout does not echo it.
/// - `securityToken`: `{securityToken | token, refreshToken, id | userId, email?}`.
pub const LOGIN_SHAPES: &[LoginShape] = &[
    LoginShape {
        name: "accessToken",
        parse: parse_access_token_shape,
    },
    LoginShape {
        name: "securityToken",
        parse: parse_security_token_shape,
    },
];

/// Field names that have carried the access credential, in priority order.
const ACCESS_TOKEN_FIELDS: &[&str] = &["accessToken", "securityToken", "token"];

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str().filter(|s| !s.is_empty())
}

fn user_id(value: &Value, keys: &[&str]) -> Option<UserId> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::Number(n) => n.as_i64().map(UserId::Number),
        Value::String(s) if !s.is_empty() => Some(UserId::Text(s.clone())),
        _ => None,
    })
}

fn parse_access_token_shape(value: &Value, credentials: &LoginCredentials) -> Option<LoginGrant> {
    let access_token = non_empty_str(value, "accessToken")?;
    Some(LoginGrant {
        tokens: TokenPair {
            access_token: access_token.to_string(),
            refresh_token: non_empty_str(value, "refreshToken").map(str::to_string),
        },
        user: User {
            id: user_id(value, &["userId", "id"]),
            email: Some(credentials.email.clone()),
        },
    })
}

fn parse_security_token_shape(value: &Value, credentials: &LoginCredentials) -> Option<LoginGrant> {
    let access_token =
        non_empty_str(value, "securityToken").or_else(|| non_empty_str(value, "token"))?;
    let email = non_empty_str(value, "email")
        .map(str::to_string)
        .unwrap_or_else(|| credentials.email.clone());
    Some(LoginGrant {
        tokens: TokenPair {
            access_token: access_token.to_string(),
            refresh_token: non_empty_str(value, "refreshToken").map(str::to_string),
        },
        user: User {
            id: user_id(value, &["id", "userId"]),
            email: Some(email),
        },
    })
}

/// Normalize a login response. `None` when no known layout matches.
pub fn parse_login(value: &Value, credentials: &LoginCredentials) -> Option<(&'static str, LoginGrant)> {
    LOGIN_SHAPES
        .iter()
        .find_map(|shape| (shape.parse)(value, credentials).map(|grant| (shape.name, grant)))
}

/// Normalize a refresh response. `None` when it carries no access credential.
pub fn parse_refresh(value: &Value) -> Option<TokenPair> {
    let access_token = ACCESS_TOKEN_FIELDS
        .iter()
        .find_map(|key| non_empty_str(value, key))?;
    Some(TokenPair {
        access_token: access_token.to_string(),
        refresh_token: non_empty_str(value, "refreshToken").map(str::to_string),
    })
}

/// Body of the refresh call.
pub fn refresh_body(access_token: Option<&str>, refresh_token: &str) -> Value {
    json!({
        "accessToken": access_token,
        "refreshToken": refresh_token,
    })
}

/// Body of the logout call.
pub fn logout_body(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "accessToken": access_token,
        "refreshToken": refresh_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> LoginCredentials {
        LoginCredentials::new("a@b.com", "x")
    }

    #[test]
    fn test_parse_login_access_token_shape() {
        let value = json!({"accessToken": "T1", "refreshToken": "R1", "userId": 7});
        let (shape, grant) = parse_login(&value, &creds()).unwrap();
        assert_eq!(shape, "accessToken");
        assert_eq!(grant.tokens.access_token, "T1");
        assert_eq!(grant.tokens.refresh_token.as_deref(), Some("R1"));
        assert_eq!(grant.user.id, Some(UserId::Number(7)));
        assert_eq!(grant.user.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn test_parse_login_access_token_shape_falls_back_to_id() {
        let value = json!({"accessToken": "T1", "id": "u-1", "email": "ignored@x.y"});
        let (_, grant) = parse_login(&value, &creds()).unwrap();
        assert_eq!(grant.user.id, Some(UserId::Text("u-1".into())));
        // This layout never trusts a returned email
        assert_eq!(grant.user.email.as_deref(), Some("a@b.com"));
        assert_eq!(grant.tokens.refresh_token, None);
    }

    #[test]
    fn test_parse_login_security_token_shape() {
        let value = json!({
            "securityToken": "S1",
            "refreshToken": "R1",
            "id": 12,
            "userId": 99,
            "email": "server@b.com"
        });
        let (shape, grant) = parse_login(&value, &creds()).unwrap();
        assert_eq!(shape, "securityToken");
        assert_eq!(grant.tokens.access_token, "S1");
        assert_eq!(grant.user.id, Some(UserId::Number(12)));
        assert_eq!(grant.user.email.as_deref(), Some("server@b.com"));
    }

    #[test]
    fn test_parse_login_plain_token_field() {
        let value = json!({"token": "P1", "userId": 3});
        let (shape, grant) = parse_login(&value, &creds()).unwrap();
        assert_eq!(shape, "securityToken");
        assert_eq!(grant.tokens.access_token, "P1");
        assert_eq!(grant.user.id, Some(UserId::Number(3)));
        assert_eq!(grant.user.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn test_parse_login_rejects_unknown_layout() {
        assert!(parse_login(&json!({"refreshToken": "R1"}), &creds()).is_none());
        assert!(parse_login(&json!({"accessToken": ""}), &creds()).is_none());
        assert!(parse_login(&Value::Null, &creds()).is_none());
    }

    #[test]
    fn test_parse_refresh() {
        let pair = parse_refresh(&json!({"accessToken": "T2", "refreshToken": "R2"})).unwrap();
        assert_eq!(pair.access_token, "T2");
        assert_eq!(pair.refresh_token.as_deref(), Some("R2"));

        let pair = parse_refresh(&json!({"securityToken": "S2"})).unwrap();
        assert_eq!(pair.access_token, "S2");
        assert_eq!(pair.refresh_token, None);

        assert!(parse_refresh(&json!({"refreshToken": "R2"})).is_none());
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let debug = format!("{:?}", creds());
        assert!(!debug.contains("\"x\""));
        let pair = TokenPair {
            access_token: "secret-token".into(),
            refresh_token: Some("secret-refresh".into()),
        };
        assert!(!format!("{:?}", pair).contains("secret"));
    }
}
