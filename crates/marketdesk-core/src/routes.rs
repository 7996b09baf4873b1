//! Route guard for front ends built on this client.
//!
//! Mirrors the navigation rule of the web application: some routes are
//! public, the rest need an authenticated session, and anything protected
//! sends an anonymous visitor to the login page.

/// Where anonymous visitors are sent.
pub const LOGIN_ROUTE: &str = "/login";

/// Route patterns and whether they need a session. `:name` matches one segment.
const ROUTES: &[(&str, bool)] = &[
    ("/login", false),
    ("/register", false),
    ("/confirm-email", false),
    ("/listings", true),
    ("/listing/:id", true),
    ("/card/:id", true),
    ("/product/:id", true),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Redirect(&'static str),
}

fn matches(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.split('/').filter(|s| !s.is_empty());
    let mut path_segments = path.split('/').filter(|s| !s.is_empty());
    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) if p.starts_with(':') || p == s => continue,
            _ => return false,
        }
    }
}

/// Whether `path` needs a session. `None` for routes the app does not know.
pub fn requires_auth(path: &str) -> Option<bool> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    ROUTES
        .iter()
        .find(|(pattern, _)| matches(pattern, path))
        .map(|(_, protected)| *protected)
}

/// Decide whether navigation to `path` may proceed.
pub fn guard(path: &str, is_authenticated: bool) -> RouteDecision {
    if path.trim_matches('/').is_empty() {
        return RouteDecision::Redirect(LOGIN_ROUTE);
    }
    match requires_auth(path) {
        Some(true) if !is_authenticated => RouteDecision::Redirect(LOGIN_ROUTE),
        _ => RouteDecision::Allow,
    }
}
