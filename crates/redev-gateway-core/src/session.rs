use std::fmt::{Debug, Formatter};

/// Cookie that carries the opaque bearer token unless configured otherwise.
pub const DEFAULT_SESSION_COOKIE: &str = "token";

/// Opaque bearer token. Never parsed, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn bearer_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl Debug for SessionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// Per-request session. `Unauthenticated` is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    Authenticated(SessionToken),
    Unauthenticated,
}

impl Session {
    #[must_use]
    pub fn token(&self) -> Option<&SessionToken> {
        match self {
            Self::Authenticated(token) => Some(token),
            Self::Unauthenticated => None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// Builds a session directly from a token value, e.g. one read from an
    /// environment variable by an operator tool.
    #[must_use]
    pub fn from_token(value: &str) -> Self {
        match normalize_token(value) {
            Some(token) => Self::Authenticated(SessionToken(token)),
            None => Self::Unauthenticated,
        }
    }
}

/// Extracts the session token from request cookie headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResolver {
    cookie_name: String,
}

impl Default for SessionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_COOKIE)
    }
}

impl SessionResolver {
    #[must_use]
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Resolves the session from every `Cookie` header value on the request.
    ///
    /// The first cookie with the configured name and a usable value wins.
    /// Empty or non-printable values are skipped; if none is usable the
    /// session is [`Session::Unauthenticated`].
    pub fn resolve<'a, I>(&self, cookie_headers: I) -> Session
    where
        I: IntoIterator<Item = &'a str>,
    {
        for header in cookie_headers {
            for pair in header.split(';') {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                if name.trim() != self.cookie_name {
                    continue;
                }
                if let Some(token) = normalize_token(value) {
                    return Session::Authenticated(SessionToken(token));
                }
            }
        }
        Session::Unauthenticated
    }
}

fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(trimmed);
    if unquoted.is_empty() {
        return None;
    }
    // The token is replayed verbatim in an Authorization header.
    if !unquoted.bytes().all(|byte| byte.is_ascii_graphic()) {
        return None;
    }
    Some(unquoted.to_string())
}
