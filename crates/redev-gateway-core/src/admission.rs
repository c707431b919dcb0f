use crate::Session;

pub const DEFAULT_LOGIN_PATH: &str = "/login";
pub const DEFAULT_PUBLIC_PREFIXES: [&str; 5] =
    ["/login", "/register", "/v1/health", "/_next/", "/favicon.ico"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Proceed,
    RedirectToLogin { location: String },
}

/// Coarse check for browser navigations, run before per-operation policy.
///
/// Only navigations are redirected. API calls without a session proceed and
/// are rejected by the gateway with `unauthenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    login_path: String,
    public_prefixes: Vec<String>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_LOGIN_PATH,
            DEFAULT_PUBLIC_PREFIXES.iter().map(|prefix| (*prefix).to_string()),
        )
    }
}

impl AdmissionPolicy {
    #[must_use]
    pub fn new(
        login_path: impl Into<String>,
        public_prefixes: impl IntoIterator<Item = String>,
    ) -> Self {
        let login_path = login_path.into();
        let mut public_prefixes: Vec<String> = public_prefixes.into_iter().collect();
        if !public_prefixes.contains(&login_path) {
            public_prefixes.push(login_path.clone());
        }
        Self {
            login_path,
            public_prefixes,
        }
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn is_public(&self, path: &str) -> bool {
        self.public_prefixes.iter().any(|prefix| {
            if prefix.ends_with('/') {
                path.starts_with(prefix.as_str())
            } else {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        })
    }

    #[must_use]
    pub fn decide(
        &self,
        path: &str,
        query: Option<&str>,
        is_navigation: bool,
        session: &Session,
    ) -> AdmissionDecision {
        if session.is_authenticated() || !is_navigation || self.is_public(path) {
            return AdmissionDecision::Proceed;
        }
        let target = match query {
            Some(query) if !query.is_empty() => format!("{path}?{query}"),
            _ => path.to_string(),
        };
        AdmissionDecision::RedirectToLogin {
            location: format!("{}?next={}", self.login_path, encode_component(&target)),
        }
    }
}

fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'/') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
