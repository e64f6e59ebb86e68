//! Request identity resolution.
//!
//! Buckets are partitioned per caller. The caller is identified, in order of
//! preference, by the authenticated subject, an API key, or the remote
//! address.

use http::header::HeaderName;
use http::{Extensions, HeaderMap};
use std::net::IpAddr;

/// Longest identity written to logs before truncation.
pub const MAX_LOGGED_IDENTITY_LEN: usize = 64;

/// Default header carrying an API key.
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// Who a request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// An authenticated user id
    User(String),
    /// An API key
    ApiKey(String),
    /// A remote address
    Address(String),
    /// Nothing identifying was found
    Anonymous,
}

impl Identity {
    /// The identity as used in bucket keys.
    pub fn as_key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{}", id),
            Identity::ApiKey(key) => format!("api:{}", key),
            Identity::Address(addr) => format!("ip:{}", addr),
            Identity::Anonymous => "anonymous".to_string(),
        }
    }

    /// A form of the identity that is safe to log.
    ///
    /// API keys are never shown. Other identities longer than
    /// [`MAX_LOGGED_IDENTITY_LEN`] characters are truncated.
    pub fn redacted(&self) -> String {
        match self {
            Identity::ApiKey(_) => "api:[redacted]".to_string(),
            other => truncate_for_log(&other.as_key()),
        }
    }
}

fn truncate_for_log(value: &str) -> String {
    match value.char_indices().nth(MAX_LOGGED_IDENTITY_LEN) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

/// Request extension set by authentication middleware for a verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Request extension carrying the peer address of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub IpAddr);

/// Decides which identity a request is attributed to.
///
/// Any `Fn(&HeaderMap, &Extensions) -> Identity` closure is a resolver.
pub trait IdentityResolver: Send + Sync + 'static {
    /// Resolve the identity from request headers and extensions.
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> Identity;
}

impl<F> IdentityResolver for F
where
    F: Fn(&HeaderMap, &Extensions) -> Identity + Send + Sync + 'static,
{
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> Identity {
        self(headers, extensions)
    }
}

/// The standard resolver.
///
/// Looks at, in order: [`AuthenticatedSubject`], the API key header,
/// [`RemoteAddr`], the first `X-Forwarded-For` entry, and `X-Real-IP`.
#[derive(Debug, Clone)]
pub struct DefaultIdentityResolver {
    api_key_header: HeaderName,
}

impl DefaultIdentityResolver {
    /// Create a resolver reading API keys from `x-api-key`.
    pub fn new() -> Self {
        Self {
            api_key_header: HeaderName::from_static(DEFAULT_API_KEY_HEADER),
        }
    }

    /// Read API keys from a different header.
    pub fn with_api_key_header(mut self, header: HeaderName) -> Self {
        self.api_key_header = header;
        self
    }
}

impl Default for DefaultIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl IdentityResolver for DefaultIdentityResolver {
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> Identity {
        if let Some(AuthenticatedSubject(subject)) = extensions.get::<AuthenticatedSubject>() {
            if !subject.is_empty() {
                return Identity::User(subject.clone());
            }
        }

        if let Some(key) = header_str(headers, self.api_key_header.as_str()) {
            return Identity::ApiKey(key.to_string());
        }

        if let Some(RemoteAddr(ip)) = extensions.get::<RemoteAddr>() {
            return Identity::Address(ip.to_string());
        }

        let forwarded = header_str(headers, "x-forwarded-for")
            .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()));
        if let Some(ip) = forwarded.or_else(|| header_str(headers, "x-real-ip")) {
            return Identity::Address(ip.to_string());
        }

        Identity::Anonymous
    }
}
