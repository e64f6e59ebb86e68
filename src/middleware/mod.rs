//! HTTP middleware that consults the rate limiter before calling a handler.
//!
//! Allowed requests pass through with `X-RateLimit-*` headers added to the
//! response. Denied requests get a 429 response with `Retry-After` and a
//! JSON body naming the rule.

mod identity;
mod layer;

pub use identity::{
    AuthenticatedSubject, DefaultIdentityResolver, Identity, IdentityResolver, RemoteAddr,
    DEFAULT_API_KEY_HEADER, MAX_LOGGED_IDENTITY_LEN,
};
pub use layer::{apply_headers, throttled_response, RateLimitLayer, RateLimitService};
