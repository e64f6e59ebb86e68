//! Tower middleware that gates requests through a [`RateLimiter`].

use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info, trace};

use super::identity::{DefaultIdentityResolver, IdentityResolver};
use crate::ratelimit::{Backend, Decision, RateLimiter, StorageBackend};

/// Layer that applies one rate limit rule to every request of a service.
pub struct RateLimitLayer<B: Backend = StorageBackend> {
    limiter: Arc<RateLimiter<B>>,
    rule: Arc<str>,
    cost: u64,
    resolver: Arc<dyn IdentityResolver>,
}

impl<B: Backend> Clone for RateLimitLayer<B> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            rule: self.rule.clone(),
            cost: self.cost,
            resolver: self.resolver.clone(),
        }
    }
}

impl<B: Backend> RateLimitLayer<B> {
    /// Gate requests under `rule`, one token each, with the default resolver.
    pub fn new(limiter: Arc<RateLimiter<B>>, rule: impl Into<String>) -> Self {
        Self {
            limiter,
            rule: Arc::from(rule.into()),
            cost: 1,
            resolver: Arc::new(DefaultIdentityResolver::new()),
        }
    }

    /// Charge `tokens` tokens per request.
    pub fn with_cost(mut self, tokens: u64) -> Self {
        self.cost = tokens;
        self
    }

    /// Attribute requests with a custom resolver.
    pub fn with_resolver<R: IdentityResolver>(mut self, resolver: R) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }
}

impl<S, B: Backend> Layer<S> for RateLimitLayer<B> {
    type Service = RateLimitService<S, B>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            rule: self.rule.clone(),
            cost: self.cost,
            resolver: self.resolver.clone(),
        }
    }
}

/// Rate limiting service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, B: Backend = StorageBackend> {
    inner: S,
    limiter: Arc<RateLimiter<B>>,
    rule: Arc<str>,
    cost: u64,
    resolver: Arc<dyn IdentityResolver>,
}

impl<S: Clone, B: Backend> Clone for RateLimitService<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            rule: self.rule.clone(),
            cost: self.cost,
            resolver: self.resolver.clone(),
        }
    }
}

impl<S, B, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, B>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    B: Backend + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let identity = self.resolver.resolve(request.headers(), request.extensions());
        let limiter = self.limiter.clone();
        let rule = self.rule.clone();
        let cost = self.cost;

        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter.consume_tokens(&rule, &identity.as_key(), cost).await;

            if !decision.allowed {
                info!(
                    identity = %identity.redacted(),
                    rule = %decision.rule_name,
                    retry_after = decision.retry_after,
                    "Request rate limited"
                );
                return Ok(throttled_response(&decision));
            }

            trace!(rule = %decision.rule_name, remaining = decision.remaining, "Request allowed");

            let mut response = inner.call(request).await?;
            apply_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

/// Write the decision's rate limit metadata onto a header map.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in decision.header_pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Build the 429 response for a denied decision.
///
/// The JSON body carries a message, the retry hint, and the rule applied.
pub fn throttled_response<ResBody: From<String>>(decision: &Decision) -> Response<ResBody> {
    let body = serde_json::json!({
        "error": "rate_limited",
        "message": format!(
            "Rate limit exceeded, retry in {} seconds",
            decision.retry_after
        ),
        "retry_after": decision.retry_after,
        "rule": decision.rule_name,
    });

    let mut response = Response::new(ResBody::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_headers(response.headers_mut(), decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::identity::{AuthenticatedSubject, Identity};
    use crate::ratelimit::{MemoryBackend, RuleSet, RuleSpec, DEFAULT_RULE};
    use http::Extensions;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn limiter(rules: Vec<(&str, RuleSpec)>) -> Arc<RateLimiter<MemoryBackend>> {
        Arc::new(RateLimiter::with_backend(
            true,
            RuleSet::normalize(rules),
            MemoryBackend::new(),
        ))
    }

    fn request(api_key: &str) -> Request<String> {
        Request::builder()
            .uri("/items")
            .header("x-api-key", api_key)
            .body(String::new())
            .unwrap()
    }

    async fn ok_handler(_req: Request<String>) -> Result<Response<String>, Infallible> {
        Ok(Response::new("ok".to_string()))
    }

    #[tokio::test]
    async fn test_allowed_request_is_annotated() {
        let layer = RateLimitLayer::new(limiter(vec![("ingest", RuleSpec::new(3.0, 0.001))]), "ingest");
        let service = layer.layer(service_fn(ok_handler));

        let response = service.oneshot(request("k1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok");
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "2");
        assert_eq!(response.headers()["x-ratelimit-rule"], "ingest");
        assert!(response.headers().get("retry-after").is_none());
    }

    #[tokio::test]
    async fn test_denied_request_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let inner = service_fn(move |_req: Request<String>| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new("ok".to_string())) }
        });

        let layer = RateLimitLayer::new(limiter(vec![("heavy_read", RuleSpec::new(1.0, 0.01))]), "heavy_read");
        let service = layer.layer(inner);

        let first = service.clone().oneshot(request("k1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = service.clone().oneshot(request("k1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let headers = second.headers();
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["x-ratelimit-limit"], "1");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-rule"], "heavy_read");
        let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!(retry_after >= 1);

        let body: serde_json::Value = serde_json::from_str(second.body()).unwrap();
        assert_eq!(body["rule"], "heavy_read");
        assert_eq!(body["retry_after"], retry_after);
        assert!(body["message"].as_str().unwrap().contains("retry"));
    }

    #[tokio::test]
    async fn test_identities_have_separate_buckets() {
        let layer = RateLimitLayer::new(limiter(vec![("api", RuleSpec::new(1.0, 0.001))]), "api");
        let service = layer.layer(service_fn(ok_handler));

        let a = service.clone().oneshot(request("k1")).await.unwrap();
        let b = service.clone().oneshot(request("k2")).await.unwrap();
        let a_again = service.clone().oneshot(request("k1")).await.unwrap();

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_unknown_rule_reports_default() {
        let layer = RateLimitLayer::new(limiter(vec![(DEFAULT_RULE, RuleSpec::new(5.0, 1.0))]), "missing");
        let service = layer.layer(service_fn(ok_handler));

        let response = service.oneshot(request("k1")).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-rule"], DEFAULT_RULE);
    }

    #[tokio::test]
    async fn test_cost_and_custom_resolver() {
        let limiter = limiter(vec![("upload", RuleSpec::new(10.0, 0.001))]);
        let layer = RateLimitLayer::new(limiter.clone(), "upload")
            .with_cost(4)
            .with_resolver(|_: &HeaderMap, extensions: &Extensions| {
                match extensions.get::<AuthenticatedSubject>() {
                    Some(subject) => Identity::User(subject.0.clone()),
                    None => Identity::Anonymous,
                }
            });
        let service = layer.layer(service_fn(ok_handler));

        let mut req = request("ignored");
        req.extensions_mut().insert(AuthenticatedSubject("bob".into()));
        let response = service.clone().oneshot(req).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-remaining"], "6");

        // The custom resolver put the tokens in bob's bucket.
        assert_eq!(limiter.consume("upload", "user:bob").await.remaining, 5);
    }

    #[tokio::test]
    async fn test_disabled_limiter_passes_through() {
        let limiter = Arc::new(RateLimiter::with_backend(
            false,
            RuleSet::normalize(vec![("api", RuleSpec::new(1.0, 0.001))]),
            MemoryBackend::new(),
        ));
        let service = RateLimitLayer::new(limiter, "api").layer(service_fn(ok_handler));

        for _ in 0..10 {
            let response = service.clone().oneshot(request("k1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[test]
    fn test_throttled_response_shape() {
        let decision = Decision {
            allowed: false,
            remaining: 0,
            retry_after: 30,
            capacity: 100,
            rule_name: "ingest".to_string(),
        };

        let response: Response<String> = throttled_response(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "30");
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["retry_after"], 30);
        assert_eq!(body["rule"], "ingest");
    }
}
