//! Tower middleware over the limiter.
//!
//! `AdmissionLayer` wraps any tower service: a caller-supplied extractor
//! turns the request into a [`RequestContext`], the limiter decides, and
//! denials surface as typed [`AdmissionError`]s instead of responses —
//! mapping to status codes and headers stays the adapter's job.

use crate::error::AdmissionError;
use crate::rate_limit::limiter::RateLimiter;
use crate::rate_limit::RequestContext;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates requests through a shared [`RateLimiter`].
pub struct AdmissionLayer<F> {
    limiter: Arc<RateLimiter>,
    extract: Arc<F>,
    cost: f64,
}

impl<F> AdmissionLayer<F> {
    pub fn new(limiter: Arc<RateLimiter>, extract: F) -> Self {
        Self { limiter, extract: Arc::new(extract), cost: 1.0 }
    }

    /// Charge every request a fixed cost other than the default 1.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

impl<F> Clone for AdmissionLayer<F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extract: self.extract.clone(), cost: self.cost }
    }
}

impl<S, F> Layer<S> for AdmissionLayer<F> {
    type Service = AdmissionService<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
            cost: self.cost,
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, F> {
    inner: S,
    limiter: Arc<RateLimiter>,
    extract: Arc<F>,
    cost: f64,
}

impl<S: Clone, F> Clone for AdmissionService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
            cost: self.cost,
        }
    }
}

impl<S, F, Req> Service<Req> for AdmissionService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    F: Fn(&Req) -> RequestContext + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = (self.extract)(&req);
        let limiter = self.limiter.clone();
        let cost = self.cost;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match limiter.consume(&ctx, cost).await {
                Ok(decision) if decision.allowed => {
                    inner.call(req).await.map_err(AdmissionError::Inner)
                }
                Ok(decision) => Err(AdmissionError::RateLimitExceeded {
                    retry_after: decision.retry_after.unwrap_or_default(),
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "rate limit exceeded".to_string()),
                }),
                Err(e) => Err(e.widen()),
            }
        })
    }
}
