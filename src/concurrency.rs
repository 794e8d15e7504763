//! In-flight ceilings.
//!
//! A tier's `max_concurrent` cannot be enforced by `consume` alone — the
//! admission contract carries no completion signal — so callers wrap the
//! work itself in a `ConcurrencyLimit`, the same way they wrap calls in a
//! circuit breaker. The permit is held for exactly the lifetime of the
//! wrapped future.

use crate::error::AdmissionError;
use crate::rate_limit::rules::RateLimitTier;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Semaphore-backed in-flight ceiling. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyLimit {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max: max_concurrent }
    }

    /// Guard for a tier's `max_concurrent`, when it has one.
    pub fn for_tier(tier: &RateLimitTier) -> Option<Self> {
        tier.max_concurrent.map(Self::new)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    /// Run `operation` if a permit is free, rejecting immediately otherwise.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, AdmissionError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = self.semaphore.try_acquire().map_err(|_| {
            AdmissionError::ConcurrencyExceeded { in_flight: self.in_flight(), max: self.max }
        })?;
        let result = operation().await;
        drop(permit);
        result.map_err(AdmissionError::Inner)
    }
}
