use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    error::{RateLimitError, Result},
    headers::Reply,
    limiter::RateLimiter,
    metrics::Metrics,
    request::{RequestInfo, RouteInfo},
};

/// Runs every registered limiter against a request.
///
/// Limiters are evaluated in registration order. Headers from admitted checks
/// accumulate, later ones overwriting earlier ones, and the first rejection
/// ends the evaluation.
pub struct RateLimitService {
    limiters: Arc<RwLock<Vec<Arc<RateLimiter>>>>,
    metrics: Arc<Metrics>,
}

impl RateLimitService {
    /// Create a new rate limit service
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            limiters: Arc::new(RwLock::new(Vec::new())),
            metrics,
        }
    }

    /// Add a limiter after the ones already registered.
    ///
    /// Limiters may share a backend, so each one needs its own name space.
    pub async fn add_limiter(&self, limiter: RateLimiter) -> Result<()> {
        let mut limiters = self.limiters.write().await;
        if limiters
            .iter()
            .any(|registered| registered.name_space() == limiter.name_space())
        {
            warn!(name_space = %limiter.name_space(), "Duplicate rate limiter name space");
            return Err(RateLimitError::Config(format!(
                "A rate limiter with name space `{}` is already registered",
                limiter.name_space()
            )));
        }

        limiters.push(Arc::new(limiter.with_metrics(self.metrics.clone())));
        debug!(count = limiters.len(), "Registered rate limiter");
        Ok(())
    }

    pub async fn limiter_count(&self) -> usize {
        self.limiters.read().await.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Check a request against every limiter
    pub async fn handle(&self, route: &RouteInfo, request: &dyn RequestInfo) -> Result<Reply> {
        let _timer = self.metrics.start_request_timer();
        let limiters: Vec<Arc<RateLimiter>> = self.limiters.read().await.clone();

        let mut combined = Reply::pass();
        for limiter in limiters {
            let reply = limiter.respond(route, request).await?;
            let rejected = reply.is_rejected();

            combined.headers.extend(reply.headers);
            if rejected {
                combined.status = reply.status;
                combined.body = reply.body;
                return Ok(combined);
            }
        }

        Ok(combined)
    }

    /// Health check for every limiter's store
    pub async fn health_check(&self) -> Result<()> {
        let limiters = self.limiters.read().await.clone();
        for limiter in limiters {
            limiter.health_check().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RateLimitOptions,
        store::{CounterStore, LocalStore},
    };
    use http::StatusCode;

    fn create_test_service() -> RateLimitService {
        RateLimitService::new(Arc::new(Metrics::new().unwrap()))
    }

    fn request() -> crate::request::IncomingRequest {
        crate::request::IncomingRequest::new(Some("127.0.0.1".parse().unwrap()))
    }

    #[tokio::test]
    async fn test_service_without_limiters_passes() {
        let service = create_test_service();
        let reply = service.handle(&RouteInfo::new("GET", "/"), &request()).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply.headers.is_empty());
        service.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_rejection_wins() {
        let service = create_test_service();
        let backend: Arc<dyn CounterStore> = Arc::new(LocalStore::default());

        let strict = RateLimiter::new(
            RateLimitOptions::new().max(1).name_space("strict-"),
            backend.clone(),
        )
        .unwrap();
        let relaxed = RateLimiter::new(
            RateLimitOptions::new().max(100).name_space("relaxed-").enable_draft_spec(true),
            backend,
        )
        .unwrap();
        service.add_limiter(strict).await.unwrap();
        service.add_limiter(relaxed).await.unwrap();
        assert_eq!(service.limiter_count().await, 2);

        let route = RouteInfo::new("GET", "/");
        let reply = service.handle(&route, &request()).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers["x-ratelimit-limit"], "1");
        assert_eq!(reply.headers["ratelimit-limit"], "100");

        let reply = service.handle(&route, &request()).await.unwrap();
        assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(reply.headers.get("ratelimit-remaining").is_none());

        let families = service.metrics().registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ratelimit_decisions_total"));
    }

    #[tokio::test]
    async fn test_shared_backend_requires_distinct_name_spaces() {
        let service = create_test_service();
        let backend: Arc<dyn CounterStore> = Arc::new(LocalStore::default());

        let first = RateLimiter::new(RateLimitOptions::new().max(2), backend.clone()).unwrap();
        let second = RateLimiter::new(RateLimitOptions::new().max(100), backend.clone()).unwrap();
        service.add_limiter(first).await.unwrap();
        let err = service.add_limiter(second).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
        assert_eq!(service.limiter_count().await, 1);

        let second = RateLimiter::new(
            RateLimitOptions::new().max(100).name_space("secondary-"),
            backend,
        )
        .unwrap();
        service.add_limiter(second).await.unwrap();

        let route = RouteInfo::new("GET", "/");
        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(service.handle(&route, &request()).await.unwrap().status);
        }
        assert_eq!(
            statuses,
            [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
        );
    }
}
