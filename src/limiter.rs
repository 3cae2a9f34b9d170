use std::{collections::HashMap, sync::Arc, time::Duration};

use http::StatusCode;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{RateLimitOptions, RouteRateLimit},
    error::Result,
    headers::{default_error_body, project, Reply},
    metrics::Metrics,
    request::{RequestInfo, RouteInfo},
    rule::Rule,
    store::{ChildOptions, Counter, CounterStore, IncrRequest},
    utils::{backoff_ttl, humanize_duration, ttl_in_seconds},
};

/// Counter snapshot attached to a counted decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub max: u64,
    pub time_window: u64,
    pub remaining: u64,
    pub ttl: u64,
    pub ttl_in_seconds: u64,
    pub is_exceeded: bool,
    pub is_banned: bool,
}

/// Result of evaluating one request against one rule.
///
/// Allow-listed requests carry no usage and serialize to `{ isAllowed, key }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub is_allowed: bool,
    pub key: String,
    #[serde(flatten)]
    pub usage: Option<Usage>,
}

impl Decision {
    pub fn allow_listed(key: String) -> Self {
        Self {
            is_allowed: true,
            key,
            usage: None,
        }
    }

    pub fn counted(key: String, usage: Usage) -> Self {
        Self {
            is_allowed: false,
            key,
            usage: Some(usage),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.usage.as_ref().is_some_and(|usage| usage.is_exceeded)
    }

    pub fn is_banned(&self) -> bool {
        self.usage.as_ref().is_some_and(|usage| usage.is_banned)
    }
}

/// Details handed to an error response builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionContext {
    pub status_code: u16,
    pub ban: bool,
    pub max: u64,
    pub ttl: u64,
    /// Human readable retry delay, e.g. `"1 minute"`
    pub after: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub decision: Decision,
    pub context: RejectionContext,
    pub body: serde_json::Value,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.context.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS)
    }
}

/// What the engine concluded for one request
#[derive(Debug, Clone)]
pub enum Outcome {
    /// No rule applies to the route
    Disabled,
    /// Key is allow-listed, nothing was counted
    Bypassed(Decision),
    Admitted(Decision),
    Rejected(Rejection),
}

impl Outcome {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Outcome::Disabled => None,
            Outcome::Bypassed(decision) | Outcome::Admitted(decision) => Some(decision),
            Outcome::Rejected(rejection) => Some(&rejection.decision),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }
}

enum Evaluation {
    AllowListed(String),
    Counted {
        key: String,
        max: u64,
        time_window: u64,
        /// `None` when the store failed and the failure was skipped
        counter: Option<Counter>,
    },
}

/// A rule bound to the store view it counts in
struct Limit {
    rule: Arc<Rule>,
    store: Arc<dyn CounterStore>,
    /// Full key prefix, used as the metrics label
    scope: String,
}

impl Limit {
    async fn evaluate(
        &self,
        request: &dyn RequestInfo,
        metrics: Option<&Metrics>,
    ) -> Result<Evaluation> {
        let key = self.rule.key_generator.generate(request).await;

        if let Some(allow_list) = &self.rule.allow_list {
            if allow_list.contains(request, &key).await {
                debug!(scope = %self.scope, key = %key, "Key is allow-listed");
                return Ok(Evaluation::AllowListed(key));
            }
        }

        let max = self.rule.max.evaluate(request, &key).await;
        let time_window = self.rule.time_window.evaluate(request, &key).await.max(1);

        let started = std::time::Instant::now();
        let result = self
            .store
            .incr(&key, IncrRequest { time_window_ms: time_window, max })
            .await;
        if let Some(metrics) = metrics {
            metrics.record_store_duration(&self.scope, started.elapsed().as_secs_f64());
        }

        let counter = match result {
            Ok(counter) => Some(counter),
            Err(e) if self.rule.skip_on_error => {
                warn!(scope = %self.scope, key = %key, error = %e, "Counter store failed, admitting request");
                if let Some(metrics) = metrics {
                    metrics.record_store_error(&self.scope, "skipped");
                }
                None
            }
            Err(e) => {
                error!(scope = %self.scope, key = %key, error = %e, "Counter store failed");
                if let Some(metrics) = metrics {
                    metrics.record_store_error(&self.scope, "propagated");
                }
                return Err(e);
            }
        };

        Ok(Evaluation::Counted {
            key,
            max,
            time_window,
            counter,
        })
    }

    fn decide(&self, key: String, max: u64, time_window: u64, counter: Option<Counter>) -> Decision {
        let Some(counter) = counter else {
            return Decision::counted(
                key,
                Usage {
                    max,
                    time_window,
                    remaining: max.saturating_sub(1),
                    ttl: 0,
                    ttl_in_seconds: 0,
                    is_exceeded: false,
                    is_banned: false,
                },
            );
        };

        let is_exceeded = counter.current > max;
        let exceeding = counter.current.saturating_sub(max);
        let is_banned = is_exceeded && self.rule.ban.is_some_and(|ban| exceeding > ban);
        let ttl = if is_exceeded && self.rule.exponential_backoff {
            backoff_ttl(time_window, exceeding - 1)
        } else {
            counter.ttl_ms
        };

        Decision::counted(
            key,
            Usage {
                max,
                time_window,
                remaining: max.saturating_sub(counter.current),
                ttl,
                ttl_in_seconds: ttl_in_seconds(ttl),
                is_exceeded,
                is_banned,
            },
        )
    }

    async fn check(&self, request: &dyn RequestInfo, metrics: Option<&Metrics>) -> Result<Decision> {
        let decision = match self.evaluate(request, metrics).await? {
            Evaluation::AllowListed(key) => Decision::allow_listed(key),
            Evaluation::Counted {
                key,
                max,
                time_window,
                counter,
            } => self.decide(key, max, time_window, counter),
        };
        if let Some(metrics) = metrics {
            metrics.record_outcome(&self.scope, outcome_label(&decision));
        }
        Ok(decision)
    }

    async fn admit(&self, request: &dyn RequestInfo, metrics: Option<&Metrics>) -> Result<Outcome> {
        let decision = self.check(request, metrics).await?;
        let rule = &self.rule;

        let Some(usage) = decision.usage.clone() else {
            return Ok(Outcome::Bypassed(decision));
        };

        if !usage.is_exceeded {
            if let Some(hook) = &rule.on_exceeding {
                hook.fire("on_exceeding", request, &decision.key);
            }
            return Ok(Outcome::Admitted(decision));
        }

        if let Some(hook) = &rule.on_exceeded {
            hook.fire("on_exceeded", request, &decision.key);
        }
        if usage.is_banned {
            if let Some(hook) = &rule.on_ban_reach {
                hook.fire("on_ban_reach", request, &decision.key);
            }
        }

        let status = if usage.is_banned {
            rule.banned_status_code
        } else {
            rule.exceeded_status_code
        };
        let context = RejectionContext {
            status_code: status.as_u16(),
            ban: usage.is_banned,
            max: usage.max,
            ttl: usage.ttl,
            after: humanize_duration(Duration::from_secs(usage.ttl_in_seconds)),
            key: decision.key.clone(),
        };
        let body = match &rule.error_response_builder {
            Some(builder) => builder.build(request, &context),
            None => default_error_body(&context),
        };

        info!(
            scope = %self.scope,
            key = %decision.key,
            status = context.status_code,
            ttl_ms = usage.ttl,
            "Request rejected by rate limit"
        );

        Ok(Outcome::Rejected(Rejection {
            decision,
            context,
            body,
        }))
    }
}

fn outcome_label(decision: &Decision) -> &'static str {
    if decision.is_banned() {
        "banned"
    } else if decision.is_exceeded() {
        "exceeded"
    } else if decision.usage.is_none() {
        "allow_listed"
    } else {
        "admitted"
    }
}

/// One rate limiter registration: a global rule, per-route overrides and the
/// store they count in.
pub struct RateLimiter {
    options: RateLimitOptions,
    store: Arc<dyn CounterStore>,
    global: Arc<Limit>,
    routes: HashMap<RouteInfo, Option<Arc<Limit>>>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    /// Create a limiter whose counters live in `backend` under the rule's name space
    pub fn new(options: RateLimitOptions, backend: Arc<dyn CounterStore>) -> Result<Self> {
        let rule = Rule::from_options(&options)?;
        let store = backend.child(&ChildOptions {
            scope: rule.name_space.clone(),
            continue_exceeding: Some(rule.continue_exceeding),
        });

        info!(
            name_space = %rule.name_space,
            global = rule.global,
            "Rate limiter created"
        );

        let global = Arc::new(Limit {
            scope: rule.name_space.clone(),
            rule: Arc::new(rule),
            store: store.clone(),
        });

        Ok(Self {
            options,
            store,
            global,
            routes: HashMap::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Prefix every counter of this limiter is stored under
    pub fn name_space(&self) -> &str {
        &self.global.rule.name_space
    }

    /// Resolve and store the effective rule for a route.
    ///
    /// Route overrides count in their own scope: the group id when one is
    /// set, otherwise the route's method and url.
    pub fn register_route(&mut self, route: RouteInfo, config: RouteRateLimit) -> Result<()> {
        let limit = match config {
            RouteRateLimit::Disabled => None,
            RouteRateLimit::Inherit => self.global.rule.global.then(|| self.global.clone()),
            RouteRateLimit::Override(route_options) => {
                let rule = Rule::from_options(&self.options.merge(&route_options))?;
                let scope = match &rule.group_id {
                    Some(group_id) => format!("{group_id}-"),
                    None => format!("{route}-"),
                };
                let store = self.store.child(&ChildOptions {
                    scope: scope.clone(),
                    continue_exceeding: Some(rule.continue_exceeding),
                });
                Some(Arc::new(Limit {
                    scope: format!("{}{}", self.global.scope, scope),
                    rule: Arc::new(rule),
                    store,
                }))
            }
        };

        debug!(route = %route, enabled = limit.is_some(), "Registered route rate limit");
        if let Some(metrics) = &self.metrics {
            metrics.record_route_registration(if limit.is_some() { "limited" } else { "disabled" });
        }
        self.routes.insert(route, limit);
        Ok(())
    }

    fn limit_for(&self, route: &RouteInfo) -> Option<Arc<Limit>> {
        match self.routes.get(route) {
            Some(limit) => limit.clone(),
            None => self.global.rule.global.then(|| self.global.clone()),
        }
    }

    /// Effective rule for a route, `None` when the route is not limited
    pub fn rule_for(&self, route: &RouteInfo) -> Option<Arc<Rule>> {
        self.limit_for(route).map(|limit| limit.rule.clone())
    }

    /// Count the request and decide whether it may proceed
    pub async fn check(&self, route: &RouteInfo, request: &dyn RequestInfo) -> Result<Outcome> {
        match self.limit_for(route) {
            Some(limit) => limit.admit(request, self.metrics.as_deref()).await,
            None => Ok(Outcome::Disabled),
        }
    }

    /// [`Self::check`] projected onto status, headers and body
    pub async fn respond(&self, route: &RouteInfo, request: &dyn RequestInfo) -> Result<Reply> {
        let Some(limit) = self.limit_for(route) else {
            return Ok(Reply::pass());
        };
        let outcome = limit.admit(request, self.metrics.as_deref()).await?;
        Ok(project(&outcome, &limit.rule))
    }

    /// Build a standalone checker that runs the decision pipeline without
    /// hooks, headers or rejection bodies.
    ///
    /// Without options it shares the global rule and counters. With options
    /// they are merged over the global ones and counted in their own scope:
    /// the group id when set, otherwise `manual`.
    pub fn create_rate_limit(&self, options: Option<RateLimitOptions>) -> Result<ManualCheck> {
        let limit = match options {
            None => self.global.clone(),
            Some(options) => {
                let rule = Rule::from_options(&self.options.merge(&options))?;
                let scope = format!("{}-", rule.group_id.as_deref().unwrap_or("manual"));
                let store = self.store.child(&ChildOptions {
                    scope: scope.clone(),
                    continue_exceeding: Some(rule.continue_exceeding),
                });
                Arc::new(Limit {
                    scope: format!("{}{}", self.global.scope, scope),
                    rule: Arc::new(rule),
                    store,
                })
            }
        };

        Ok(ManualCheck {
            limit,
            metrics: self.metrics.clone(),
        })
    }

    /// Health check for the limiter's store
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

/// Programmatic check returned by [`RateLimiter::create_rate_limit`]
#[derive(Clone)]
pub struct ManualCheck {
    limit: Arc<Limit>,
    metrics: Option<Arc<Metrics>>,
}

impl ManualCheck {
    pub async fn check(&self, request: &dyn RequestInfo) -> Result<Decision> {
        self.limit.check(request, self.metrics.as_deref()).await
    }
}
