//! Projection of decisions onto response status, headers and body.

use http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    limiter::{Outcome, RejectionContext},
    rule::Rule,
};

/// Header names used for one of the two header styles
#[derive(Debug, Clone)]
pub struct HeaderLabels {
    pub limit: HeaderName,
    pub remaining: HeaderName,
    pub reset: HeaderName,
    pub retry_after: HeaderName,
}

impl HeaderLabels {
    pub fn legacy() -> Self {
        Self {
            limit: HeaderName::from_static("x-ratelimit-limit"),
            remaining: HeaderName::from_static("x-ratelimit-remaining"),
            reset: HeaderName::from_static("x-ratelimit-reset"),
            retry_after: HeaderName::from_static("retry-after"),
        }
    }

    pub fn draft() -> Self {
        Self {
            limit: HeaderName::from_static("ratelimit-limit"),
            remaining: HeaderName::from_static("ratelimit-remaining"),
            reset: HeaderName::from_static("ratelimit-reset"),
            retry_after: HeaderName::from_static("retry-after"),
        }
    }

    pub fn for_rule(rule: &Rule) -> Self {
        if rule.enable_draft_spec {
            Self::draft()
        } else {
            Self::legacy()
        }
    }
}

/// Which headers to emit. Unset flags count as enabled.
///
/// Accepts both the field names and the header labels as keys, so
/// `retry-after: false` and `retry_after: false` mean the same thing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderVisibility {
    #[serde(
        alias = "x-ratelimit-limit",
        alias = "ratelimit-limit",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit: Option<bool>,
    #[serde(
        alias = "x-ratelimit-remaining",
        alias = "ratelimit-remaining",
        skip_serializing_if = "Option::is_none"
    )]
    pub remaining: Option<bool>,
    #[serde(
        alias = "x-ratelimit-reset",
        alias = "ratelimit-reset",
        skip_serializing_if = "Option::is_none"
    )]
    pub reset: Option<bool>,
    #[serde(alias = "retry-after", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<bool>,
}

impl HeaderVisibility {
    pub fn with_limit(mut self, enabled: bool) -> Self {
        self.limit = Some(enabled);
        self
    }

    pub fn with_remaining(mut self, enabled: bool) -> Self {
        self.remaining = Some(enabled);
        self
    }

    pub fn with_reset(mut self, enabled: bool) -> Self {
        self.reset = Some(enabled);
        self
    }

    pub fn with_retry_after(mut self, enabled: bool) -> Self {
        self.retry_after = Some(enabled);
        self
    }

    /// Flags set in `overrides` win, the rest keep their current value
    pub fn merge(&self, overrides: &HeaderVisibility) -> HeaderVisibility {
        HeaderVisibility {
            limit: overrides.limit.or(self.limit),
            remaining: overrides.remaining.or(self.remaining),
            reset: overrides.reset.or(self.reset),
            retry_after: overrides.retry_after.or(self.retry_after),
        }
    }
}

/// What a host should send back for one check
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Present only for rejections
    pub body: Option<serde_json::Value>,
}

impl Reply {
    pub fn pass() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.body.is_some()
    }
}

/// Turn an outcome into the status, headers and body the caller receives
pub fn project(outcome: &Outcome, rule: &Rule) -> Reply {
    let labels = HeaderLabels::for_rule(rule);

    match outcome {
        Outcome::Disabled | Outcome::Bypassed(_) => Reply::pass(),
        Outcome::Admitted(decision) => {
            let mut reply = Reply::pass();
            if let Some(usage) = &decision.usage {
                let visibility = &rule.add_headers_on_exceeding;
                insert_if(&mut reply.headers, visibility.limit, &labels.limit, usage.max);
                insert_if(&mut reply.headers, visibility.remaining, &labels.remaining, usage.remaining);
                insert_if(&mut reply.headers, visibility.reset, &labels.reset, usage.ttl_in_seconds);
            }
            reply
        }
        Outcome::Rejected(rejection) => {
            let visibility = &rule.add_headers;
            let ttl_in_seconds = rejection
                .decision
                .usage
                .as_ref()
                .map_or(0, |usage| usage.ttl_in_seconds);

            let mut headers = HeaderMap::new();
            insert_if(&mut headers, visibility.limit, &labels.limit, rejection.context.max);
            insert_if(&mut headers, visibility.remaining, &labels.remaining, 0);
            insert_if(&mut headers, visibility.reset, &labels.reset, ttl_in_seconds);
            insert_if(&mut headers, visibility.retry_after, &labels.retry_after, ttl_in_seconds);

            Reply {
                status: rejection.status(),
                headers,
                body: Some(rejection.body.clone()),
            }
        }
    }
}

fn insert_if(headers: &mut HeaderMap, flag: Option<bool>, name: &HeaderName, value: u64) {
    if flag.unwrap_or(true) {
        headers.insert(name.clone(), HeaderValue::from(value));
    }
}

/// Default rejection body: `{ statusCode, error, message }`
pub fn default_error_body(context: &RejectionContext) -> serde_json::Value {
    let error = StatusCode::from_u16(context.status_code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Error");

    json!({
        "statusCode": context.status_code,
        "error": error,
        "message": format!("Rate limit exceeded, retry in {}", context.after),
    })
}
