//! Effective rules and the literal-or-function parameters they are made of.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::RateLimitOptions,
    error::{RateLimitError, Result},
    headers::HeaderVisibility,
    limiter::RejectionContext,
    request::RequestInfo,
    utils::{DEFAULT_MAX, DEFAULT_TIME_WINDOW_MS},
};

/// Default key prefix for every counter created by a limiter
pub const DEFAULT_NAME_SPACE: &str = "ratelimit-";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type SyncFn<T> = dyn Fn(&dyn RequestInfo, &str) -> T + Send + Sync;
type AsyncFn<T> = dyn for<'a> Fn(&'a dyn RequestInfo, &'a str) -> BoxFuture<'a, T> + Send + Sync;

/// A rule parameter that is either a literal or computed per request from the
/// request and its key.
pub enum Param<T> {
    Constant(T),
    Sync(Arc<SyncFn<T>>),
    Async(Arc<AsyncFn<T>>),
}

impl<T> Param<T> {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &str) -> T + Send + Sync + 'static,
    {
        Param::Sync(Arc::new(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a dyn RequestInfo, &'a str) -> BoxFuture<'a, T> + Send + Sync + 'static,
    {
        Param::Async(Arc::new(f))
    }
}

impl<T: Clone + Send + Sync> Param<T> {
    /// Resolve the parameter for one request
    pub async fn evaluate(&self, request: &dyn RequestInfo, key: &str) -> T {
        match self {
            Param::Constant(value) => value.clone(),
            Param::Sync(f) => f(request, key),
            Param::Async(f) => f(request, key).await,
        }
    }
}

impl<T: Clone> Clone for Param<T> {
    fn clone(&self) -> Self {
        match self {
            Param::Constant(value) => Param::Constant(value.clone()),
            Param::Sync(f) => Param::Sync(f.clone()),
            Param::Async(f) => Param::Async(f.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Param<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Param::Sync(_) => f.write_str("Sync(<fn>)"),
            Param::Async(_) => f.write_str("Async(<fn>)"),
        }
    }
}

type KeyFn = dyn Fn(&dyn RequestInfo) -> String + Send + Sync;
type AsyncKeyFn = dyn for<'a> Fn(&'a dyn RequestInfo) -> BoxFuture<'a, String> + Send + Sync;

/// Computes the traffic key a request is counted against
#[derive(Clone, Default)]
pub enum KeyGenerator {
    /// The caller's network address
    #[default]
    RemoteAddr,
    /// A header value, falling back to the network address when absent
    Header(String),
    Sync(Arc<KeyFn>),
    Async(Arc<AsyncKeyFn>),
}

impl KeyGenerator {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestInfo) -> String + Send + Sync + 'static,
    {
        KeyGenerator::Sync(Arc::new(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a dyn RequestInfo) -> BoxFuture<'a, String> + Send + Sync + 'static,
    {
        KeyGenerator::Async(Arc::new(f))
    }

    pub async fn generate(&self, request: &dyn RequestInfo) -> String {
        match self {
            KeyGenerator::RemoteAddr => remote_addr_key(request),
            KeyGenerator::Header(name) => request
                .header(name)
                .map(str::to_owned)
                .unwrap_or_else(|| remote_addr_key(request)),
            KeyGenerator::Sync(f) => f(request),
            KeyGenerator::Async(f) => f(request).await,
        }
    }
}

fn remote_addr_key(request: &dyn RequestInfo) -> String {
    request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGenerator::RemoteAddr => f.write_str("RemoteAddr"),
            KeyGenerator::Header(name) => f.debug_tuple("Header").field(name).finish(),
            KeyGenerator::Sync(_) => f.write_str("Sync(<fn>)"),
            KeyGenerator::Async(_) => f.write_str("Async(<fn>)"),
        }
    }
}

/// Keys exempt from counting
#[derive(Debug, Clone)]
pub enum AllowList {
    Keys(HashSet<String>),
    Predicate(Param<bool>),
}

impl AllowList {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &str) -> bool + Send + Sync + 'static,
    {
        AllowList::Predicate(Param::from_fn(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a dyn RequestInfo, &'a str) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        AllowList::Predicate(Param::from_async(f))
    }

    pub async fn contains(&self, request: &dyn RequestInfo, key: &str) -> bool {
        match self {
            AllowList::Keys(keys) => keys.contains(key),
            AllowList::Predicate(predicate) => predicate.evaluate(request, key).await,
        }
    }
}

pub type HookResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Side-effecting callback fired while a decision is being made.
///
/// A failing hook is logged and never changes the decision.
#[derive(Clone)]
pub struct Hook(Arc<dyn Fn(&dyn RequestInfo, &str) -> HookResult + Send + Sync>);

impl Hook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &str) -> HookResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn fire(&self, name: &'static str, request: &dyn RequestInfo, key: &str) {
        if let Err(error) = (self.0)(request, key) {
            warn!(hook = name, key = %key, error = %error, "Rate limit hook failed");
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(<fn>)")
    }
}

/// Replaces the default `{ statusCode, error, message }` rejection body
#[derive(Clone)]
pub struct ErrorResponseBuilder(
    Arc<dyn Fn(&dyn RequestInfo, &RejectionContext) -> serde_json::Value + Send + Sync>,
);

impl ErrorResponseBuilder {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &RejectionContext) -> serde_json::Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn build(&self, request: &dyn RequestInfo, context: &RejectionContext) -> serde_json::Value {
        (self.0)(request, context)
    }
}

impl fmt::Debug for ErrorResponseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorResponseBuilder(<fn>)")
    }
}

/// Lifecycle stage a host should run the check at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookStage {
    #[default]
    OnRequest,
    PreParsing,
    PreValidation,
    PreHandler,
}

/// The effective rule for one route, with every default applied.
///
/// Built once at registration and shared read-only between requests.
#[derive(Debug, Clone)]
pub struct Rule {
    pub max: Param<u64>,
    pub time_window: Param<u64>,
    pub ban: Option<u64>,
    pub continue_exceeding: bool,
    pub exponential_backoff: bool,
    pub group_id: Option<String>,
    pub key_generator: KeyGenerator,
    pub allow_list: Option<AllowList>,
    pub name_space: String,
    pub skip_on_error: bool,
    pub global: bool,
    pub hook: HookStage,
    pub enable_draft_spec: bool,
    pub add_headers: HeaderVisibility,
    pub add_headers_on_exceeding: HeaderVisibility,
    pub exceeded_status_code: StatusCode,
    pub banned_status_code: StatusCode,
    pub error_response_builder: Option<ErrorResponseBuilder>,
    pub on_exceeding: Option<Hook>,
    pub on_exceeded: Option<Hook>,
    pub on_ban_reach: Option<Hook>,
}

impl Rule {
    /// Apply defaults to a set of options and validate the result
    pub fn from_options(options: &RateLimitOptions) -> Result<Self> {
        let name_space = options
            .name_space
            .clone()
            .unwrap_or_else(|| DEFAULT_NAME_SPACE.to_string());
        if name_space.is_empty() {
            return Err(RateLimitError::Config(
                "name_space must not be empty".to_string(),
            ));
        }

        if let Some(group_id) = &options.group_id {
            if group_id.is_empty() {
                return Err(RateLimitError::Config(
                    "group_id must not be empty".to_string(),
                ));
            }
        }

        let exceeded_status_code =
            rejection_status(options.exceeded_status_code, StatusCode::TOO_MANY_REQUESTS)?;
        let banned_status_code =
            rejection_status(options.banned_status_code, StatusCode::FORBIDDEN)?;

        Ok(Self {
            max: options.max.clone().unwrap_or(Param::Constant(DEFAULT_MAX)),
            time_window: options
                .time_window
                .clone()
                .unwrap_or(Param::Constant(DEFAULT_TIME_WINDOW_MS)),
            ban: options.ban,
            continue_exceeding: options.continue_exceeding.unwrap_or(false),
            exponential_backoff: options.exponential_backoff.unwrap_or(false),
            group_id: options.group_id.clone(),
            key_generator: options.key_generator.clone().unwrap_or_default(),
            allow_list: options.allow_list.clone(),
            name_space,
            skip_on_error: options.skip_on_error.unwrap_or(false),
            global: options.global.unwrap_or(true),
            hook: options.hook.unwrap_or_default(),
            enable_draft_spec: options.enable_draft_spec.unwrap_or(false),
            add_headers: options.add_headers.clone(),
            add_headers_on_exceeding: options.add_headers_on_exceeding.clone(),
            exceeded_status_code,
            banned_status_code,
            error_response_builder: options.error_response_builder.clone(),
            on_exceeding: options.on_exceeding.clone(),
            on_exceeded: options.on_exceeded.clone(),
            on_ban_reach: options.on_ban_reach.clone(),
        })
    }
}

fn rejection_status(code: Option<u16>, default: StatusCode) -> Result<StatusCode> {
    let Some(code) = code else {
        return Ok(default);
    };

    match StatusCode::from_u16(code) {
        Ok(status) if status.is_client_error() || status.is_server_error() => Ok(status),
        _ => Err(RateLimitError::Config(format!(
            "Rejection status code must be 4xx or 5xx, got {code}"
        ))),
    }
}
