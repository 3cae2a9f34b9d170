use serde::{Deserialize, Deserializer};

use crate::{
    error::{RateLimitError, Result},
    headers::HeaderVisibility,
    request::RequestInfo,
    rule::{AllowList, ErrorResponseBuilder, Hook, HookResult, HookStage, KeyGenerator, Param},
    utils::{max_from_f64, parse_time_window, window_from_f64},
};

/// Rate limit options as supplied by the host, globally or per route.
///
/// Every field is optional. Unset route fields inherit the global value and
/// unset global fields take the built-in defaults when the options are turned
/// into a [`crate::rule::Rule`]. Function-valued options cannot come from a
/// settings file and are set with the builder methods.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitOptions {
    #[serde(deserialize_with = "deserialize_max")]
    pub max: Option<Param<u64>>,
    #[serde(deserialize_with = "deserialize_time_window")]
    pub time_window: Option<Param<u64>>,
    pub ban: Option<u64>,
    pub continue_exceeding: Option<bool>,
    pub exponential_backoff: Option<bool>,
    pub group_id: Option<String>,
    #[serde(deserialize_with = "deserialize_key_generator")]
    pub key_generator: Option<KeyGenerator>,
    #[serde(deserialize_with = "deserialize_allow_list")]
    pub allow_list: Option<AllowList>,
    pub name_space: Option<String>,
    pub skip_on_error: Option<bool>,
    pub global: Option<bool>,
    pub hook: Option<HookStage>,
    pub enable_draft_spec: Option<bool>,
    pub add_headers: HeaderVisibility,
    pub add_headers_on_exceeding: HeaderVisibility,
    pub exceeded_status_code: Option<u16>,
    pub banned_status_code: Option<u16>,
    #[serde(skip)]
    pub error_response_builder: Option<ErrorResponseBuilder>,
    #[serde(skip)]
    pub on_exceeding: Option<Hook>,
    #[serde(skip)]
    pub on_exceeded: Option<Hook>,
    #[serde(skip)]
    pub on_ban_reach: Option<Hook>,
}

impl RateLimitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max(mut self, max: u64) -> Self {
        self.max = Some(Param::Constant(max));
        self
    }

    pub fn max_with(mut self, max: Param<u64>) -> Self {
        self.max = Some(max);
        self
    }

    /// Window length in milliseconds
    pub fn time_window(mut self, time_window_ms: u64) -> Self {
        self.time_window = window_from_f64(time_window_ms as f64).map(Param::Constant);
        self
    }

    /// Window given as text, e.g. `"1 minute"`. Unparseable text leaves the window unset.
    pub fn time_window_str(mut self, time_window: &str) -> Self {
        self.time_window = parse_time_window(time_window).map(Param::Constant);
        self
    }

    pub fn time_window_with(mut self, time_window: Param<u64>) -> Self {
        self.time_window = Some(time_window);
        self
    }

    pub fn ban(mut self, ban: u64) -> Self {
        self.ban = Some(ban);
        self
    }

    pub fn continue_exceeding(mut self, enabled: bool) -> Self {
        self.continue_exceeding = Some(enabled);
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = Some(enabled);
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = Some(key_generator);
        self
    }

    pub fn allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = Some(allow_list);
        self
    }

    pub fn name_space(mut self, name_space: impl Into<String>) -> Self {
        self.name_space = Some(name_space.into());
        self
    }

    pub fn skip_on_error(mut self, enabled: bool) -> Self {
        self.skip_on_error = Some(enabled);
        self
    }

    pub fn global(mut self, enabled: bool) -> Self {
        self.global = Some(enabled);
        self
    }

    pub fn hook(mut self, stage: HookStage) -> Self {
        self.hook = Some(stage);
        self
    }

    pub fn enable_draft_spec(mut self, enabled: bool) -> Self {
        self.enable_draft_spec = Some(enabled);
        self
    }

    pub fn add_headers(mut self, visibility: HeaderVisibility) -> Self {
        self.add_headers = visibility;
        self
    }

    pub fn add_headers_on_exceeding(mut self, visibility: HeaderVisibility) -> Self {
        self.add_headers_on_exceeding = visibility;
        self
    }

    pub fn exceeded_status_code(mut self, code: u16) -> Self {
        self.exceeded_status_code = Some(code);
        self
    }

    pub fn banned_status_code(mut self, code: u16) -> Self {
        self.banned_status_code = Some(code);
        self
    }

    pub fn error_response_builder<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &crate::limiter::RejectionContext) -> serde_json::Value
            + Send
            + Sync
            + 'static,
    {
        self.error_response_builder = Some(ErrorResponseBuilder::new(f));
        self
    }

    pub fn on_exceeding<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &str) -> HookResult + Send + Sync + 'static,
    {
        self.on_exceeding = Some(Hook::new(f));
        self
    }

    pub fn on_exceeded<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &str) -> HookResult + Send + Sync + 'static,
    {
        self.on_exceeded = Some(Hook::new(f));
        self
    }

    pub fn on_ban_reach<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestInfo, &str) -> HookResult + Send + Sync + 'static,
    {
        self.on_ban_reach = Some(Hook::new(f));
        self
    }

    /// Overlay route options on top of these (global) options.
    ///
    /// Fields set on the route win. Header visibility merges flag by flag.
    pub fn merge(&self, route: &RateLimitOptions) -> RateLimitOptions {
        RateLimitOptions {
            max: route.max.clone().or_else(|| self.max.clone()),
            time_window: route.time_window.clone().or_else(|| self.time_window.clone()),
            ban: route.ban.or(self.ban),
            continue_exceeding: route.continue_exceeding.or(self.continue_exceeding),
            exponential_backoff: route.exponential_backoff.or(self.exponential_backoff),
            group_id: route.group_id.clone().or_else(|| self.group_id.clone()),
            key_generator: route
                .key_generator
                .clone()
                .or_else(|| self.key_generator.clone()),
            allow_list: route.allow_list.clone().or_else(|| self.allow_list.clone()),
            name_space: route.name_space.clone().or_else(|| self.name_space.clone()),
            skip_on_error: route.skip_on_error.or(self.skip_on_error),
            global: route.global.or(self.global),
            hook: route.hook.or(self.hook),
            enable_draft_spec: route.enable_draft_spec.or(self.enable_draft_spec),
            add_headers: self.add_headers.merge(&route.add_headers),
            add_headers_on_exceeding: self
                .add_headers_on_exceeding
                .merge(&route.add_headers_on_exceeding),
            exceeded_status_code: route.exceeded_status_code.or(self.exceeded_status_code),
            banned_status_code: route.banned_status_code.or(self.banned_status_code),
            error_response_builder: route
                .error_response_builder
                .clone()
                .or_else(|| self.error_response_builder.clone()),
            on_exceeding: route.on_exceeding.clone().or_else(|| self.on_exceeding.clone()),
            on_exceeded: route.on_exceeded.clone().or_else(|| self.on_exceeded.clone()),
            on_ban_reach: route.on_ban_reach.clone().or_else(|| self.on_ban_reach.clone()),
        }
    }
}

/// Per-route rate limit configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub enum RouteRateLimit {
    /// No route-level value: use the global rule if `global` is on
    #[default]
    Inherit,
    /// Route explicitly opted out
    Disabled,
    /// Route-level overrides merged over the global options
    Override(RateLimitOptions),
}

impl TryFrom<serde_json::Value> for RouteRateLimit {
    type Error = RateLimitError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(RouteRateLimit::Inherit),
            serde_json::Value::Bool(false) => Ok(RouteRateLimit::Disabled),
            serde_json::Value::Object(_) => serde_json::from_value(value)
                .map(RouteRateLimit::Override)
                .map_err(|e| RateLimitError::Config(format!("Invalid route rate-limit options: {e}"))),
            _ => Err(RateLimitError::Config(
                "Unknown value for route rate-limit configuration".to_string(),
            )),
        }
    }
}

impl From<RateLimitOptions> for RouteRateLimit {
    fn from(options: RateLimitOptions) -> Self {
        RouteRateLimit::Override(options)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WindowSetting {
    Millis(f64),
    Text(String),
}

fn deserialize_max<'de, D>(deserializer: D) -> std::result::Result<Option<Param<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.and_then(max_from_f64).map(Param::Constant))
}

fn deserialize_time_window<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Param<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let window = match Option::<WindowSetting>::deserialize(deserializer)? {
        Some(WindowSetting::Millis(ms)) => window_from_f64(ms),
        Some(WindowSetting::Text(text)) => parse_time_window(&text),
        None => None,
    };
    Ok(window.map(Param::Constant))
}

/// `remote_addr` or `{ header: <name> }`
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyGeneratorSetting {
    Named(String),
    Header { header: String },
}

fn deserialize_key_generator<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<KeyGenerator>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<KeyGeneratorSetting>::deserialize(deserializer)? {
        None => Ok(None),
        Some(KeyGeneratorSetting::Named(name)) if name == "remote_addr" => {
            Ok(Some(KeyGenerator::RemoteAddr))
        }
        Some(KeyGeneratorSetting::Named(name)) => Err(serde::de::Error::custom(format!(
            "unknown key generator `{name}`"
        ))),
        Some(KeyGeneratorSetting::Header { header }) => Ok(Some(KeyGenerator::Header(header))),
    }
}

fn deserialize_allow_list<'de, D>(deserializer: D) -> std::result::Result<Option<AllowList>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.map(AllowList::keys))
}
