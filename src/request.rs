//! The request abstraction the engine evaluates.
//!
//! The engine never sees a framework request. Hosts hand it anything that
//! implements [`RequestInfo`]; [`IncomingRequest`] is a ready-made
//! implementation built from `http` request parts.

use std::fmt;
use std::net::IpAddr;

use http::{HeaderMap, HeaderName, HeaderValue};

/// Read-only view of an incoming unit of work
pub trait RequestInfo: Send + Sync {
    /// Network address of the caller, if the host knows it
    fn remote_addr(&self) -> Option<IpAddr>;

    /// Value of a request header, if present and valid UTF-8
    fn header(&self, name: &str) -> Option<&str>;
}

/// Identifies the route a rule is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteInfo {
    pub method: String,
    pub url: String,
}

impl RouteInfo {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
        }
    }
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.method, self.url)
    }
}

/// Owned request snapshot
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    remote_addr: Option<IpAddr>,
    headers: HeaderMap,
}

impl IncomingRequest {
    pub fn new(remote_addr: Option<IpAddr>) -> Self {
        Self {
            remote_addr,
            headers: HeaderMap::new(),
        }
    }

    /// Snapshot the headers of an `http` request.
    pub fn from_parts(parts: &http::request::Parts, remote_addr: Option<IpAddr>) -> Self {
        Self {
            remote_addr,
            headers: parts.headers.clone(),
        }
    }

    /// Add a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }
}

impl RequestInfo for IncomingRequest {
    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}
