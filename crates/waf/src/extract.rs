//! Request value extraction
//!
//! Resolves declarative target expressions (`ARGS`, `HEADERS:Foo`, `BODY`,
//! ...) against a [`RequestContext`]. The recognized set is closed: an
//! unknown expression is a rule-load error, while a target whose scope is
//! not available in the current phase yields an empty value plus a debug
//! event — matching never fails a request.
//!
//! Redaction applies only to the *logged* form of a value. Matching always
//! operates on the raw value.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use palisade_common::PalisadeError;

use crate::request::RequestContext;
use crate::state::InspectionPhase;

/// Placeholder for sensitive values in logs
pub const REDACTED: &str = "<REDACTED>";

/// A declarative reference to a region of the request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleTarget {
    /// Full request target including query
    Uri,
    /// Request path only
    Path,
    /// Raw query string
    Query,
    /// Uppercase method
    Method,
    /// Derived client IP
    RemoteAddr,
    /// All headers as `name: value` lines
    Headers,
    /// Single header value (case-insensitive)
    Header(String),
    /// Raw Cookie header
    Cookies,
    /// Single cookie value
    Cookie(String),
    /// Decoded query parameters as `k=v&k=v`
    Args,
    /// Single decoded query value
    Arg(String),
    /// Buffered request body
    Body,
    /// Single URL-encoded form field
    Form(String),
    /// All response headers
    ResponseHeaders,
    /// Single response header value
    ResponseHeader(String),
    /// Buffered response body
    ResponseBody,
}

impl RuleTarget {
    /// The earliest phase in which this target carries data.
    pub fn min_phase(&self) -> InspectionPhase {
        match self {
            Self::Body | Self::Form(_) => InspectionPhase::RequestBody,
            Self::ResponseHeaders | Self::ResponseHeader(_) => InspectionPhase::ResponseHeaders,
            Self::ResponseBody => InspectionPhase::ResponseBody,
            _ => InspectionPhase::RequestHeaders,
        }
    }

    /// The field name subject to redaction, if this target names one.
    fn named_field(&self) -> Option<&str> {
        match self {
            Self::Header(name) | Self::Cookie(name) | Self::Form(name) | Self::Arg(name) => {
                Some(name)
            }
            _ => None,
        }
    }
}

impl FromStr for RuleTarget {
    type Err = PalisadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, name) = match s.split_once(':') {
            Some((base, name)) => (base, Some(name)),
            None => (s, None),
        };

        let target = match (base, name) {
            ("URI", None) => Self::Uri,
            ("PATH", None) => Self::Path,
            ("QUERY", None) => Self::Query,
            ("METHOD", None) => Self::Method,
            ("REMOTE_ADDR", None) => Self::RemoteAddr,
            ("HEADERS", None) => Self::Headers,
            ("HEADERS", Some(name)) => Self::Header(name.to_string()),
            ("COOKIES", None) => Self::Cookies,
            ("COOKIES", Some(name)) => Self::Cookie(name.to_string()),
            ("ARGS", None) => Self::Args,
            ("ARGS", Some(name)) => Self::Arg(name.to_string()),
            ("BODY", None) => Self::Body,
            ("FORM", Some(name)) => Self::Form(name.to_string()),
            ("RESPONSE_HEADERS", None) => Self::ResponseHeaders,
            ("RESPONSE_HEADERS", Some(name)) => Self::ResponseHeader(name.to_string()),
            ("RESPONSE_BODY", None) => Self::ResponseBody,
            _ => {
                return Err(PalisadeError::UnknownTarget {
                    target: s.to_string(),
                })
            }
        };
        Ok(target)
    }
}

impl fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uri => write!(f, "URI"),
            Self::Path => write!(f, "PATH"),
            Self::Query => write!(f, "QUERY"),
            Self::Method => write!(f, "METHOD"),
            Self::RemoteAddr => write!(f, "REMOTE_ADDR"),
            Self::Headers => write!(f, "HEADERS"),
            Self::Header(name) => write!(f, "HEADERS:{name}"),
            Self::Cookies => write!(f, "COOKIES"),
            Self::Cookie(name) => write!(f, "COOKIES:{name}"),
            Self::Args => write!(f, "ARGS"),
            Self::Arg(name) => write!(f, "ARGS:{name}"),
            Self::Body => write!(f, "BODY"),
            Self::Form(name) => write!(f, "FORM:{name}"),
            Self::ResponseHeaders => write!(f, "RESPONSE_HEADERS"),
            Self::ResponseHeader(name) => write!(f, "RESPONSE_HEADERS:{name}"),
            Self::ResponseBody => write!(f, "RESPONSE_BODY"),
        }
    }
}

/// Result of resolving one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// The raw value; possibly empty
    pub value: String,
    /// Whether the target's scope was available in the current phase
    pub available: bool,
}

impl Extraction {
    fn unavailable() -> Self {
        Self {
            value: String::new(),
            available: false,
        }
    }

    fn of(value: String) -> Self {
        Self {
            value,
            available: true,
        }
    }
}

/// Resolves targets against requests and prepares values for logging
#[derive(Debug, Clone)]
pub struct ValueExtractor {
    redact: bool,
    sensitive: HashSet<String>,
}

impl ValueExtractor {
    pub fn new(redact: bool, sensitive_fields: &[String]) -> Self {
        Self {
            redact,
            sensitive: sensitive_fields
                .iter()
                .map(|f| f.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Resolve a target against the request in the given phase.
    pub fn extract(
        &self,
        target: &RuleTarget,
        ctx: &RequestContext,
        phase: InspectionPhase,
    ) -> Extraction {
        if phase < target.min_phase() {
            return Extraction::unavailable();
        }

        let value = match target {
            RuleTarget::Uri => ctx.uri.clone(),
            RuleTarget::Path => ctx.path.clone(),
            RuleTarget::Query => ctx.query.clone(),
            RuleTarget::Method => ctx.method.clone(),
            RuleTarget::RemoteAddr => ctx.client_ip.to_string(),
            RuleTarget::Headers => ctx.headers_concat(),
            RuleTarget::Header(name) => ctx.header(name),
            RuleTarget::Cookies => ctx.cookies_raw(),
            RuleTarget::Cookie(name) => ctx.cookie(name),
            RuleTarget::Args => ctx.args_concat(),
            RuleTarget::Arg(name) => ctx.arg(name),
            RuleTarget::Body => ctx.body_text(),
            RuleTarget::Form(name) => ctx.form_field(name),
            RuleTarget::ResponseHeaders => ctx.response_headers_concat(),
            RuleTarget::ResponseHeader(name) => ctx.response_header(name),
            RuleTarget::ResponseBody => ctx.response_body_text(),
        };

        Extraction::of(value)
    }

    /// The form of a value that may appear in logs.
    pub fn loggable(&self, target: &RuleTarget, value: &str) -> String {
        if !self.redact {
            return value.to_string();
        }
        match target.named_field() {
            Some(name) if self.sensitive.contains(&name.to_ascii_lowercase()) => {
                REDACTED.to_string()
            }
            _ => value.to_string(),
        }
    }
}
