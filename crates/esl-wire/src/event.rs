//! The parsed ESL event model.
//!
//! An event is an insertion-ordered map from header name to one or more
//! string values, plus an optional body.  Header names and values are
//! stored post URL-decoding; a header that repeats within one frame is
//! promoted to [`HeaderValue::Multiple`] on its second occurrence.

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of a single header: one string, or an ordered sequence when the
/// header appeared more than once in the same frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// First value, regardless of arity.
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Single(v) => v,
            HeaderValue::Multiple(vs) => vs.first().map_or("", String::as_str),
        }
    }

    /// Append another occurrence, promoting to `Multiple` if needed.
    pub(crate) fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(existing) => {
                *self = HeaderValue::Multiple(vec![std::mem::take(existing), value]);
            }
            HeaderValue::Multiple(vs) => vs.push(value),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Single(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Single(value.to_owned())
    }
}

// ---------------------------------------------------------------------------
// EslEvent
// ---------------------------------------------------------------------------

/// A parsed ESL message: ordered headers plus an optional body.
///
/// Header lookup is case-sensitive, matching FreeSWITCH's own header
/// casing (`Event-Name`, `Unique-ID`, ...).  Insertion order of first
/// occurrence is preserved so an event can be re-serialized faithfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EslEvent {
    headers: Vec<(String, HeaderValue)>,
    body: Option<String>,
}

impl EslEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// First value of a header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.first())
    }

    /// All values of a header in arrival order.
    pub fn get_all(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == name)
    }

    /// Add an occurrence of a header.  A repeated name accumulates into an
    /// ordered sequence; first-occurrence position is kept.
    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == name) {
            Some((_, existing)) => existing.push(value),
            None => self.headers.push((name, HeaderValue::Single(value))),
        }
    }

    /// Set a header, replacing any existing value but keeping its position.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == name) {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Remove a header, returning its value if it existed.
    pub fn remove_header(&mut self, name: &str) -> Option<HeaderValue> {
        let idx = self.headers.iter().position(|(k, _)| k == name)?;
        Some(self.headers.remove(idx).1)
    }

    /// Overwrite the most recent occurrence of `name`, keeping its position.
    /// Used by the parser to fold continuation lines into the value.
    pub(crate) fn set_last_value(&mut self, name: &str, value: String) {
        match self.headers.iter_mut().rev().find(|(k, _)| k == name) {
            Some((_, HeaderValue::Single(existing))) => *existing = value,
            Some((_, HeaderValue::Multiple(vs))) => {
                if let Some(last) = vs.last_mut() {
                    *last = value;
                }
            }
            None => self.headers.push((name.to_owned(), HeaderValue::Single(value))),
        }
    }

    /// Merge `other` into `self`: existing names are replaced in place,
    /// new names are appended.
    pub fn merge(&mut self, other: EslEvent) {
        for (name, value) in other.headers {
            self.set_header(name, value);
        }
        if other.body.is_some() {
            self.body = other.body;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v))
    }

    // -- body ---------------------------------------------------------------

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    // -- well-known headers --------------------------------------------------

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get("Event-Name")
    }

    pub fn event_subclass(&self) -> Option<&str> {
        self.get("Event-Subclass")
    }

    /// Effective name used for routing: the subclass for `CUSTOM` events
    /// (falling back to `CUSTOM` itself when no subclass is present), the
    /// event name otherwise.
    pub fn effective_name(&self) -> Option<&str> {
        match self.event_name() {
            Some("CUSTOM") => self.event_subclass().or(Some("CUSTOM")),
            other => other,
        }
    }

    /// The channel UUID this event belongs to, if any.
    pub fn unique_id(&self) -> Option<&str> {
        self.get("Unique-ID").or_else(|| self.get("Caller-Unique-ID"))
    }

    /// Target UUID for session dispatch; `Channel-Unique-ID` wins over
    /// `Unique-ID` (command replies carry the former).
    pub fn channel_uuid(&self) -> Option<&str> {
        self.get("Channel-Unique-ID").or_else(|| self.get("Unique-ID"))
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.get("Job-UUID")
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.get("Reply-Text")
    }

    pub fn application_response(&self) -> Option<&str> {
        self.get("Application-Response")
    }

    // -- serialization -------------------------------------------------------

    /// Serialize to ESL plain wire format with percent-encoded values.
    ///
    /// Inverse of the frame parser for single events: headers in insertion
    /// order, `Content-Length` recomputed from the body.  Used by the mock
    /// server and round-trip tests.
    pub fn to_plain_format(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            if name == "Content-Length" {
                continue;
            }
            let values: &[String] = match value {
                HeaderValue::Single(v) => std::slice::from_ref(v),
                HeaderValue::Multiple(vs) => vs,
            };
            for v in values {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(&percent_encode(v.as_bytes(), NON_ALPHANUMERIC).to_string());
                out.push('\n');
            }
        }
        if let Some(body) = &self.body {
            out.push_str(&format!("Content-Length: {}\n", body.len()));
            out.push('\n');
            out.push_str(body);
        } else {
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for EslEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.event_name(), self.content_type()) {
            (Some(name), _) => write!(f, "<event {name}>"),
            (None, Some(ct)) => write!(f, "<frame {ct}>"),
            (None, None) => write!(f, "<frame>"),
        }
    }
}
