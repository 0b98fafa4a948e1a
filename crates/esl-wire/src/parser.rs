//! ESL frame parsing.
//!
//! A frame is a header block terminated by a blank line, optionally
//! followed by exactly `Content-Length` bytes of body.  The parser is
//! liberal: unknown headers pass through, malformed UTF-8 is replaced,
//! and only a promised-but-missing body is a hard error (detected at the
//! transport layer, reported as [`WireError::TruncatedBody`]).

use crate::content_types;
use crate::event::EslEvent;
use percent_encoding::percent_decode_str;
use std::fmt;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the wire layer.
#[derive(Debug)]
pub enum WireError {
    /// `Content-Length` promised more body bytes than the stream delivered.
    TruncatedBody { expected: usize, got: usize },
    /// `Content-Length` header value is not a number.
    BadContentLength(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::TruncatedBody { expected, got } => {
                write!(f, "truncated body: expected {expected} bytes, got {got}")
            }
            WireError::BadContentLength(v) => write!(f, "bad Content-Length: '{v}'"),
        }
    }
}

impl std::error::Error for WireError {}

// ---------------------------------------------------------------------------
// Header block parsing
// ---------------------------------------------------------------------------

fn url_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

/// Parse one header block into an event.
///
/// `Name: value` lines start a header; lines without `": "` continue the
/// previous header's value, joined by a newline.  Names and values are
/// trimmed and URL-decoded.  A name that repeats accumulates its values in
/// arrival order.
pub fn parse_header_block(payload: &str) -> EslEvent {
    let mut event = EslEvent::new();
    let mut current_name: Option<String> = None;
    let mut current_value = String::new();

    for line in payload.trim().lines() {
        if let Some((name, value)) = line.split_once(": ") {
            let name = url_decode(name.trim());
            let value = url_decode(value.trim());
            event.push_header(name.clone(), value.clone());
            current_name = Some(name);
            current_value = value;
        } else if let Some(name) = &current_name {
            // Continuation line: extend the most recent value in place.
            current_value.push('\n');
            current_value.push_str(line);
            event.set_last_value(name, url_decode(current_value.trim()));
        }
        // A continuation before any header is dropped (nothing to join to).
    }

    event
}

/// Parse the `Content-Length` header of an event, taking the first line of
/// a continuation-joined value (the server sometimes repeats it).
pub fn content_length(event: &EslEvent) -> Result<Option<usize>, WireError> {
    let Some(raw) = event.get("Content-Length") else {
        return Ok(None);
    };
    let first_line = raw.lines().next().unwrap_or("");
    first_line
        .trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| WireError::BadContentLength(raw.to_owned()))
}

// ---------------------------------------------------------------------------
// Frame parsing (header block + optional body → one or more events)
// ---------------------------------------------------------------------------

/// Content types whose body is an opaque payload, never a header block.
const OPAQUE_BODY_TYPES: [&str; 3] = [
    content_types::API_RESPONSE,
    content_types::RUDE_REJECTION,
    content_types::LOG_DATA,
];

/// Turn one raw frame into its logical events.
///
/// Most frames yield exactly one event.  A `text/event-plain` body is
/// itself a header block and gets merged into the outer event; a locked
/// payload (`event-lock: true`) can carry several events in one frame and
/// is split at each `\nEvent-Name: ` boundary, the extra events inheriting
/// the outer `Content-Length` and `Content-Type` and sharing the body.
pub fn parse_frame(header_block: &str, body: Option<&[u8]>) -> Vec<EslEvent> {
    expand_frame(parse_header_block(header_block), body)
}

/// [`parse_frame`] for callers that already parsed the header block
/// (the transport parses it to learn `Content-Length`).
pub fn expand_frame(event: EslEvent, body: Option<&[u8]>) -> Vec<EslEvent> {
    let mut event = event;

    let Some(body) = body else {
        return vec![event];
    };
    let content = String::from_utf8_lossy(body);
    let content_type = event.content_type().map(str::to_owned);

    if content_type
        .as_deref()
        .is_some_and(|ct| OPAQUE_BODY_TYPES.contains(&ct))
        || content_type.is_none()
    {
        event.set_body(content.into_owned());
        return vec![event];
    }

    if let Some((headers_part, inner_body)) = content.split_once("\n\n") {
        return split_locked_payload(event, headers_part, inner_body);
    }

    if content_type.as_deref() == Some(content_types::EVENT_PLAIN) {
        // Body is purely a header block describing the event.
        event.merge(parse_header_block(&content));
        event.clear_body();
        return vec![event];
    }

    event.set_body(content.into_owned());
    vec![event]
}

/// Split a payload that may contain several locked events.
///
/// The first sub-event keeps the outer frame headers; each additional one
/// inherits `Content-Length` and `Content-Type` and shares the same body.
fn split_locked_payload(outer: EslEvent, headers_part: &str, body: &str) -> Vec<EslEvent> {
    let parts: Vec<String> = if headers_part.to_lowercase().contains("event-lock: true") {
        let mut pieces = headers_part.split("\nEvent-Name: ");
        let mut parts = vec![pieces.next().unwrap_or_default().to_owned()];
        parts.extend(pieces.map(|rest| format!("Event-Name: {rest}")));
        parts
    } else {
        vec![headers_part.to_owned()]
    };

    let mut events = Vec::with_capacity(parts.len());
    for (idx, part) in parts.iter().enumerate() {
        if idx == 0 {
            let mut first = outer.clone();
            first.merge(parse_header_block(part));
            first.set_body(body.to_owned());
            events.push(first);
        } else {
            let mut extra = parse_header_block(part);
            for key in ["Content-Length", "Content-Type"] {
                if let Some(value) = outer.get_all(key) {
                    extra.set_header(key.to_owned(), value.clone());
                }
            }
            extra.set_body(body.to_owned());
            events.push(extra);
        }
    }
    events
}
