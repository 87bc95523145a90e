//! RFC 5545 document generation for synced items.
//!
//! Produces a single VEVENT wrapped in a VCALENDAR with the `icalendar`
//! writer, which handles CRLF line ends and folding. It writes property values
//! verbatim, so TEXT values (SUMMARY, DESCRIPTION, LOCATION) go through
//! [`escape_text`] first; URL is a URI value and is written as-is.

use chrono::{DateTime, Utc};
use icalendar::{Calendar, Component, EventLike};
use uuid::Uuid;

use crate::error::SyncError;

const PRODID: &str = "-//Meal Calendar Sync//EN";

/// Everything needed to render one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub uid: Option<String>,
    pub url: Option<String>,
    pub location: Option<String>,
}

/// A rendered calendar object and the UID it was rendered with.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDocument {
    pub uid: String,
    pub body: String,
}

/// Format a timestamp as an RFC 5545 UTC date-time (`YYYYMMDDTHHMMSSZ`).
pub fn format_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Escape a TEXT value: `\` `;` `,` and line breaks.
///
/// `\r\n` and lone `\r` are treated as a line break.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\\n");
            }
            other => out.push(other),
        }
    }
    out
}

/// Replace the writer's PRODID and normalize every line to CRLF.
fn finish_output(ics: &str) -> String {
    let mut result = String::with_capacity(ics.len());
    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:");
            result.push_str(PRODID);
        } else {
            result.push_str(line);
        }
        result.push_str("\r\n");
    }
    result
}

/// Render `payload` as a VCALENDAR document.
///
/// `dtstamp` is the only input that is not part of the payload; two calls with
/// the same payload and stamp produce byte-identical output. A missing UID is
/// replaced with a fresh random one.
pub fn build_document(
    payload: &EventPayload,
    dtstamp: DateTime<Utc>,
) -> Result<EventDocument, SyncError> {
    if payload.end <= payload.start {
        return Err(SyncError::InvalidInterval {
            start: payload.start,
            end: payload.end,
        });
    }

    let uid = payload
        .uid
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut event = icalendar::Event::new();
    event.uid(&uid);
    event.add_property("DTSTAMP", format_utc(&dtstamp));
    event.add_property("DTSTART", format_utc(&payload.start));
    event.add_property("DTEND", format_utc(&payload.end));
    event.summary(&escape_text(&payload.title));

    if let Some(ref description) = payload.description {
        event.description(&escape_text(description));
    }
    if let Some(ref location) = payload.location {
        event.location(&escape_text(location));
    }
    if let Some(ref url) = payload.url {
        event.add_property("URL", url);
    }

    let mut calendar = Calendar::new();
    calendar.push(event.done());
    let calendar = calendar.done();

    Ok(EventDocument {
        uid,
        body: finish_output(&calendar.to_string()),
    })
}
