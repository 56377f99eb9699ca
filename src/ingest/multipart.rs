//! Multipart form-data field extraction.
//!
//! Tolerant splitter for inbound-parse webhook bodies: locates
//! `Content-Disposition: form-data; name="..."` markers, takes everything
//! after the part's blank line up to the next outer boundary (or end of
//! buffer), and accepts `\r\n` and `\n` line endings interchangeably.
//!
//! The boundary comes from the request's `Content-Type` when it names one
//! that occurs in the body; otherwise it is sniffed from the body itself.
//!
//! A buffer without any markers yields no fields. That is a signal for the
//! caller to try another payload format, not an error.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::decode::normalize_line_endings;

/// Field that carries the original message (headers + body) in raw mode.
pub const EMBEDDED_FIELD: &str = "email";

pub(super) static BOUNDARY_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)boundary="?([^";\s]+)"?"#).expect("valid regex"));

static DISPOSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?im)^content-disposition:[ \t]*form-data;[^\n]*?\bname="([^"]*)"[^\n]*$"#)
        .expect("valid regex")
});

/// Fields of one multipart buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartFields {
    /// Raw (undecoded) field values by name; first occurrence wins.
    pub fields: HashMap<String, String>,
    /// Value of the `email` field, unparsed.
    pub embedded: Option<String>,
}

impl MultipartFields {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Does the buffer contain any form-data part markers?
pub fn has_form_markers(raw: &str) -> bool {
    DISPOSITION.is_match(raw)
}

/// Split a multipart buffer into named fields.
pub fn extract_fields(raw: &str) -> HashMap<String, String> {
    parse(raw).fields
}

/// The raw embedded message from the `email` field, if present.
pub fn extract_embedded_message(raw: &str) -> Option<String> {
    parse(raw).embedded
}

/// The `boundary=` parameter of a content type.
pub fn boundary_param(content_type: &str) -> Option<String> {
    BOUNDARY_PARAM
        .captures(content_type)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Split once, returning both the fields and the embedded message.
pub fn parse(raw: &str) -> MultipartFields {
    parse_delimited(raw, None)
}

/// Like [`parse`], preferring a boundary announced out of band.
///
/// The announced token is used only when a delimiter line for it exists in
/// the body; otherwise the boundary is sniffed as usual.
pub fn parse_delimited(raw: &str, boundary: Option<&str>) -> MultipartFields {
    let text = normalize_line_endings(raw);
    let boundary = boundary
        .filter(|token| {
            let delimiter = format!("--{token}");
            text.lines().any(|l| is_delimiter_line(l, &delimiter))
        })
        .map(str::to_string)
        .or_else(|| detect_boundary(&text));
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut pos = 0;

    while let Some(caps) = DISPOSITION.captures_at(&text, pos) {
        let (Some(marker), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };

        let value_start = value_start(&text, marker.end());
        let value_end = value_end(&text, value_start, boundary.as_deref());

        fields
            .entry(name.as_str().to_string())
            .or_insert_with(|| text[value_start..value_end].to_string());

        // Always make progress, even on an empty trailing part
        pos = value_end.max(marker.end());
        if pos >= text.len() {
            break;
        }
    }

    let embedded = fields
        .get(EMBEDDED_FIELD)
        .filter(|v| !v.trim().is_empty())
        .cloned();

    MultipartFields { fields, embedded }
}

/// The outer boundary token: the last `--token` line before the first marker.
fn detect_boundary(text: &str) -> Option<String> {
    let first = DISPOSITION.find(text)?;
    text[..first.start()]
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|l| l.starts_with("--") && l.len() > 2)
        .map(|l| l[2..].to_string())
}

/// Skip the part's remaining header lines and the blank separator.
fn value_start(text: &str, marker_end: usize) -> usize {
    match text[marker_end..].find("\n\n") {
        Some(offset) => marker_end + offset + 2,
        // No blank separator: be lenient and start on the next line
        None => (marker_end + 1).min(text.len()),
    }
}

fn value_end(text: &str, start: usize, boundary: Option<&str>) -> usize {
    let rest = &text[start..];

    if let Some(token) = boundary {
        let delimiter = format!("--{token}");
        return match find_delimiter_line(rest, &delimiter) {
            Some(0) => start,
            // Exclude the newline that precedes the delimiter
            Some(offset) => start + offset - 1,
            None => text.len(),
        };
    }

    // Unknown token: stop at the `--` line preceding the next marker
    match DISPOSITION.find_at(text, start) {
        Some(next) => text[start..next.start()]
            .rfind("\n--")
            .map_or(next.start(), |offset| start + offset),
        None => text.len(),
    }
}

/// Offset of the first line in `text` that is exactly a delimiter.
fn find_delimiter_line(text: &str, delimiter: &str) -> Option<usize> {
    let mut line_start = 0;
    loop {
        let line_end = text[line_start..]
            .find('\n')
            .map_or(text.len(), |i| line_start + i);
        if is_delimiter_line(&text[line_start..line_end], delimiter) {
            return Some(line_start);
        }
        if line_end >= text.len() {
            return None;
        }
        line_start = line_end + 1;
    }
}

/// `--token` or `--token--`, optionally followed by whitespace.
fn is_delimiter_line(line: &str, delimiter: &str) -> bool {
    line.strip_prefix(delimiter).is_some_and(|tail| {
        let tail = tail.trim_end();
        tail.is_empty() || tail == "--"
    })
}
