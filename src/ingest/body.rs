//! Cascading body extraction.
//!
//! Recovers the human-authored part of an inbound message from whatever the
//! relay handed us. Three strategies run in strict priority order and the
//! first non-empty result wins:
//!
//! 1. [`Strategy::DirectField`]: `text`, `plain`, `body-plain` form fields
//! 2. [`Strategy::StructuredEmbedded`]: the `text/plain` MIME part of the
//!    embedded raw message
//! 3. [`Strategy::HeuristicScan`]: line-by-line scan for prose
//!
//! Every result passes through [`decode`] and has its quoted reply tail
//! removed.

use std::collections::HashMap;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mail_parser::MessageParser;
use regex::Regex;
use tracing::debug;

use super::decode::{decode, looks_like_html, normalize_line_endings, strip_html};
use super::multipart::BOUNDARY_PARAM;

/// Direct fields, checked in this order.
pub const DIRECT_FIELDS: [&str; 3] = ["text", "plain", "body-plain"];

static ON_WROTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^on\s.*\bwrote:\s*$").expect("valid regex"));

static ORIGINAL_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^-{2,}\s*(original message|forwarded message)\s*-{2,}$").expect("valid regex")
});

static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(from|to|cc|bcc|subject|date|sent|reply-to|message-id|in-reply-to|references|return-path|received|mime-version|content-[a-z-]+|x-[a-z0-9-]+|dkim-signature|arc-[a-z-]+|authentication-results|delivered-to|thread-topic|thread-index|importance):(\s|$)",
    )
    .expect("valid regex")
});

static CONTENT_TYPE_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^content-type:\s*text/plain\b").expect("valid regex"));

static CONTENT_TYPE_HTML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^content-type:\s*text/html\b").expect("valid regex"));

static TRANSFER_ENCODING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^content-transfer-encoding:\s*([a-z0-9-]+)").expect("valid regex")
});

static PART_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^content-[a-z-]+:").expect("valid regex"));

static ADDRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"?[^"<>@]*"?\s*<[^\s<>@]+@[^\s<>@]+>|<?[^\s<>@]+@[^\s<>@]+>?)[,;]?$"#)
        .expect("valid regex")
});

static FOUR_LETTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{L}{4}").expect("valid regex"));

static MIME_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^(charset=|boundary=|name=|filename=|format=flowed|this is a multi-part message)"#)
        .expect("valid regex")
});

static BASE64_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/=]{40,}$").expect("valid regex"));

/// Which strategy produced a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectField,
    StructuredEmbedded,
    HeuristicScan,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DirectField => "direct_field",
            Self::StructuredEmbedded => "structured_embedded",
            Self::HeuristicScan => "heuristic_scan",
        }
    }
}

/// A body plus the strategy that found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedBody {
    pub strategy: Strategy,
    pub text: String,
}

/// Recover the message body. Returns an empty string when every strategy
/// comes up empty; deciding whether that is a failure is the caller's job.
pub fn extract_body(raw: &str, fields: &HashMap<String, String>, embedded: Option<&str>) -> String {
    extract_body_traced(raw, fields, embedded)
        .map(|b| b.text)
        .unwrap_or_default()
}

/// Like [`extract_body`], but reports which strategy won.
pub fn extract_body_traced(
    raw: &str,
    fields: &HashMap<String, String>,
    embedded: Option<&str>,
) -> Option<ExtractedBody> {
    let found = direct_field(fields)
        .map(|text| (Strategy::DirectField, text))
        .or_else(|| embedded.and_then(structured_embedded).map(|t| (Strategy::StructuredEmbedded, t)))
        .or_else(|| heuristic_scan(embedded.unwrap_or(raw)).map(|t| (Strategy::HeuristicScan, t)));

    match found {
        Some((strategy, text)) => {
            debug!(strategy = strategy.label(), len = text.len(), "Body extracted");
            Some(ExtractedBody { strategy, text })
        }
        None => {
            debug!("All body extraction strategies came up empty");
            None
        }
    }
}

// ── Strategy 1: direct field ────────────────────────────────────────

/// First non-blank `text` / `plain` / `body-plain` field, decoded.
pub fn direct_field(fields: &HashMap<String, String>) -> Option<String> {
    DIRECT_FIELDS.iter().find_map(|name| {
        let raw = fields.get(*name)?;
        let mut text = decode(raw);
        if looks_like_html(&text) {
            text = strip_html(&text);
        }
        non_empty(strip_quoted_reply(&text))
    })
}

// ── Strategy 2: structured embedded message ─────────────────────────

/// Body of the embedded message's first `text/plain` part.
///
/// Falls back to the first `text/html` part, then to mail-parser's view of
/// the body when the message has no part headers at all.
pub fn structured_embedded(embedded: &str) -> Option<String> {
    let text = normalize_line_endings(embedded);
    let boundaries = declared_boundaries(&text);
    let lines: Vec<&str> = text.lines().collect();

    let candidate = find_part(&lines, &CONTENT_TYPE_PLAIN, &boundaries)
        .map(|(encoding, body)| transfer_decode(&body, encoding.as_deref()))
        .or_else(|| {
            find_part(&lines, &CONTENT_TYPE_HTML, &boundaries)
                .map(|(encoding, body)| strip_html(&transfer_decode(&body, encoding.as_deref())))
        })
        .or_else(|| parsed_body_text(&text));

    let cleaned = strip_quoted_reply(&strip_header_lines(&candidate?));
    non_empty(cleaned)
}

/// Locate a part by its `Content-Type` line; returns its transfer encoding
/// and raw body.
fn find_part(lines: &[&str], content_type: &Regex, boundaries: &[String]) -> Option<(Option<String>, String)> {
    let idx = lines.iter().position(|l| content_type.is_match(l))?;

    // The part's header block runs from the previous blank/boundary line to
    // the next blank line.
    let mut start = idx;
    while start > 0 {
        let prev = lines[start - 1];
        if prev.trim().is_empty() || prev.starts_with("--") {
            break;
        }
        start -= 1;
    }
    let blank = (idx..lines.len()).find(|&i| lines[i].trim().is_empty())?;

    let encoding = lines[start..blank].iter().find_map(|l| {
        TRANSFER_ENCODING
            .captures(l)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
    });

    let body: Vec<&str> = lines[blank + 1..]
        .iter()
        .take_while(|l| !is_boundary_of(l, boundaries))
        .copied()
        .collect();

    Some((encoding, body.join("\n")))
}

/// Tokens named by `boundary=` parameters anywhere in `text`.
fn declared_boundaries(text: &str) -> Vec<String> {
    BOUNDARY_PARAM
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Declared tokens plus any `--token` line that opens a part header block.
fn part_boundaries(text: &str, lines: &[&str]) -> Vec<String> {
    let mut tokens = declared_boundaries(text);
    for (i, line) in lines.iter().enumerate() {
        if let Some(token) = line.trim_end().strip_prefix("--")
            && !token.is_empty()
            && !token.starts_with(['-', ' '])
            && lines.get(i + 1).is_some_and(|next| PART_HEADER.is_match(next))
            && !tokens.iter().any(|t| t == token)
        {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// `--token` or the closing `--token--`, nothing else on the line.
fn is_boundary_of(line: &str, boundaries: &[String]) -> bool {
    line.trim_end().strip_prefix("--").is_some_and(|rest| {
        let rest = rest.strip_suffix("--").unwrap_or(rest);
        boundaries.iter().any(|b| b == rest)
    })
}

fn transfer_decode(body: &str, encoding: Option<&str>) -> String {
    if encoding == Some("base64") {
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        if let Ok(bytes) = STANDARD.decode(compact.as_bytes()) {
            return decode(&String::from_utf8_lossy(&bytes));
        }
        debug!("Invalid base64 part; decoding as text");
    }
    decode(body)
}

fn parsed_body_text(text: &str) -> Option<String> {
    let parsed = MessageParser::default().parse(text.as_bytes())?;
    if let Some(plain) = parsed.body_text(0) {
        return Some(decode(&plain));
    }
    parsed.body_html(0).map(|html| strip_html(&html))
}

// ── Strategy 3: heuristic scan ──────────────────────────────────────

/// Walk every line looking for prose.
///
/// Every kept line must pass the same prose test as the first one; blank
/// lines between kept lines survive as paragraph breaks. Collection stops
/// at a quoted-reply marker, or at a MIME boundary since the part ends
/// there. Other dash lines (rules, `--Name` sign-offs) are skipped.
pub fn heuristic_scan(source: &str) -> Option<String> {
    let text = normalize_line_endings(source);
    let lines: Vec<&str> = text.lines().collect();
    let boundaries = part_boundaries(&text, &lines);
    let mut collected: Vec<&str> = Vec::new();
    let mut started = false;
    let mut in_header = false;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if is_quote_marker(&lines, i) {
            if started {
                break;
            }
            continue;
        }

        if is_boundary_of(trimmed, &boundaries) {
            if started {
                break;
            }
            in_header = false;
            continue;
        }

        if trimmed.starts_with("--") {
            continue;
        }

        // Folded continuation of a skipped header
        if in_header && !trimmed.is_empty() && line.starts_with([' ', '\t']) {
            continue;
        }
        in_header = false;

        if HEADER_LINE.is_match(trimmed) {
            in_header = true;
            continue;
        }

        if trimmed.is_empty() {
            if started {
                collected.push("");
            }
            continue;
        }

        if is_noise(trimmed) || !is_prose(trimmed) {
            continue;
        }

        started = true;
        collected.push(line.trim_end());
    }

    let mut text = decode(&collected.join("\n"));
    if looks_like_html(&text) {
        text = strip_html(&text);
    }
    non_empty(text)
}

/// Four consecutive letters, and either a space or more than 30 chars.
fn is_prose(line: &str) -> bool {
    FOUR_LETTERS.is_match(line) && (line.contains(' ') || line.chars().count() > 30)
}

fn is_noise(line: &str) -> bool {
    ADDRESS_LINE.is_match(line) || is_json(line) || MIME_NOISE.is_match(line) || BASE64_LINE.is_match(line)
}

fn is_json(line: &str) -> bool {
    (line.starts_with('{') && line.ends_with('}'))
        || (line.starts_with('[') && line.ends_with(']'))
        || line.starts_with("{\"")
}

// ── Quote and header stripping ──────────────────────────────────────

/// Is line `i` the start of a quoted reply?
///
/// Matches `On … wrote:` (also split across two lines), `>`-prefixed lines,
/// and `--- Original Message ---` separators.
fn is_quote_marker(lines: &[&str], i: usize) -> bool {
    let trimmed = lines[i].trim();
    if trimmed.starts_with('>') || ON_WROTE.is_match(trimmed) || ORIGINAL_MESSAGE.is_match(trimmed) {
        return true;
    }
    trimmed.starts_with("On ")
        && !trimmed.ends_with('.')
        && lines
            .get(i + 1)
            .is_some_and(|next| next.trim().ends_with("wrote:"))
}

/// Drop everything from the first quoted-reply marker onward.
pub fn strip_quoted_reply(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let cut = (0..lines.len())
        .find(|&i| is_quote_marker(&lines, i))
        .unwrap_or(lines.len());

    let mut kept = lines[..cut].to_vec();
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n").trim().to_string()
}

/// Drop lines that look like message headers (`Key: value` for common keys).
///
/// Forwarded messages reintroduce header blocks below the body separator,
/// so this runs over the body, not only the top header block.
pub fn strip_header_lines(body: &str) -> String {
    body.lines()
        .filter(|l| !HEADER_LINE.is_match(l.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
