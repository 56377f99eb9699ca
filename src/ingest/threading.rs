//! Threading metadata: `Message-ID`, `In-Reply-To`, `References`.
//!
//! Scans only the top header block of the embedded message (everything up to
//! the first blank line), so headers of quoted or forwarded messages further
//! down never leak into the result. Runs independently of body extraction.

use super::decode::normalize_line_endings;
use super::types::{ThreadingHeaders, strip_angle_brackets};

/// Recover threading headers from a raw message, if any.
pub fn resolve_threading(embedded: Option<&str>) -> ThreadingHeaders {
    let Some(raw) = embedded else {
        return ThreadingHeaders::default();
    };

    let mut headers = ThreadingHeaders::default();
    for (name, value) in header_block(raw) {
        let slot = match name.to_ascii_lowercase().as_str() {
            "message-id" => &mut headers.message_id,
            "in-reply-to" => &mut headers.in_reply_to,
            "references" => &mut headers.references,
            _ => continue,
        };
        if slot.is_some() {
            continue;
        }
        let cleaned = if name.eq_ignore_ascii_case("references") {
            value.trim().to_string()
        } else {
            strip_angle_brackets(&value).to_string()
        };
        if !cleaned.is_empty() {
            *slot = Some(cleaned);
        }
    }
    headers
}

/// Value of the first header named `name` in the top block, unfolded.
pub fn header_value(raw: &str, name: &str) -> Option<String> {
    header_block(raw)
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Unfolded `(name, value)` pairs of the leading header block.
///
/// Continuation lines (leading whitespace) are joined with a single space.
/// Lines without a colon are skipped.
fn header_block(raw: &str) -> Vec<(String, String)> {
    let text = normalize_line_endings(raw);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if !name.is_empty() && !name.contains(' ') {
                headers.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    headers
}
