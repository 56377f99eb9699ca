//! Content decoding: quoted-printable escapes, soft line breaks, line-ending
//! normalization, and HTML flattening.
//!
//! Pure string processing. Nothing here fails: malformed input is passed
//! through literally.

use std::sync::LazyLock;

use regex::Regex;

/// Three or more consecutive blank lines.
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){3,}").expect("valid regex"));

static HTML_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(?:p|div|li|tr|h[1-6]|blockquote)\s*>").expect("valid regex")
});

static HTML_INVISIBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(style|script|head)\b.*?</(?:style|script|head)\s*>").expect("valid regex")
});

/// Decode quoted-printable-like text into clean Unicode.
///
/// - `=XX` hex escapes become the byte they name
/// - `=` followed by a line break (optionally after trailing blanks) is a
///   soft break and is removed
/// - `\r\n` and lone `\r` become `\n`
/// - runs of three or more blank lines collapse to one blank line
///
/// Decoding already-plain text is a no-op apart from the normalizations,
/// which are themselves stable, so `decode(decode(s)) == decode(s)` for
/// plain input.
pub fn decode(raw: &str) -> String {
    let normalized = normalize_line_endings(raw);
    let bytes = unescape(normalized.as_bytes());
    let text = String::from_utf8_lossy(&bytes);
    let text = normalize_line_endings(&text);
    collapse_blank_lines(&text)
}

/// `\r\n` / `\r` → `\n`.
pub fn normalize_line_endings(s: &str) -> String {
    if !s.contains('\r') {
        return s.to_string();
    }
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Collapse 3+ consecutive blank lines into exactly one blank line.
pub fn collapse_blank_lines(s: &str) -> String {
    BLANK_RUN.replace_all(s, "\n\n").into_owned()
}

fn unescape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        let b = input[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break: "=" [blanks] "\n"
        let mut j = i + 1;
        while j < input.len() && (input[j] == b' ' || input[j] == b'\t') {
            j += 1;
        }
        if j < input.len() && input[j] == b'\n' {
            i = j + 1;
            continue;
        }

        // Hex escape
        if i + 2 < input.len()
            && let (Some(hi), Some(lo)) = (hex_value(input[i + 1]), hex_value(input[i + 2]))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }

        // Malformed: keep the "=" literally
        out.push(b'=');
        i += 1;
    }

    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Flatten HTML to plain text, keeping block boundaries as line breaks so
/// quoted-reply markers still start their own line.
pub fn strip_html(html: &str) -> String {
    let without_invisible = HTML_INVISIBLE.replace_all(html, "");
    let with_breaks = HTML_BREAK.replace_all(&without_invisible, "\n");

    let mut flat = String::with_capacity(with_breaks.len());
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => flat.push(ch),
            _ => {}
        }
    }

    let flat = decode_entities(&flat);

    // Normalize whitespace within each line
    let lines: Vec<String> = flat
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    collapse_blank_lines(lines.join("\n").trim())
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Heuristic: does this text look like an HTML document or fragment?
pub fn looks_like_html(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.contains("<html")
        || lower.contains("<body")
        || lower.contains("<div")
        || lower.contains("<p>")
        || lower.contains("<br")
}
