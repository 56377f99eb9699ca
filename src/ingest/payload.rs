//! Payload classification and normalization into [`ExtractedEmail`].
//!
//! A delivery is classified exactly once into a [`DeliveryPayload`]; each
//! variant knows how to turn itself into a flat field map plus an optional
//! embedded raw message. From there a single path recovers sender, subject,
//! threading headers and finally the body.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::body::{DIRECT_FIELDS, extract_body_traced};
use super::multipart::{self, MultipartFields};
use super::threading::{header_value, resolve_threading};
use super::types::{
    ExtractedEmail, NO_SUBJECT, RawDelivery, ThreadingHeaders, UNKNOWN_SENDER, strip_angle_brackets,
};
use crate::error::PipelineError;

const SENDER_ALIASES: [&str; 3] = ["from", "sender", "email"];
const SUBJECT_ALIASES: [&str; 2] = ["subject", "title"];
const BODY_ALIASES: [&str; 4] = ["body", "content", "message", "html"];
const TIMESTAMP_FIELDS: [&str; 3] = ["timestamp", "Date", "date"];

static SCRAPE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?im)^[ \t]*"?(from|sender|email|subject|title|text|body|content|message)"?[ \t]*[:=][ \t]*"?(.*?)"?,?[ \t]*$"#,
    )
    .expect("valid regex")
});

/// A delivery, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryPayload {
    /// Multipart body announced as such by its content type.
    RawMime(MultipartFields),
    /// Multipart body that arrived without a multipart content type.
    Buffered(MultipartFields),
    /// A JSON object.
    DirectJson(Map<String, Value>),
    /// Anything else; the raw text is kept for scraping.
    Unknown(String),
}

impl DeliveryPayload {
    /// Decide the payload shape from content type and bytes.
    ///
    /// Multipart shapes that yield no fields fall through to JSON, then to
    /// [`DeliveryPayload::Unknown`].
    pub fn classify(delivery: &RawDelivery) -> Self {
        let text = delivery.text();
        let multipart_ct = delivery
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("multipart/"));

        if multipart_ct || multipart::has_form_markers(&text) {
            let boundary = delivery
                .content_type
                .as_deref()
                .and_then(multipart::boundary_param);
            let parsed = multipart::parse_delimited(&text, boundary.as_deref());
            if !parsed.is_empty() {
                return if multipart_ct {
                    Self::RawMime(parsed)
                } else {
                    Self::Buffered(parsed)
                };
            }
        }

        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text.trim()) {
            return Self::DirectJson(map);
        }

        Self::Unknown(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RawMime(_) => "raw_mime",
            Self::Buffered(_) => "buffered",
            Self::DirectJson(_) => "direct_json",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Flatten into `(fields, embedded message)`.
    fn into_fields(self) -> (HashMap<String, String>, Option<String>) {
        match self {
            Self::RawMime(parsed) | Self::Buffered(parsed) => (parsed.fields, parsed.embedded),
            Self::DirectJson(map) => {
                let mut fields = flatten_json(map);
                alias_body(&mut fields);
                let embedded = fields
                    .get("raw")
                    .filter(|v| !v.trim().is_empty())
                    .cloned();
                (fields, embedded)
            }
            Self::Unknown(text) => {
                let mut fields = scrape_fields(&text);
                alias_body(&mut fields);
                // A bare RFC 5322 message is its own embedded message
                let embedded = header_value(&text, "from").map(|_| text);
                (fields, embedded)
            }
        }
    }
}

/// Everything recoverable before the body cascade runs.
///
/// Sender, subject, message id and send time are enough to build the dedup
/// key, so the expensive body extraction can be skipped for duplicates.
#[derive(Debug, Clone)]
pub struct PreparedDelivery {
    pub kind: &'static str,
    raw: String,
    fields: HashMap<String, String>,
    embedded: Option<String>,
    /// Bare address, when one was found.
    pub sender: Option<String>,
    /// Decoded subject, when one was found.
    pub subject: Option<String>,
    pub threading: ThreadingHeaders,
    /// When the message was sent, as stated by the payload itself.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl PreparedDelivery {
    pub fn sender(&self) -> &str {
        self.sender.as_deref().unwrap_or(UNKNOWN_SENDER)
    }

    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or(NO_SUBJECT)
    }

    /// Run the body cascade and produce the final tuple.
    ///
    /// Fails only when nothing at all was recoverable: no sender, no
    /// subject and no body.
    pub fn extract(self) -> Result<ExtractedEmail, PipelineError> {
        let body = extract_body_traced(&self.raw, &self.fields, self.embedded.as_deref())
            .map(|b| b.text)
            .unwrap_or_default();

        if self.sender.is_none() && self.subject.is_none() && body.is_empty() {
            return Err(PipelineError::Unparseable(format!(
                "{} payload yielded no sender, subject or body",
                self.kind
            )));
        }

        Ok(ExtractedEmail {
            sender: self.sender().to_string(),
            subject: self.subject().to_string(),
            body,
            message_id: self.threading.message_id,
            in_reply_to: self.threading.in_reply_to,
            references: self.threading.references,
        })
    }
}

/// Classify and pre-extract a delivery.
pub fn prepare(delivery: &RawDelivery) -> PreparedDelivery {
    let payload = DeliveryPayload::classify(delivery);
    let kind = payload.kind();
    let raw = delivery.text();
    let (fields, embedded) = payload.into_fields();

    let sender = resolve_sender(&fields, embedded.as_deref());
    let subject = resolve_subject(&fields, embedded.as_deref());
    let threading = resolve_threading(embedded.as_deref())
        .or(resolve_threading(fields.get("headers").map(String::as_str)))
        .or(threading_from_fields(&fields));
    let delivered_at = resolve_delivered_at(&fields, embedded.as_deref());

    debug!(
        kind,
        fields = fields.len(),
        embedded = embedded.is_some(),
        "Delivery classified"
    );

    PreparedDelivery {
        kind,
        raw,
        fields,
        embedded,
        sender,
        subject,
        threading,
        delivered_at,
    }
}

/// Classify, pre-extract and run the body cascade in one go.
pub fn normalize(delivery: &RawDelivery) -> Result<ExtractedEmail, PipelineError> {
    prepare(delivery).extract()
}

// ── Sender ──────────────────────────────────────────────────────────

fn resolve_sender(fields: &HashMap<String, String>, embedded: Option<&str>) -> Option<String> {
    SENDER_ALIASES
        .iter()
        .filter_map(|key| fields.get(*key))
        // The multipart `email` field is the embedded message, not an address
        .filter(|v| !v.contains('\n'))
        .find_map(|v| bare_address(v))
        .or_else(|| {
            let envelope = fields.get("envelope")?;
            let value: Value = serde_json::from_str(envelope).ok()?;
            value.get("from")?.as_str().and_then(bare_address)
        })
        .or_else(|| embedded.and_then(|raw| header_value(raw, "from")).and_then(|v| bare_address(&v)))
        .or_else(|| {
            fields
                .get("headers")
                .and_then(|raw| header_value(raw, "from"))
                .and_then(|v| bare_address(&v))
        })
}

/// `"Jane Doe" <jane@example.com>` → `jane@example.com`.
pub fn bare_address(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let header = format!("From: {value}\r\n\r\n");
    let parsed = MessageParser::default()
        .parse(header.as_bytes())
        .and_then(|msg| first_address(msg.from()));

    parsed.or_else(|| scan_address(value))
}

fn first_address(addr: Option<&mail_parser::Address>) -> Option<String> {
    let found = match addr? {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .find_map(|a| a.address.as_ref().map(|s| s.to_string())),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .find_map(|a| a.address.as_ref().map(|s| s.to_string())),
    }?;
    found.contains('@').then_some(found)
}

fn scan_address(value: &str) -> Option<String> {
    if let (Some(open), Some(close)) = (value.rfind('<'), value.rfind('>'))
        && open < close
    {
        let inner = value[open + 1..close].trim();
        if inner.contains('@') {
            return Some(inner.to_string());
        }
    }
    value
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .map(|t| t.trim_matches(|c: char| matches!(c, '<' | '>' | '"' | '\'' | '(' | ')')))
        .find(|t| t.contains('@') && !t.starts_with('@') && !t.ends_with('@'))
        .map(str::to_string)
}

// ── Subject ─────────────────────────────────────────────────────────

fn resolve_subject(fields: &HashMap<String, String>, embedded: Option<&str>) -> Option<String> {
    SUBJECT_ALIASES
        .iter()
        .filter_map(|key| fields.get(*key))
        .map(|v| decode_subject(v))
        .find(|s| !s.is_empty())
        .or_else(|| {
            embedded
                .and_then(|raw| header_value(raw, "subject"))
                .map(|v| decode_subject(&v))
                .filter(|s| !s.is_empty())
        })
}

/// Decode RFC 2047 encoded words and flatten whitespace.
pub fn decode_subject(value: &str) -> String {
    let flat = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if !flat.contains("=?") {
        return flat;
    }

    let header = format!("Subject: {flat}\r\n\r\n");
    MessageParser::default()
        .parse(header.as_bytes())
        .and_then(|msg| msg.subject().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .unwrap_or(flat)
}

// ── Send time ───────────────────────────────────────────────────────

/// Relay timestamp field, then the embedded `Date:`, then `Date:` in the
/// `headers` field.
fn resolve_delivered_at(
    fields: &HashMap<String, String>,
    embedded: Option<&str>,
) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|key| fields.get(*key))
        .find_map(|v| parse_timestamp(v))
        .or_else(|| {
            embedded
                .and_then(|raw| header_value(raw, "date"))
                .and_then(|v| parse_date_header(&v))
        })
        .or_else(|| {
            fields
                .get("headers")
                .and_then(|raw| header_value(raw, "date"))
                .and_then(|v| parse_date_header(&v))
        })
}

/// Unix seconds (or milliseconds), RFC 3339, or an RFC 5322 date.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return if n > 100_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
    }
    if let Ok(secs) = value.parse::<f64>()
        && secs.is_finite()
    {
        return DateTime::from_timestamp_millis((secs * 1000.0).round() as i64);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| parse_date_header(value))
}

fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    let header = format!("Date: {}\r\n\r\n", value.trim());
    MessageParser::default()
        .parse(header.as_bytes())
        .and_then(|msg| msg.date().map(|d| d.to_timestamp()))
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

// ── Threading from structured fields ────────────────────────────────

fn threading_from_fields(fields: &HashMap<String, String>) -> ThreadingHeaders {
    let pick = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| fields.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string)
    };

    ThreadingHeaders {
        message_id: pick(&["message_id", "messageId", "message-id"])
            .map(|v| strip_angle_brackets(&v).to_string()),
        in_reply_to: pick(&["in_reply_to", "inReplyTo", "in-reply-to"])
            .map(|v| strip_angle_brackets(&v).to_string()),
        references: pick(&["references"]),
    }
}

// ── JSON and scraped shapes ─────────────────────────────────────────

fn flatten_json(map: Map<String, Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(key, value)| {
            let flat = match value {
                Value::Null => return None,
                Value::String(s) => s,
                Value::Array(items) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                Value::Object(obj) => match ["email", "address"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))
                {
                    Some(addr) => addr.to_string(),
                    None => Value::Object(obj).to_string(),
                },
                other => other.to_string(),
            };
            Some((key, flat))
        })
        .collect()
}

/// Map a body alias onto `text` when no direct body field is present.
fn alias_body(fields: &mut HashMap<String, String>) {
    let has_direct = DIRECT_FIELDS
        .iter()
        .any(|k| fields.get(*k).is_some_and(|v| !v.trim().is_empty()));
    if has_direct {
        return;
    }
    if let Some(value) = BODY_ALIASES
        .iter()
        .filter_map(|k| fields.get(*k))
        .find(|v| !v.trim().is_empty())
        .cloned()
    {
        fields.insert("text".to_string(), value);
    }
}

/// Best-effort `key: value` / `key=value` scrape over unstructured text.
fn scrape_fields(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for caps in SCRAPE_LINE.captures_iter(text) {
        let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let value = value.as_str().trim();
        if value.is_empty() {
            continue;
        }
        fields
            .entry(key.as_str().to_ascii_lowercase())
            .or_insert_with(|| value.to_string());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut out = String::new();
        for (name, value) in parts {
            out.push_str("--xYzZY\r\n");
            out.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        out.push_str("--xYzZY--\r\n");
        out.into_bytes()
    }

    const MULTIPART_CT: &str = "multipart/form-data; boundary=xYzZY";

    #[test]
    fn end_to_end_multipart_example() {
        let bytes = multipart(&[
            ("from", "Jane Doe <jane@example.com>"),
            ("subject", "Re: Hello"),
            (
                "text",
                "Thanks! See you then.\n\nOn Mon, Jun 1, Jane wrote:\n> original",
            ),
        ]);
        let email = normalize(&RawDelivery::new(bytes, Some(MULTIPART_CT))).unwrap();
        assert_eq!(email.sender, "jane@example.com");
        assert_eq!(email.subject, "Re: Hello");
        assert_eq!(email.body, "Thanks! See you then.");
    }

    #[test]
    fn classify_shapes() {
        let bytes = multipart(&[("from", "a@x.com")]);
        assert_eq!(DeliveryPayload::classify(&RawDelivery::new(bytes.clone(), Some(MULTIPART_CT))).kind(), "raw_mime");
        assert_eq!(DeliveryPayload::classify(&RawDelivery::new(bytes, None)).kind(), "buffered");
        assert_eq!(
            DeliveryPayload::classify(&RawDelivery::new(r#"{"from":"a@x.com"}"#, Some("application/json"))).kind(),
            "direct_json"
        );
        assert_eq!(DeliveryPayload::classify(&RawDelivery::new("hello", None)).kind(), "unknown");
    }

    #[test]
    fn multipart_content_type_without_fields_falls_through_to_json() {
        let delivery = RawDelivery::new(
            r#"{"from":"a@x.com","subject":"s","text":"hello there"}"#,
            Some("multipart/form-data; boundary=zz"),
        );
        assert_eq!(DeliveryPayload::classify(&delivery).kind(), "direct_json");
    }

    #[test]
    fn direct_json_payload() {
        let delivery = RawDelivery::new(
            r#"{"from":{"name":"Jane","email":"jane@example.com"},"subject":"Hi","text":"Hello!","in_reply_to":"<a@x>","references":["<a@x>","<b@x>"]}"#,
            Some("application/json"),
        );
        let email = normalize(&delivery).unwrap();
        assert_eq!(email.sender, "jane@example.com");
        assert_eq!(email.subject, "Hi");
        assert_eq!(email.body, "Hello!");
        assert_eq!(email.in_reply_to.as_deref(), Some("a@x"));
        assert_eq!(email.reference_ids(), vec!["a@x", "b@x"]);
    }

    #[test]
    fn json_body_aliases() {
        let delivery = RawDelivery::new(r#"{"sender":"a@x.com","title":"T","content":"Body words"}"#, None);
        let email = normalize(&delivery).unwrap();
        assert_eq!(email.sender, "a@x.com");
        assert_eq!(email.subject, "T");
        assert_eq!(email.body, "Body words");
    }

    #[test]
    fn unknown_payload_is_scraped() {
        let delivery = RawDelivery::new("sender: bob@example.com\ntitle: Ping\nmessage: Are you there?\n", None);
        let email = normalize(&delivery).unwrap();
        assert_eq!(email.sender, "bob@example.com");
        assert_eq!(email.subject, "Ping");
        assert_eq!(email.body, "Are you there?");
    }

    #[test]
    fn bare_rfc822_message_is_treated_as_embedded() {
        let raw = "From: Jane <jane@x.com>\r\nSubject: Plain\r\nMessage-ID: <p@x>\r\n\r\nJust the body here.\r\n";
        let email = normalize(&RawDelivery::new(raw, Some("message/rfc822"))).unwrap();
        assert_eq!(email.sender, "jane@x.com");
        assert_eq!(email.message_id.as_deref(), Some("p@x"));
        assert_eq!(email.body, "Just the body here.");
    }

    #[test]
    fn garbage_is_unparseable() {
        let err = normalize(&RawDelivery::new("", None)).unwrap_err();
        assert!(err.is_permanent());
        let err = normalize(&RawDelivery::new("\u{1}\u{2} 12 34", None)).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn sender_falls_back_to_envelope_then_embedded() {
        let bytes = multipart(&[("envelope", r#"{"to":["me@x.com"],"from":"env@x.com"}"#), ("text", "hello there")]);
        let email = normalize(&RawDelivery::new(bytes, Some(MULTIPART_CT))).unwrap();
        assert_eq!(email.sender, "env@x.com");

        let bytes = multipart(&[("email", "From: Emb <emb@x.com>\nSubject: S\n\nBody text here")]);
        let email = normalize(&RawDelivery::new(bytes, Some(MULTIPART_CT))).unwrap();
        assert_eq!(email.sender, "emb@x.com");
        assert_eq!(email.subject, "S");
    }

    #[test]
    fn missing_sender_and_subject_use_sentinels() {
        let bytes = multipart(&[("text", "only a body")]);
        let email = normalize(&RawDelivery::new(bytes, Some(MULTIPART_CT))).unwrap();
        assert_eq!(email.sender, UNKNOWN_SENDER);
        assert_eq!(email.subject, NO_SUBJECT);
    }

    #[test]
    fn threading_from_embedded_message() {
        let embedded = "From: a@x.com\nMessage-ID: <b@example.com>\nIn-Reply-To: <a@example.com>\n\nreply";
        let bytes = multipart(&[("from", "a@x.com"), ("email", embedded)]);
        let email = normalize(&RawDelivery::new(bytes, Some(MULTIPART_CT))).unwrap();
        assert_eq!(email.message_id.as_deref(), Some("b@example.com"));
        assert_eq!(email.in_reply_to.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn threading_from_headers_field() {
        let bytes = multipart(&[
            ("headers", "Message-ID: <h@x>\nIn-Reply-To: <g@x>\nFrom: H <h@x.com>"),
            ("text", "body text"),
        ]);
        let email = normalize(&RawDelivery::new(bytes, Some(MULTIPART_CT))).unwrap();
        assert_eq!(email.message_id.as_deref(), Some("h@x"));
        assert_eq!(email.in_reply_to.as_deref(), Some("g@x"));
        assert_eq!(email.sender, "h@x.com");
    }

    #[test]
    fn prepare_exposes_dedup_inputs_before_body_extraction() {
        let bytes = multipart(&[("from", "a@x.com"), ("subject", "S"), ("text", "body")]);
        let prepared = prepare(&RawDelivery::new(bytes, Some(MULTIPART_CT)));
        assert_eq!(prepared.sender(), "a@x.com");
        assert_eq!(prepared.subject(), "S");
        assert!(prepared.threading.message_id.is_none());
    }

    #[test]
    fn send_time_prefers_relay_timestamp() {
        let embedded = "From: a@x.com\nDate: Tue, 2 Jun 2026 10:00:00 +0000\n\nhello there";
        let bytes = multipart(&[("timestamp", "1780394400"), ("email", embedded)]);
        let prepared = prepare(&RawDelivery::new(bytes, Some(MULTIPART_CT)));
        assert_eq!(
            prepared.delivered_at,
            DateTime::from_timestamp(1_780_394_400, 0)
        );
    }

    #[test]
    fn send_time_from_embedded_date_header() {
        let embedded = "From: a@x.com\nDate: Tue, 2 Jun 2026 12:00:00 +0200\n\nhello there";
        let bytes = multipart(&[("email", embedded)]);
        let prepared = prepare(&RawDelivery::new(bytes, Some(MULTIPART_CT)));
        assert_eq!(
            prepared.delivered_at.map(|d| d.to_rfc3339()).as_deref(),
            Some("2026-06-02T10:00:00+00:00")
        );
    }

    #[test]
    fn send_time_from_headers_field() {
        let bytes = multipart(&[
            ("headers", "From: a@x.com\nDate: Tue, 2 Jun 2026 10:00:00 +0000"),
            ("text", "hello there"),
        ]);
        let prepared = prepare(&RawDelivery::new(bytes, Some(MULTIPART_CT)));
        assert_eq!(
            prepared.delivered_at.map(|d| d.timestamp()),
            Some(1_780_394_400)
        );
    }

    #[test]
    fn send_time_absent_when_payload_has_none() {
        let bytes = multipart(&[("from", "a@x.com"), ("text", "hello there")]);
        assert!(prepare(&RawDelivery::new(bytes, Some(MULTIPART_CT))).delivered_at.is_none());
    }

    #[test]
    fn timestamp_formats() {
        let expected = DateTime::from_timestamp(1_780_394_400, 0);
        assert_eq!(parse_timestamp("1780394400"), expected);
        assert_eq!(parse_timestamp("1780394400000"), expected);
        assert_eq!(parse_timestamp("1780394400.0"), expected);
        assert_eq!(parse_timestamp("2026-06-02T10:00:00Z"), expected);
        assert_eq!(parse_timestamp("Tue, 2 Jun 2026 10:00:00 +0000"), expected);
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn bare_address_variants() {
        assert_eq!(bare_address("Jane Doe <jane@example.com>").as_deref(), Some("jane@example.com"));
        assert_eq!(bare_address("\"Doe, Jane\" <jane@example.com>").as_deref(), Some("jane@example.com"));
        assert_eq!(bare_address("jane@example.com").as_deref(), Some("jane@example.com"));
        assert_eq!(bare_address("no address here"), None);
        assert_eq!(bare_address(""), None);
    }

    #[test]
    fn encoded_subject_is_decoded() {
        assert_eq!(decode_subject("=?UTF-8?Q?Caf=C3=A9?="), "Café");
        assert_eq!(decode_subject("  Re:   Hello \n"), "Re: Hello");
    }
}
