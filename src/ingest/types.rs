//! Shared types for the extraction pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender recorded when no address could be recovered.
pub const UNKNOWN_SENDER: &str = "unknown@example.com";

/// Subject recorded when the delivery carries none.
pub const NO_SUBJECT: &str = "(no subject)";

// ── Raw delivery ────────────────────────────────────────────────────

/// A webhook body exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    /// Raw request body.
    pub bytes: Vec<u8>,
    /// `Content-Type` header of the request, if any.
    pub content_type: Option<String>,
    /// When the webhook received it.
    pub received_at: DateTime<Utc>,
}

impl RawDelivery {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
            received_at: Utc::now(),
        }
    }

    /// Body as text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

// ── Threading headers ───────────────────────────────────────────────

/// `Message-ID` / `In-Reply-To` / `References` recovered from a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadingHeaders {
    /// Angle brackets stripped.
    pub message_id: Option<String>,
    /// Angle brackets stripped.
    pub in_reply_to: Option<String>,
    /// Unfolded header value, as written.
    pub references: Option<String>,
}

impl ThreadingHeaders {
    pub fn is_empty(&self) -> bool {
        self.message_id.is_none() && self.in_reply_to.is_none() && self.references.is_none()
    }

    /// Fill any missing field from `other`.
    pub fn or(self, other: ThreadingHeaders) -> Self {
        Self {
            message_id: self.message_id.or(other.message_id),
            in_reply_to: self.in_reply_to.or(other.in_reply_to),
            references: self.references.or(other.references),
        }
    }
}

// ── Extracted email ─────────────────────────────────────────────────

/// The clean tuple handed to the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEmail {
    /// Bare address, or [`UNKNOWN_SENDER`].
    pub sender: String,
    pub subject: String,
    /// Decoded, quote-stripped body. May be empty.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

impl ExtractedEmail {
    /// Message ids listed in `References`, oldest first, brackets stripped.
    pub fn reference_ids(&self) -> Vec<String> {
        self.references
            .as_deref()
            .map(split_message_ids)
            .unwrap_or_default()
    }
}

/// Split a `References`-style header into bare ids.
pub fn split_message_ids(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(strip_angle_brackets)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `<abc@host>` → `abc@host`.
pub fn strip_angle_brackets(value: &str) -> &str {
    value.trim().trim_start_matches('<').trim_end_matches('>').trim()
}
