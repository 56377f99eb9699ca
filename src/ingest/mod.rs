//! Extraction pipeline: raw webhook delivery → [`ExtractedEmail`].

pub mod body;
pub mod decode;
pub mod multipart;
pub mod payload;
pub mod threading;
pub mod types;

pub use body::{Strategy, extract_body};
pub use decode::decode;
pub use multipart::{extract_embedded_message, extract_fields};
pub use payload::{DeliveryPayload, PreparedDelivery, normalize, prepare};
pub use threading::resolve_threading;
pub use types::{ExtractedEmail, RawDelivery, ThreadingHeaders, UNKNOWN_SENDER};
