//! Base64 codec for binary payloads exchanged with callers.
//!
//! Decoding is an explicit, validated step: garbage input and empty results
//! are reported as [`CoreError::Data`] rather than passed along.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::CoreError;

/// Decode a base64 payload into bytes.
///
/// Accepts an optional `data:<mime>;base64,` prefix and ignores embedded
/// whitespace (line-wrapped payloads are common).
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, CoreError> {
    let payload = strip_data_url_prefix(encoded.trim());
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();

    if compact.is_empty() {
        return Err(CoreError::Data("Binary payload is empty".to_string()));
    }

    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CoreError::Data(format!("Binary payload is not valid base64: {e}")))?;

    if bytes.is_empty() {
        return Err(CoreError::Data(
            "Binary payload decoded to zero bytes".to_string(),
        ));
    }

    Ok(bytes)
}

/// Encode bytes as standard padded base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn strip_data_url_prefix(value: &str) -> &str {
    if value.starts_with("data:") {
        if let Some((_, rest)) = value.split_once(";base64,") {
            return rest;
        }
    }
    value
}
