//! `data:` URI encoding and decoding
//!
//! Only the base64 form (`data:<mime>;base64,<payload>`) is produced. Both
//! base64 and percent-free plain payloads are accepted when decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{ForkchatError, Result};

/// Embeds bytes in a self-contained `data:` URI
///
/// # Examples
///
/// ```
/// use forkchat::media::data_uri;
///
/// let uri = data_uri::encode(b"hi", "text/plain");
/// assert_eq!(uri, "data:text/plain;base64,aGk=");
/// ```
pub fn encode(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Splits a `data:` URI into its payload bytes and MIME type
///
/// A missing MIME type defaults to `text/plain` as in RFC 2397.
pub fn decode(uri: &str) -> Result<(Vec<u8>, String)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| ForkchatError::Media("not a data URI".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ForkchatError::Media("data URI has no payload separator".to_string()))?;

    let (mime, is_base64) = match header.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (header, false),
    };
    let mime = mime.split(';').next().unwrap_or_default().trim();
    let mime = if mime.is_empty() { "text/plain" } else { mime };

    let bytes = if is_base64 {
        STANDARD
            .decode(payload.trim())
            .map_err(|e| ForkchatError::Media(format!("invalid base64 payload: {}", e)))?
    } else {
        payload.as_bytes().to_vec()
    };

    Ok((bytes, mime.to_string()))
}
