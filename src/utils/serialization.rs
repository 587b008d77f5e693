// src/utils/serialization.rs
//! Serialization utilities.
//!
//! Provides:
//! - JSON helpers used by the workflow document store
//! - Key encoding normalization (PEM / bare base64 / escaped newlines)
//! - Base64 helpers for signature values and data URLs

use serde::{Serialize, Deserialize};
use serde_json;

/// Serializes a value to a JSON string.
///
/// # Arguments
/// * `data` - The value to serialize (must implement `Serialize`)
///
/// # Returns
/// - `Ok(String)` with JSON representation on success
/// - `Err(serde_json::Error)` if serialization fails
pub fn serialize<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(data)
}

/// Deserializes a value from a JSON string.
///
/// # Arguments
/// * `data` - JSON string to deserialize
///
/// # Returns
/// - `Ok(T)` with deserialized value on success
/// - `Err(serde_json::Error)` if deserialization fails
pub fn deserialize<'a, T: Deserialize<'a>>(data: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(data)
}

/// Reduces a PEM or base64 key to its bare base64 body.
///
/// Keys pass through JSON bodies, form fields and copy/paste, so the same key
/// arrives with different line breaks, literal `\n` escapes, or with the
/// `-----BEGIN ...-----` armour stripped. Comparing normalized bodies makes
/// all of those spellings equal.
///
/// # Arguments
/// * `key` - PEM text or bare base64 body
///
/// # Returns
/// The base64 body with armour lines and all whitespace removed.
pub fn normalize_key_encoding(key: &str) -> String {
    let unescaped = key.replace("\\n", "\n").replace("\\r", "\r");
    unescaped
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Decodes a normalized key body into DER bytes.
///
/// # Errors
/// Returns the base64 decoding error when the body is not valid base64.
pub fn key_body_to_der(key: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::decode(normalize_key_encoding(key))
}

/// Encodes raw bytes as standard (padded) base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::encode(bytes)
}

/// Decodes standard base64, tolerating surrounding whitespace.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::decode(data.trim())
}

/// Splits a `data:<mime>;base64,<payload>` URL into its MIME type and bytes.
///
/// Returns `None` for anything that is not a base64 data URL or whose payload
/// does not decode.
pub fn decode_data_url(value: &str) -> Option<(String, Vec<u8>)> {
    let rest = value.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let bytes = decode_base64(payload).ok()?;
    Some((mime.to_string(), bytes))
}
