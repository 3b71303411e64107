//! JSON body parsing and serialization.
//!
//! Backed entirely by `serde_json`. `Request::json` and response-body helpers both
//! go through [`parse`]/[`write_into`] so body bytes never need an intermediate
//! `String` allocation.

pub type JsonValue = serde_json::Value;

/// Parse a JSON body. Kept as bytes-in rather than `&str`-in since bodies arrive as
/// raw bytes off the wire and may not be valid UTF-8 outside the JSON payload itself.
#[inline]
pub fn parse(input: &[u8]) -> Result<JsonValue, String> {
    serde_json::from_slice(input).map_err(|e| format!("JSON parse error: {e}"))
}

#[inline]
pub fn parse_str(input: &str) -> Result<JsonValue, String> {
    serde_json::from_str(input).map_err(|e| format!("JSON parse error: {e}"))
}

#[inline]
pub fn serialize(value: &JsonValue) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("JSON serialize error: {e}"))
}

#[inline]
pub fn serialize_bytes(value: &JsonValue) -> Result<Vec<u8>, String> {
    serde_json::to_vec(value).map_err(|e| format!("JSON serialize error: {e}"))
}

#[inline]
pub fn serialize_pretty(value: &JsonValue) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialize error: {e}"))
}

/// Write `value` directly into an existing byte buffer rather than allocating a
/// fresh one, for response paths that already own a RESPONSE-arena buffer.
pub fn write_into(value: &JsonValue, out: &mut Vec<u8>) -> Result<(), String> {
    serde_json::to_writer(out, value).map_err(|e| format!("JSON serialize error: {e}"))
}
