//! Hex codec for byte payloads crossing the page boundary.
//!
//! Pages send and receive APDU payloads as hex strings; the device transport
//! works on raw bytes.

use crate::error::RelayResult;

/// Decode a hex string into bytes. Accepts upper and lower case digits.
pub fn decode_hex(data: &str) -> RelayResult<Vec<u8>> {
    Ok(hex::decode(data)?)
}

/// Encode bytes as a lowercase hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
