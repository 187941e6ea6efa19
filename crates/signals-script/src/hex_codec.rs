//! Hex transport encoding for binary payloads crossing the sandbox.

/// Upper-case hex rendering of `bytes`.
pub fn binary_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode a hex string (either case). Odd lengths and non-hex digits fail.
pub fn hex_to_binary(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(text)
}
