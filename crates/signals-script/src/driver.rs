//! Driver wrapper prepended to every buyer encoder program.
//!
//! The buyer program defines `encodeSignals(signals, maxSize)` which takes a
//! `Map<Uint8Array, Array<{signal_value, creation_time, package_name}>>` and
//! returns `{status, results: Uint8Array}`. The driver exposes
//! [`ENTRY_POINT`], which decodes the text-encoded argument, calls the buyer
//! function, and hex-encodes the returned bytes so the result crosses the
//! sandbox as `{status, results: "<hex>"}`.

use signals_core::KeyFormat;

/// Function the sandbox is asked to invoke.
pub const ENTRY_POINT: &str = "encodeSignalsDriver";

/// Name of the function a buyer program must define.
pub const ENCODER_FUNCTION: &str = "encodeSignals";

pub const SIGNALS_ARG: &str = "signals";
pub const MAX_SIZE_ARG: &str = "maxSize";

const COMMON: &str = r#"
function __signalsBytesToHex(bytes) {
  let out = '';
  for (let i = 0; i < bytes.length; i++) {
    out += ('0' + (bytes[i] & 0xff).toString(16)).slice(-2);
  }
  return out.toUpperCase();
}

function __signalsDecodeAll(signals, decode) {
  const decoded = new Map();
  for (const [key, entries] of Object.entries(signals)) {
    decoded.set(decode(key), entries.map((entry) => ({
      signal_value: decode(entry.val),
      creation_time: entry.time,
      package_name: entry.app,
    })));
  }
  return decoded;
}
"#;

const HEX_DECODER: &str = r#"
function __signalsDecode(text) {
  const bytes = new Uint8Array(text.length / 2);
  for (let i = 0; i < bytes.length; i++) {
    bytes[i] = parseInt(text.substr(i * 2, 2), 16);
  }
  return bytes;
}
"#;

// Plain ECMAScript: the sandbox context has no `atob`.
const BASE64_DECODER: &str = r#"
const __signalsBase64 = 'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/';
function __signalsDecode(text) {
  const clean = text.replace(/=+$/, '');
  const bytes = new Uint8Array(Math.floor(clean.length * 3 / 4));
  let acc = 0;
  let bits = 0;
  let at = 0;
  for (let i = 0; i < clean.length; i++) {
    acc = ((acc << 6) | __signalsBase64.indexOf(clean[i])) & 0xffffff;
    bits += 6;
    if (bits >= 8) {
      bits -= 8;
      bytes[at++] = (acc >> bits) & 0xff;
    }
  }
  return bytes;
}
"#;

const ENTRY: &str = r#"
function encodeSignalsDriver(signals, maxSize) {
  if (typeof encodeSignals !== 'function') {
    return null;
  }
  const result = encodeSignals(__signalsDecodeAll(signals, __signalsDecode), maxSize);
  if (result === null || result === undefined) {
    return null;
  }
  return {
    status: result.status,
    results: result.results === undefined || result.results === null
      ? undefined
      : __signalsBytesToHex(result.results),
  };
}
"#;

/// Driver source for the given argument format.
pub fn driver_script(format: KeyFormat) -> String {
    let decoder = match format {
        KeyFormat::Hex => HEX_DECODER,
        KeyFormat::Base64 => BASE64_DECODER,
    };
    format!("{COMMON}{decoder}{ENTRY}")
}

/// Full program text handed to the sandbox: driver first, buyer program after.
pub fn compose_program(encoder_program: &str, format: KeyFormat) -> String {
    format!("{}\n{}\n", driver_script(format), encoder_program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_program_keeps_buyer_code_last() {
        let program = compose_program("function encodeSignals() {}", KeyFormat::Hex);
        assert!(program.contains(ENTRY_POINT));
        assert!(program.trim_end().ends_with("function encodeSignals() {}"));
    }

    #[test]
    fn decoder_follows_format() {
        assert!(driver_script(KeyFormat::Hex).contains("parseInt"));
        assert!(!driver_script(KeyFormat::Hex).contains("__signalsBase64"));
        assert!(driver_script(KeyFormat::Base64).contains("__signalsBase64"));
        assert!(!driver_script(KeyFormat::Base64).contains("atob"));
    }
}
