//! RFC 2397 `data:` URL decoding.
//!
//! MachineConfig file contents arrive encoded as data URLs, either
//! base64 (`data:;base64,...`) or percent-encoded plain text (`data:,...`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Errors from data URL decoding
#[derive(Debug, Error)]
pub enum DataUrlError {
    /// The string does not carry the `data:` scheme
    #[error("not a data URL: {0:?}")]
    Scheme(String),

    /// No comma separating the media type from the payload
    #[error("data URL missing ',' separator")]
    MissingSeparator,

    /// The base64 payload failed to decode
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode a data URL into raw bytes.
pub fn decode(url: &str) -> Result<Vec<u8>, DataUrlError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| DataUrlError::Scheme(head(url)))?;
    let (mediatype, payload) = rest.split_once(',').ok_or(DataUrlError::MissingSeparator)?;

    if mediatype.split(';').any(|p| p == "base64") {
        Ok(STANDARD.decode(payload)?)
    } else {
        Ok(percent_decode(payload))
    }
}

/// Byte-level percent decoding. Malformed escapes pass through verbatim.
fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(hex) = input.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    out
}

fn head(s: &str) -> String {
    s.chars().take(32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64() {
        let url = "data:;base64,aGVsbG8gd29ybGQ=";
        assert_eq!(decode(url).unwrap(), b"hello world");
    }

    #[test]
    fn test_decode_base64_with_mediatype() {
        let url = "data:text/plain;charset=utf-8;base64,Zm9v";
        assert_eq!(decode(url).unwrap(), b"foo");
    }

    #[test]
    fn test_decode_plain_with_percent_escapes() {
        let url = "data:,hello%20world%0A";
        assert_eq!(decode(url).unwrap(), b"hello world\n");
    }

    #[test]
    fn test_decode_empty_payload() {
        assert_eq!(decode("data:,").unwrap(), b"");
    }

    #[test]
    fn test_rejects_non_data_url() {
        assert!(matches!(
            decode("https://example.com"),
            Err(DataUrlError::Scheme(_))
        ));
    }

    #[test]
    fn test_rejects_missing_separator() {
        assert!(matches!(
            decode("data:text/plain"),
            Err(DataUrlError::MissingSeparator)
        ));
    }

    #[test]
    fn test_malformed_escape_passes_through() {
        assert_eq!(decode("data:,50%").unwrap(), b"50%");
        assert_eq!(decode("data:,a%zzb").unwrap(), b"a%zzb");
    }
}
