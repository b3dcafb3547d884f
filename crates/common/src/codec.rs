//! Text encodings used to carry binary file content over text-only channels.

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid hex text: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid base64 text: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded bytes are not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Lowercase hex text of `bytes`, two characters per byte.
pub fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(bytes)
}

/// Inverse of [`hex_encode`]. Accepts either letter case; surrounding
/// whitespace is ignored so a trailing newline from a terminal tool is harmless.
pub fn hex_decode(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(hex::decode(text.trim())?)
}

pub fn b64_encode(bytes: impl AsRef<[u8]>) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn b64_decode(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(text.trim())?)
}

/// Base64 form of a plain text message.
pub fn b64_encode_text(text: &str) -> String {
    b64_encode(text.as_bytes())
}

/// Plain text behind a base64 message.
pub fn b64_decode_text(text: &str) -> Result<String, CodecError> {
    Ok(String::from_utf8(b64_decode(text)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_arbitrary_bytes() {
        let samples: [&[u8]; 4] = [b"", b"error", &[0x00, 0xff, 0x10, 0x7f], &[0xde; 300]];
        for bytes in samples {
            assert_eq!(hex_decode(&hex_encode(bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn hex_of_error_word_is_stable() {
        assert_eq!(hex_encode(b"error"), "6572726f72");
    }

    #[test]
    fn hex_decode_accepts_uppercase_and_trailing_newline() {
        assert_eq!(hex_decode("6869\n").unwrap(), b"hi");
        assert_eq!(hex_decode("DEADBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn hex_decode_rejects_odd_length_and_bad_digits() {
        assert!(matches!(hex_decode("abc"), Err(CodecError::Hex(_))));
        assert!(matches!(hex_decode("zz"), Err(CodecError::Hex(_))));
    }

    #[test]
    fn base64_text_round_trip() {
        let encoded = b64_encode_text("whoami && id");
        assert_eq!(encoded, "d2hvYW1pICYmIGlk");
        assert_eq!(b64_decode_text(&encoded).unwrap(), "whoami && id");
    }

    #[test]
    fn base64_decode_rejects_garbage() {
        assert!(b64_decode("***").is_err());
        assert!(matches!(
            b64_decode_text(&b64_encode([0xff, 0xfe])),
            Err(CodecError::Utf8(_))
        ));
    }
}
