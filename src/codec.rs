use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Failure to turn an AUTH payload back into text
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded payload is not UTF-8")]
    NotUtf8,
}

/// Encodes UTF-8 text the way SMTP AUTH challenges carry it
pub fn encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Decodes an AUTH response back into text
pub fn decode(data: &str) -> Result<String, DecodeError> {
    let bytes = STANDARD.decode(data.trim())?;
    String::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts() {
        assert_eq!(encode("Username"), "VXNlcm5hbWU=");
        assert_eq!(encode("Password"), "UGFzc3dvcmQ=");
    }

    #[test]
    fn test_decode_plain_blob() {
        let blob = encode("\0alice\0secret");
        assert_eq!(decode(&blob).unwrap(), "\0alice\0secret");
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(decode("not base64!"), Err(DecodeError::Base64(_))));
        // 0xff 0xfe
        assert_eq!(decode("//4="), Err(DecodeError::NotUtf8));
    }
}
