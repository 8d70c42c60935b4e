use thiserror::Error;

use crate::limits::DATA_SIZE_DEFAULT;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SMTPUTF8 cannot be enabled together with decode-data mode")]
    Utf8WithDecodeData,

    #[error("hostname must not be empty")]
    EmptyHostname,
}

/// Engine settings shared read-only by every session
#[derive(Debug, Clone)]
pub struct Settings {
    /// Name announced in the banner and in HELO/EHLO replies
    pub hostname: String,
    /// Maximum accepted message size, `None` disables the limit
    pub data_size_limit: Option<usize>,
    pub enable_smtputf8: bool,
    /// Deliver bodies as UTF-8 text and do not offer 8BITMIME
    pub decode_data: bool,
    /// Offer STARTTLS on plaintext connections
    pub starttls: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            data_size_limit: Some(DATA_SIZE_DEFAULT),
            enable_smtputf8: false,
            decode_data: false,
            starttls: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        if self.enable_smtputf8 && self.decode_data {
            return Err(ConfigError::Utf8WithDecodeData);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Settings::default().validate().is_ok());

        let settings = Settings {
            enable_smtputf8: true,
            decode_data: true,
            ..Settings::default()
        };
        assert_eq!(settings.validate(), Err(ConfigError::Utf8WithDecodeData));

        let settings = Settings {
            hostname: " ".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.validate(), Err(ConfigError::EmptyHostname));
    }
}
