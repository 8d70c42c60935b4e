use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Decides whether a username/password pair may use the server.
///
/// Implementations are shared by every session, so `validate` must not
/// mutate anything.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, user: &str, password: &str) -> bool;
}

/// In-memory `user -> password` table loaded once at startup
#[derive(Debug, Default, Clone)]
pub struct PasswordFileValidator {
    users: HashMap<String, String>,
}

impl PasswordFileValidator {
    /// Loads a `username:password` per line file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read password file: {:?}", path))?;
        let validator = Self::parse(&content);
        eprintln!("[INFO] {} password entries loaded from {:?}", validator.len(), path);
        Ok(validator)
    }

    /// Parses password file content. Blank lines and `#` comments are
    /// ignored, lines without a colon are reported and skipped.
    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();

        for line in content.lines() {
            let entry = line.trim();
            if entry.len() <= 1 || entry.starts_with('#') {
                continue;
            }

            match entry.split_once(':') {
                Some((name, password)) => {
                    let name = name.trim();
                    users.insert(name.to_string(), password.trim().to_string());
                    eprintln!("[INFO] password entry '{}' read", name);
                }
                None => {
                    eprintln!("[WARNING] invalid entry in password file skipped");
                }
            }
        }

        Self { users }
    }

    /// Parses a space separated `user:password` list as given on the
    /// command line
    pub fn from_pairs(pairs: &str) -> Self {
        let mut users = HashMap::new();

        for part in pairs.split_whitespace() {
            match part.split_once(':') {
                Some((user, password)) if !user.is_empty() => {
                    users.insert(user.to_string(), password.to_string());
                    eprintln!("[INFO] credential for user '{}' added", user);
                }
                _ => eprintln!("[WARNING] invalid credential entry skipped"),
            }
        }

        Self { users }
    }

    pub fn merge(&mut self, other: PasswordFileValidator) {
        self.users.extend(other.users);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialValidator for PasswordFileValidator {
    fn validate(&self, user: &str, password: &str) -> bool {
        self.users.get(user).map_or(false, |expected| expected == password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORDS: &str = "\
# users allowed to submit mail
alice:secret
 bob : hunter2

garbage line
x
carol:pass:with:colons
";

    #[test]
    fn test_parse_entries() {
        let validator = PasswordFileValidator::parse(PASSWORDS);
        assert_eq!(validator.len(), 3);
        assert!(validator.validate("alice", "secret"));
        assert!(validator.validate("bob", "hunter2"));
        assert!(validator.validate("carol", "pass:with:colons"));
    }

    #[test]
    fn test_rejects_unknown_pairs() {
        let validator = PasswordFileValidator::parse(PASSWORDS);
        assert!(!validator.validate("alice", "wrong"));
        assert!(!validator.validate("mallory", "secret"));
        assert!(!validator.validate("garbage line", ""));
        assert!(!validator.validate("# users allowed to submit mail", ""));
    }

    #[test]
    fn test_failed_validation_leaves_table_alone() {
        let validator = PasswordFileValidator::parse(PASSWORDS);
        for _ in 0..5 {
            assert!(!validator.validate("alice", "nope"));
            assert!(!validator.validate("eve", "secret"));
        }
        assert_eq!(validator.len(), 3);
        assert!(validator.validate("alice", "secret"));
    }

    #[test]
    fn test_inline_pairs() {
        let mut validator = PasswordFileValidator::from_pairs("dave:one erin:two :orphan broken");
        assert_eq!(validator.len(), 2);
        assert!(validator.validate("erin", "two"));

        validator.merge(PasswordFileValidator::parse("alice:secret"));
        assert!(validator.validate("alice", "secret"));
        assert!(validator.validate("dave", "one"));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("mailreceiver-pw-{}", std::process::id()));
        std::fs::write(&path, PASSWORDS).unwrap();
        let validator = PasswordFileValidator::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(validator.validate("alice", "secret"));

        assert!(PasswordFileValidator::from_file(Path::new("/nonexistent/passwords")).is_err());
    }
}
