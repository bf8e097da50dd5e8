// SecretMasker: replaces registered secret values (the worker secret and
// anything a command handler registers) in trace lines and task logs.

use parking_lot::RwLock;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Thread-safe store of secret values.
#[derive(Debug, Default)]
pub struct SecretMasker {
    /// Sorted longest first, so a secret containing another is masked whole.
    secrets: RwLock<Vec<String>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Empty or whitespace-only values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if secrets.iter().any(|s| s == trimmed) {
            return;
        }
        secrets.push(trimmed.to_string());
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Replace every registered secret in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let shortest = secrets.last().map(String::len).unwrap_or(0);
        if secrets.is_empty() || input.len() < shortest {
            return input.to_string();
        }

        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_worker_secret() {
        let masker = SecretMasker::new();
        masker.add_value("Zk3PqW9xYb2");
        assert_eq!(
            masker.mask_secrets("auth (5555, Zk3PqW9xYb2) rejected"),
            "auth (5555, ***) rejected"
        );
    }

    #[test]
    fn test_longest_secret_first() {
        let masker = SecretMasker::new();
        masker.add_value("pass");
        masker.add_value("password");
        assert_eq!(masker.mask_secrets("my password is here"), "my *** is here");
    }

    #[test]
    fn test_duplicates_and_blanks_ignored() {
        let masker = SecretMasker::new();
        masker.add_value("");
        masker.add_value("   ");
        masker.add_value("abc");
        masker.add_value(" abc ");
        assert_eq!(masker.secret_count(), 1);
    }

    #[test]
    fn test_no_secrets_passthrough() {
        let masker = SecretMasker::new();
        assert_eq!(masker.mask_secrets("hello world"), "hello world");
    }
}
