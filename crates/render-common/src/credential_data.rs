// Worker credentials persisted in the `.credentials` file.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of a generated worker secret.
pub const SECRET_LENGTH: usize = 32;

/// The worker's identity on the manager.
///
/// `worker_id` stays `None` until registration succeeds. The secret is
/// generated locally once and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    pub worker_secret: String,
}

impl WorkerCredentials {
    /// Fresh, unregistered credentials with a random secret.
    pub fn generate() -> Self {
        Self {
            worker_id: None,
            worker_secret: generate_secret(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.worker_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// A random alphanumeric secret of [`SECRET_LENGTH`] characters.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LENGTH);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn unregistered_until_id_set() {
        let mut creds = WorkerCredentials::generate();
        assert!(!creds.is_registered());
        creds.worker_id = Some(String::new());
        assert!(!creds.is_registered());
        creds.worker_id = Some("5a1b".into());
        assert!(creds.is_registered());
    }

    #[test]
    fn missing_id_deserializes() {
        let creds: WorkerCredentials =
            serde_json::from_str(r#"{"worker_secret":"abc"}"#).unwrap();
        assert_eq!(creds.worker_id, None);
        assert_eq!(creds.worker_secret, "abc");
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("worker_id"));
    }
}
