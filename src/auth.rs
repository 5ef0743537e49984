use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::AuthError;
use crate::store::{read_json, write_json_atomic};

pub(crate) const MAX_ATTEMPTS: u32 = 3;

pub(crate) trait Authenticator {
    /// Checks `secret`, recording the outcome in the failure counter.
    fn verify(&self, secret: &str) -> Result<bool, AuthError>;
    fn reset(&self, new_secret: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PasskeyCredential {
    pub(crate) salt: String,
    pub(crate) hash: String,
    #[serde(default)]
    pub(crate) failures: u32,
}

impl PasskeyCredential {
    fn is_set(&self) -> bool {
        !self.hash.is_empty()
    }
}

/// Salted SHA-256 passkey kept in a JSON file.
#[derive(Debug, Clone)]
pub(crate) struct PasskeyFile {
    path: PathBuf,
}

impl PasskeyFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_configured(&self) -> Result<bool, AuthError> {
        Ok(self.load()?.is_set())
    }

    pub(crate) fn load(&self) -> Result<PasskeyCredential, AuthError> {
        read_json(&self.path).map_err(|err| AuthError::Unreadable {
            path: self.path.clone(),
            detail: err.to_string(),
        })
    }

    fn save(&self, credential: &PasskeyCredential) -> Result<(), AuthError> {
        write_json_atomic(&self.path, credential).map_err(|err| AuthError::Write {
            path: self.path.clone(),
            detail: err.to_string(),
        })
    }
}

impl Authenticator for PasskeyFile {
    fn verify(&self, secret: &str) -> Result<bool, AuthError> {
        let mut credential = self.load()?;
        if !credential.is_set() {
            return Ok(true);
        }
        let matches = hash_secret(&credential.salt, secret) == credential.hash;
        if matches {
            if credential.failures > 0 {
                credential.failures = 0;
                self.save(&credential)?;
            }
        } else {
            credential.failures = credential.failures.saturating_add(1);
            self.save(&credential)?;
        }
        Ok(matches)
    }

    fn reset(&self, new_secret: &str) -> Result<(), AuthError> {
        let new_secret = new_secret.trim();
        if new_secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = hex::encode(salt);
        let hash = hash_secret(&salt, new_secret);
        self.save(&PasskeyCredential {
            salt,
            hash,
            failures: 0,
        })
    }
}

fn hash_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Gives the user up to [`MAX_ATTEMPTS`] tries. Every wrong passkey triggers a
/// notification through `on_event`, and so does the final denial. `next_secret`
/// returning `None` means no more input is available.
pub(crate) fn authenticate<S, N>(
    auth: &dyn Authenticator,
    mut next_secret: S,
    mut on_event: N,
) -> Result<(), AuthError>
where
    S: FnMut(u32) -> Option<String>,
    N: FnMut(&str),
{
    for attempt in 1..=MAX_ATTEMPTS {
        let Some(secret) = next_secret(attempt) else {
            break;
        };
        if auth.verify(&secret)? {
            return Ok(());
        }
        on_event("Passkey Authentication Failed!");
    }
    on_event("Passkey; Access Denied!");
    Err(AuthError::Denied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn passkey(temp: &TempDir) -> PasskeyFile {
        PasskeyFile::new(temp.path().join("passkey.json"))
    }

    #[test]
    fn unset_passkey_lets_everyone_in() {
        let temp = TempDir::new().expect("temp dir");
        let file = passkey(&temp);
        assert!(!file.is_configured().expect("configured"));
        assert!(file.verify("anything").expect("verify"));
    }

    #[test]
    fn reset_stores_salted_hash_and_verify_tracks_failures() {
        let temp = TempDir::new().expect("temp dir");
        let file = passkey(&temp);
        file.reset("open sesame").expect("reset");

        let raw = fs::read_to_string(file.path()).expect("read");
        assert!(!raw.contains("open sesame"));
        let credential = file.load().expect("load");
        assert_eq!(credential.salt.len(), 32);
        assert_eq!(credential.hash.len(), 64);

        assert!(!file.verify("wrong").expect("verify"));
        assert!(!file.verify("wrong again").expect("verify"));
        assert_eq!(file.load().expect("load").failures, 2);

        assert!(file.verify("open sesame").expect("verify"));
        assert_eq!(file.load().expect("load").failures, 0);
    }

    #[test]
    fn same_secret_gets_a_fresh_salt_on_reset() {
        let temp = TempDir::new().expect("temp dir");
        let file = passkey(&temp);
        file.reset("pw").expect("reset");
        let first = file.load().expect("load");
        file.reset("pw").expect("reset");
        let second = file.load().expect("load");
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn empty_secret_is_rejected() {
        let temp = TempDir::new().expect("temp dir");
        assert!(matches!(
            passkey(&temp).reset("   "),
            Err(AuthError::EmptySecret)
        ));
    }

    #[test]
    fn three_wrong_attempts_deny_and_notify_each_time() {
        let temp = TempDir::new().expect("temp dir");
        let file = passkey(&temp);
        file.reset("right").expect("reset");

        let mut events = Vec::new();
        let result = authenticate(&file, |_| Some("wrong".to_string()), |event| {
            events.push(event.to_string())
        });
        assert!(matches!(result, Err(AuthError::Denied)));
        assert_eq!(
            events,
            vec![
                "Passkey Authentication Failed!",
                "Passkey Authentication Failed!",
                "Passkey Authentication Failed!",
                "Passkey; Access Denied!",
            ]
        );
    }

    #[test]
    fn success_on_a_later_attempt_is_accepted() {
        let temp = TempDir::new().expect("temp dir");
        let file = passkey(&temp);
        file.reset("right").expect("reset");

        let mut events = Vec::new();
        let result = authenticate(
            &file,
            |attempt| Some(if attempt < 2 { "nope" } else { "right" }.to_string()),
            |event| events.push(event.to_string()),
        );
        assert!(result.is_ok());
        assert_eq!(events, vec!["Passkey Authentication Failed!"]);
    }

    #[test]
    fn running_out_of_input_denies() {
        let temp = TempDir::new().expect("temp dir");
        let file = passkey(&temp);
        file.reset("right").expect("reset");
        let result = authenticate(&file, |_| None, |_| {});
        assert!(matches!(result, Err(AuthError::Denied)));
    }
}
