pub mod cache;
pub mod string;

pub use cache::SecretCache;
pub use string::SecretString;

use keyring::Entry;
use regex::Regex;
use sdk::errors::EngineError;
use std::sync::OnceLock;

/// SecretManager looks up provider credentials.
///
/// A secret is resolved from the process environment first and from the OS
/// keychain second:
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service (libsecret)
///
/// Batch runs are unattended, so a missing secret is an error rather than an
/// interactive prompt.
///
/// The SecretManager also scrubs secrets out of text before it is logged or
/// recorded on an operation.
pub struct SecretManager {
    service_name: String,
}

/// Compiled once and reused.
static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns match:
/// - OpenAI API keys: sk-[a-zA-Z0-9]{20,}
/// - Anthropic API keys: sk-ant-...
/// - Google API keys: AIza[0-9A-Za-z-_]{35}
/// - GitHub tokens: ghp_[a-zA-Z0-9]{36}
/// - Bearer tokens: Bearer\s+[^\s]{20,}
fn get_secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"sk-[a-zA-Z0-9\-_]{20,}",
            r"AIza[0-9A-Za-z\-_]{35}",
            r"ghp_[a-zA-Z0-9]{36}",
            r"Bearer\s+[^\s]{20,}",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Replace every detected secret in `text` with `[REDACTED]`
pub fn scrub(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in get_secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

impl SecretManager {
    /// Creates a new SecretManager with the given keychain service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Retrieves a secret.
    ///
    /// `key` is read as an environment variable first (e.g. `OPENAI_API_KEY`),
    /// then from the keychain under its lowercase name (`openai_api_key`).
    ///
    /// # Errors
    /// Returns `EngineError::Secret` if neither source holds a non-empty value
    pub fn get_secret(&self, key: &str) -> Result<SecretString, EngineError> {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                tracing::debug!("Retrieved secret '{}' from environment", key);
                return Ok(SecretString::new(value.trim()));
            }
        }

        let entry = self.entry(key)?;
        match entry.get_password() {
            Ok(secret) if !secret.is_empty() => {
                tracing::debug!("Retrieved secret '{}' from keychain", key);
                Ok(SecretString::new(secret))
            }
            Ok(_) | Err(keyring::Error::NoEntry) => Err(EngineError::Secret(format!(
                "Secret '{}' is not set in the environment or the keychain",
                key
            ))),
            Err(e) => Err(EngineError::Secret(format!(
                "Failed to retrieve secret '{}': {}",
                key, e
            ))),
        }
    }

    /// Stores a secret in the OS keychain.
    pub fn set_secret(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.entry(key)?.set_password(value).map_err(|e| {
            EngineError::Secret(format!("Failed to store secret '{}': {}", key, e))
        })?;

        tracing::info!("Stored secret '{}' in keychain", key);
        Ok(())
    }

    /// Deletes a secret from the OS keychain.
    pub fn delete_secret(&self, key: &str) -> Result<(), EngineError> {
        self.entry(key)?.delete_password().map_err(|e| {
            EngineError::Secret(format!("Failed to delete secret '{}': {}", key, e))
        })?;

        tracing::info!("Deleted secret '{}' from keychain", key);
        Ok(())
    }

    /// Checks whether a secret can be resolved without failing.
    pub fn has_secret(&self, key: &str) -> bool {
        self.get_secret(key).is_ok()
    }

    /// Scrubs secrets from text by replacing them with [REDACTED].
    ///
    /// # Examples
    /// ```
    /// use colgen_engine::secrets::SecretManager;
    ///
    /// let manager = SecretManager::new("test");
    /// let scrubbed = manager.scrub("My API key is sk-1234567890abcdefghij");
    /// assert_eq!(scrubbed, "My API key is [REDACTED]");
    /// ```
    pub fn scrub(&self, text: &str) -> String {
        scrub(text)
    }

    fn entry(&self, key: &str) -> Result<Entry, EngineError> {
        Entry::new(&self.service_name, &key.to_lowercase()).map_err(|e| {
            EngineError::Secret(format!("Failed to create keyring entry: {}", e))
        })
    }
}
