use crate::secrets::string::SecretString;
use crate::secrets::SecretManager;
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// An in-memory cache in front of `SecretManager`.
///
/// A batch run issues several provider calls per term; the key is resolved
/// once and reused.
#[derive(Clone)]
pub struct SecretCache {
    manager: Arc<SecretManager>,
    cache: Arc<RwLock<HashMap<String, SecretString>>>,
}

impl SecretCache {
    pub fn new(manager: Arc<SecretManager>) -> Self {
        Self {
            manager,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Retrieves a secret, checking the memory cache first.
    pub fn get_secret(&self, key: &str) -> Result<SecretString, EngineError> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(secret) = cache.get(key) {
                return Ok(secret.clone());
            }
        }

        let secret = self.manager.get_secret(key)?;

        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(key.to_string(), secret.clone());
        }

        Ok(secret)
    }

    /// Seed the cache with a known value
    pub fn insert(&self, key: &str, value: SecretString) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_secret_is_served_from_cache() {
        let cache = SecretCache::new(Arc::new(SecretManager::new("colgen-test")));
        cache.insert("COLGEN_CACHED_KEY", SecretString::new("cached"));

        let secret = cache.get_secret("COLGEN_CACHED_KEY").unwrap();
        assert_eq!(secret.unsecure(), "cached");
    }

    #[test]
    fn test_cache_populated_from_environment() {
        let key = "COLGEN_CACHE_ENV_KEY";
        std::env::set_var(key, "from-env");
        let cache = SecretCache::new(Arc::new(SecretManager::new("colgen-test")));

        assert_eq!(cache.get_secret(key).unwrap().unsecure(), "from-env");

        // Still served after the environment changes
        std::env::remove_var(key);
        assert_eq!(cache.get_secret(key).unwrap().unsecure(), "from-env");
    }
}
