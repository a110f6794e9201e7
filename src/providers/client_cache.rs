//! Bounded cache of ready-to-use HTTP clients
//!
//! Entries are keyed by a SHA-256 digest of endpoint and credential, so the
//! plaintext key never appears as a cache key. Idle clients are evicted.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

pub struct ClientCache {
    clients: Cache<String, Client>,
}

/// Stable cache key for an endpoint and optional bearer credential
pub fn cache_key(endpoint: &str, credential: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    if let Some(credential) = credential {
        hasher.update(credential.as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl ClientCache {
    pub fn new(max_entries: u64, idle: Duration) -> Self {
        Self {
            clients: Cache::builder()
                .max_capacity(max_entries)
                .time_to_idle(idle)
                .build(),
        }
    }

    /// Return the cached client for this endpoint and credential, building it once
    pub fn get_or_create(&self, endpoint: &str, credential: Option<&str>) -> Result<Client> {
        let key = cache_key(endpoint, credential);
        self.clients
            .try_get_with(key, || {
                debug!(endpoint, "Building HTTP client");
                build_client(credential)
            })
            .map_err(|e: Arc<Error>| Error::Config(format!("Failed to build HTTP client: {e}")))
    }

    pub fn entry_count(&self) -> u64 {
        self.clients.run_pending_tasks();
        self.clients.entry_count()
    }
}

fn build_client(credential: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Some(key) = credential.filter(|k| !k.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| Error::Config("API key contains invalid header characters".to_string()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(Client::builder().default_headers(headers).build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_hides_credential() {
        let key = cache_key("https://api.openai.com/v1", Some("sk-secret-value"));
        assert_eq!(key.len(), 64);
        assert!(!key.contains("sk-secret"));
    }

    #[test]
    fn test_cache_key_distinguishes_inputs() {
        let base = cache_key("http://localhost:7001", None);
        assert_eq!(base, cache_key("http://localhost:7001", None));
        assert_ne!(base, cache_key("http://localhost:7002", None));
        assert_ne!(
            cache_key("https://api.openai.com/v1", Some("a")),
            cache_key("https://api.openai.com/v1", Some("b"))
        );
    }

    #[test]
    fn test_clients_are_reused() {
        let cache = ClientCache::new(16, Duration::from_secs(60));
        cache.get_or_create("http://localhost:7001", None).unwrap();
        cache.get_or_create("http://localhost:7001", None).unwrap();
        cache.get_or_create("https://api.openai.com/v1", Some("sk-1")).unwrap();
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let cache = ClientCache::new(16, Duration::from_secs(60));
        let result = cache.get_or_create("https://api.openai.com/v1", Some("bad\nkey"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
