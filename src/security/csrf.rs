//! Per-session anti-forgery token.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::crypto::{constant_time_eq, random_hex};

/// Request header carrying the token on state-changing requests.
pub const CSRF_HEADER: &str = "x-csrf-token";
const STORE_KEY: &str = "csrf_token";

/// Token length in random bytes; hex encoding doubles it.
pub const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF token has not been generated for this session")]
    Missing,
}

/// Session-scoped key/value storage. Values live exactly as long as the
/// session that owns the store.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, String>>,
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Issues and checks the CSRF token held in a [`SessionStore`].
#[derive(Debug, Default)]
pub struct CsrfGuard<S: SessionStore> {
    store: S,
}

impl<S: SessionStore> CsrfGuard<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Return the session token, generating and persisting it on first use.
    pub fn ensure_token(&self) -> String {
        if let Some(existing) = self.store.get(STORE_KEY) {
            return existing;
        }
        let token = random_hex(TOKEN_BYTES);
        self.store.set(STORE_KEY, token.clone());
        token
    }

    pub fn token(&self) -> Option<String> {
        self.store.get(STORE_KEY)
    }

    /// False when no token exists or the candidate differs.
    pub fn validate(&self, candidate: &str) -> bool {
        match self.store.get(STORE_KEY) {
            Some(stored) => constant_time_eq(stored.as_bytes(), candidate.as_bytes()),
            None => false,
        }
    }

    /// Header pair for outbound requests. Callers must have called
    /// [`CsrfGuard::ensure_token`] first.
    pub fn header(&self) -> Result<(&'static str, String), CsrfError> {
        self.store
            .get(STORE_KEY)
            .map(|token| (CSRF_HEADER, token))
            .ok_or(CsrfError::Missing)
    }

    pub fn clear(&self) {
        self.store.remove(STORE_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> CsrfGuard<MemorySessionStore> {
        CsrfGuard::new(MemorySessionStore::default())
    }

    #[test]
    fn token_is_64_hex_chars_and_stable() {
        let guard = guard();
        let token = guard.ensure_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(guard.ensure_token(), token);
    }

    #[test]
    fn validates_only_its_own_token() {
        let guard = guard();
        let token = guard.ensure_token();
        assert!(guard.validate(&token));
        assert!(!guard.validate(&random_hex(TOKEN_BYTES)));
        assert!(!guard.validate(&"0".repeat(64)));
        assert!(!guard.validate(""));
    }

    #[test]
    fn header_requires_generation() {
        let guard = guard();
        assert_eq!(guard.header(), Err(CsrfError::Missing));
        assert!(!guard.validate(&"a".repeat(64)));
        let token = guard.ensure_token();
        assert_eq!(guard.header().unwrap(), (CSRF_HEADER, token));
    }

    #[test]
    fn clear_forgets_token() {
        let guard = guard();
        let first = guard.ensure_token();
        guard.clear();
        assert!(guard.token().is_none());
        assert!(!guard.validate(&first));
        assert_ne!(guard.ensure_token(), first);
    }
}
