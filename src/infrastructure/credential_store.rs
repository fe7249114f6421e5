use crate::domain::models::OAuthToken;
use crate::infrastructure::error::EngineError;
use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_KEYRING_SERVICE: &str = "cadence.oauth.google";

/// Stores one OAuth credential per user account.
pub trait CredentialStore: Send + Sync {
    fn save_token(&self, owner_id: &str, token: &OAuthToken) -> Result<(), EngineError>;
    fn load_token(&self, owner_id: &str) -> Result<Option<OAuthToken>, EngineError>;
    /// Returns whether a credential existed.
    fn delete_token(&self, owner_id: &str) -> Result<bool, EngineError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, owner_id: &str) -> Result<keyring::Entry, EngineError> {
        keyring::Entry::new(&self.service_name, owner_id)
            .map_err(|error| EngineError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEYRING_SERVICE)
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save_token(&self, owner_id: &str, token: &OAuthToken) -> Result<(), EngineError> {
        let payload = serde_json::to_string(token)
            .map_err(|error| EngineError::Credential(error.to_string()))?;
        self.entry(owner_id)?
            .set_password(&payload)
            .map_err(|error| EngineError::Credential(error.to_string()))
    }

    fn load_token(&self, owner_id: &str) -> Result<Option<OAuthToken>, EngineError> {
        let payload = match self.entry(owner_id)?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(EngineError::Credential(error.to_string())),
        };

        let token = serde_json::from_str::<OAuthToken>(&payload)
            .map_err(|error| EngineError::Credential(error.to_string()))?;
        Ok(Some(token))
    }

    fn delete_token(&self, owner_id: &str) -> Result<bool, EngineError> {
        match self.entry(owner_id)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(error) => Err(EngineError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    tokens: Mutex<HashMap<String, OAuthToken>>,
}

impl InMemoryCredentialStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, OAuthToken>>, EngineError> {
        self.tokens
            .lock()
            .map_err(|error| EngineError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_token(&self, owner_id: &str, token: &OAuthToken) -> Result<(), EngineError> {
        self.lock()?.insert(owner_id.to_string(), token.clone());
        Ok(())
    }

    fn load_token(&self, owner_id: &str) -> Result<Option<OAuthToken>, EngineError> {
        Ok(self.lock()?.get(owner_id).cloned())
    }

    fn delete_token(&self, owner_id: &str) -> Result<bool, EngineError> {
        Ok(self.lock()?.remove(owner_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn token(access: &str) -> OAuthToken {
        OAuthToken {
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: DateTime::parse_from_rfc3339("2025-01-06T10:00:00Z")
                .expect("valid datetime")
                .with_timezone(&Utc),
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    #[test]
    fn in_memory_store_keeps_accounts_apart() {
        let store = InMemoryCredentialStore::default();
        store.save_token("user-1", &token("a")).expect("save");
        store.save_token("user-2", &token("b")).expect("save");

        assert_eq!(
            store.load_token("user-1").expect("load").map(|token| token.access_token),
            Some("a".to_string())
        );
        assert!(store.delete_token("user-1").expect("delete"));
        assert!(!store.delete_token("user-1").expect("delete again"));
        assert!(store.load_token("user-1").expect("load").is_none());
        assert!(store.load_token("user-2").expect("load").is_some());
    }
}
