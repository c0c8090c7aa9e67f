//! Secret storage for the Echo session and refresh cookies.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use echo_core::Session;
use thiserror::Error;

/// Default keyring service name.
pub const DEFAULT_SERVICE: &str = "app.echo.client";

const SESSION_ACCOUNT: &str = "session";
const COOKIES_ACCOUNT: &str = "cookies";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store backend failure: {0}")]
    Backend(String),
    #[error("stored secret is malformed: {0}")]
    Corrupt(String),
}

pub trait SecretStore: Send + Sync {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError>;

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError>;

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

type SecretKey = (String, String);

fn secret_key(service: &str, account: &str) -> SecretKey {
    (service.to_owned(), account.to_owned())
}

/// Process-local store for tests and for running without a keyring.
#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    data: Arc<RwLock<HashMap<SecretKey, String>>>,
}

impl InMemorySecretStore {
    pub fn len(&self) -> usize {
        self.data.read().map_or(0, |data| data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for InMemorySecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        self.data
            .write()
            .map_err(|_| poisoned())?
            .insert(secret_key(service, account), secret.to_owned());
        Ok(())
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        self.data
            .read()
            .map_err(|_| poisoned())?
            .get(&secret_key(service, account))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.data
            .write()
            .map_err(|_| poisoned())?
            .remove(&secret_key(service, account))
            .map(|_| ())
            .ok_or(SecretStoreError::NotFound)
    }
}

fn poisoned() -> SecretStoreError {
    SecretStoreError::Backend("in-memory secret store lock poisoned".to_owned())
}

/// OS credential store; secrets are encrypted at rest by the platform.
#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringSecretStore;

#[cfg(feature = "os-keyring")]
impl SecretStore for OsKeyringSecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        entry
            .set_password(secret)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        entry.get_password().map_err(|err| match err {
            keyring::Error::NoEntry => SecretStoreError::NotFound,
            keyring::Error::NoStorageAccess(inner) => {
                SecretStoreError::Unavailable(inner.to_string())
            }
            other => SecretStoreError::Backend(other.to_string()),
        })
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        entry.delete_credential().map_err(|err| match err {
            keyring::Error::NoEntry => SecretStoreError::NotFound,
            other => SecretStoreError::Backend(other.to_string()),
        })
    }
}

/// Persists the session and the refresh cookies under one service name.
///
/// Missing entries load as `None`, and deleting a missing entry succeeds.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<dyn SecretStore>,
    service: String,
}

impl TokenStore {
    pub fn new(inner: Arc<dyn SecretStore>, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn load_session(&self) -> Result<Option<Session>, SecretStoreError> {
        let Some(raw) = self.get_optional(SESSION_ACCOUNT)? else {
            return Ok(None);
        };
        serde_json::from_str::<Session>(&raw)
            .map(Some)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))
    }

    pub fn save_session(&self, session: &Session) -> Result<(), SecretStoreError> {
        let encoded = serde_json::to_string(session)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))?;
        self.inner
            .set_secret(&self.service, SESSION_ACCOUNT, &encoded)
    }

    pub fn clear_session(&self) -> Result<(), SecretStoreError> {
        self.delete_optional(SESSION_ACCOUNT)
    }

    /// Raw `Set-Cookie` values remembered for the backend origin.
    pub fn load_cookies(&self) -> Result<Vec<String>, SecretStoreError> {
        let Some(raw) = self.get_optional(COOKIES_ACCOUNT)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str::<Vec<String>>(&raw)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))
    }

    pub fn save_cookies(&self, cookies: &[String]) -> Result<(), SecretStoreError> {
        if cookies.is_empty() {
            return self.clear_cookies();
        }
        let encoded = serde_json::to_string(cookies)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))?;
        self.inner
            .set_secret(&self.service, COOKIES_ACCOUNT, &encoded)
    }

    pub fn clear_cookies(&self) -> Result<(), SecretStoreError> {
        self.delete_optional(COOKIES_ACCOUNT)
    }

    fn get_optional(&self, account: &str) -> Result<Option<String>, SecretStoreError> {
        match self.inner.get_secret(&self.service, account) {
            Ok(raw) => Ok(Some(raw)),
            Err(SecretStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn delete_optional(&self, account: &str) -> Result<(), SecretStoreError> {
        match self.inner.delete_secret(&self.service, account) {
            Ok(()) | Err(SecretStoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
