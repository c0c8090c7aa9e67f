use echo_core::{EchoError, EchoErrorCategory, Session};
use echo_platform::{SecretStoreError, TokenStore};
use tokio::sync::watch;

/// Sole writer of the process session.
///
/// Writes land in memory first and are then persisted, so readers never see a
/// token the store has not been asked to keep.
#[derive(Debug)]
pub struct SessionManager {
    tx: watch::Sender<Session>,
    store: Option<TokenStore>,
}

impl SessionManager {
    pub fn new(store: Option<TokenStore>) -> Self {
        let (tx, _) = watch::channel(Session::default());
        Self { tx, store }
    }

    pub fn reader(&self) -> SessionReader {
        SessionReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    /// Load the persisted session into memory.
    pub fn restore(&self) -> Result<Option<Session>, EchoError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let restored = store
            .load_session()
            .map_err(|err| map_secret_store_error("load_session", err))?;
        if let Some(session) = &restored {
            self.tx.send_replace(session.clone());
        }
        Ok(restored)
    }

    /// Install the session returned by login or signup.
    pub fn establish(
        &self,
        access_token: impl Into<String>,
        user_id: Option<String>,
    ) -> Result<(), EchoError> {
        let session = Session::new(access_token, user_id);
        self.tx.send_replace(session.clone());
        self.persist(&session)
    }

    /// Swap in a refreshed access token, keeping the known user.
    pub fn replace_access_token(&self, access_token: impl Into<String>) -> Result<(), EchoError> {
        let access_token = access_token.into();
        self.tx.send_modify(|session| {
            session.access_token = Some(access_token);
        });
        let session = self.snapshot();
        self.persist(&session)
    }

    pub fn clear(&self) -> Result<(), EchoError> {
        self.tx.send_if_modified(|session| {
            if *session == Session::default() {
                return false;
            }
            *session = Session::default();
            true
        });

        match &self.store {
            Some(store) => store
                .clear_session()
                .map_err(|err| map_secret_store_error("clear_session", err)),
            None => Ok(()),
        }
    }

    fn persist(&self, session: &Session) -> Result<(), EchoError> {
        match &self.store {
            Some(store) => store
                .save_session(session)
                .map_err(|err| map_secret_store_error("save_session", err)),
            None => Ok(()),
        }
    }
}

/// Read-only view of the session for components that only attach tokens.
#[derive(Debug, Clone)]
pub struct SessionReader {
    rx: watch::Receiver<Session>,
}

impl SessionReader {
    pub fn access_token(&self) -> Option<String> {
        self.rx.borrow().access_token.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.rx.borrow().user_id.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.rx.borrow().is_authenticated()
    }

    pub fn snapshot(&self) -> Session {
        self.rx.borrow().clone()
    }

    /// Wait for the next session write. `None` once the manager is gone.
    pub async fn changed(&mut self) -> Option<Session> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

pub(crate) fn map_secret_store_error(operation: &str, err: SecretStoreError) -> EchoError {
    match err {
        SecretStoreError::NotFound => EchoError::new(
            EchoErrorCategory::Storage,
            "secret_not_found",
            format!("secret missing during {operation}"),
        ),
        SecretStoreError::Unavailable(message) => EchoError::new(
            EchoErrorCategory::Storage,
            "secret_store_unavailable",
            format!("secret store unavailable during {operation}: {message}"),
        ),
        SecretStoreError::Backend(message) => EchoError::new(
            EchoErrorCategory::Storage,
            "secret_store_error",
            format!("secret store backend error during {operation}: {message}"),
        ),
        SecretStoreError::Corrupt(message) => EchoError::new(
            EchoErrorCategory::Serialization,
            "secret_store_corrupt",
            format!("stored secret is malformed during {operation}: {message}"),
        ),
    }
}
