use std::sync::{Mutex, PoisonError, RwLock};

use echo_core::EchoError;
use echo_platform::TokenStore;
use reqwest::{
    cookie::{CookieStore, Jar},
    header::HeaderValue,
};
use tracing::{debug, warn};
use url::Url;

use crate::session::map_secret_store_error;

/// Cookie jar whose contents outlive the process.
///
/// The backend keeps the refresh token in an HTTP-only cookie, so the jar has
/// to survive restarts for a persisted session to be refreshable. Every
/// `Set-Cookie` value is kept verbatim, one per cookie name, and replayed
/// against the backend origin on load.
#[derive(Debug)]
pub struct PersistentCookieJar {
    jar: RwLock<Jar>,
    raw: Mutex<Vec<String>>,
    origin: Url,
    store: Option<TokenStore>,
}

impl PersistentCookieJar {
    pub fn new(origin: Url, store: Option<TokenStore>) -> Self {
        Self {
            jar: RwLock::new(Jar::default()),
            raw: Mutex::new(Vec::new()),
            origin,
            store,
        }
    }

    /// Build a jar primed with the cookies persisted in `store`.
    pub fn load(origin: Url, store: Option<TokenStore>) -> Result<Self, EchoError> {
        let persisted = match &store {
            Some(store) => store
                .load_cookies()
                .map_err(|err| map_secret_store_error("load_cookies", err))?,
            None => Vec::new(),
        };

        let jar = Jar::default();
        for cookie in &persisted {
            jar.add_cookie_str(cookie, &origin);
        }
        debug!(count = persisted.len(), "restored persisted cookies");

        Ok(Self {
            jar: RwLock::new(jar),
            raw: Mutex::new(persisted),
            origin,
            store,
        })
    }

    /// Raw `Set-Cookie` values currently remembered.
    pub fn stored_cookies(&self) -> Vec<String> {
        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget every cookie, in memory and in the store.
    pub fn clear(&self) -> Result<(), EchoError> {
        *self.jar.write().unwrap_or_else(PoisonError::into_inner) = Jar::default();
        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        match &self.store {
            Some(store) => store
                .clear_cookies()
                .map_err(|err| map_secret_store_error("clear_cookies", err)),
            None => Ok(()),
        }
    }

    fn remember(&self, incoming: Vec<String>) {
        let snapshot = {
            let mut raw = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
            for cookie in incoming {
                let name = cookie_name(&cookie).to_owned();
                raw.retain(|existing| cookie_name(existing) != name);
                raw.push(cookie);
            }
            raw.clone()
        };

        if let Some(store) = &self.store
            && let Err(err) = store.save_cookies(&snapshot)
        {
            warn!(error = %err, "failed to persist cookies");
        }
    }
}

impl CookieStore for PersistentCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<HeaderValue> = cookie_headers.cloned().collect();
        if headers.is_empty() {
            return;
        }

        self.jar
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .set_cookies(&mut headers.iter(), url);

        let incoming = headers
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        debug!(count = incoming.len(), origin = %self.origin, "storing response cookies");
        self.remember(incoming);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cookies(url)
    }
}

fn cookie_name(raw: &str) -> &str {
    raw.split(';')
        .next()
        .and_then(|pair| pair.split('=').next())
        .map(str::trim)
        .unwrap_or_default()
}
