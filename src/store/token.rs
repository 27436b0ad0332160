//! Access token cache with transparent refresh on expiry

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::core::error::{Error, Result, TransportError};
use crate::store::Transport;
use crate::store::wire::TokenResponse;

/// Hands out a cached access token, fetching a new one when the store
/// rejects the current one
pub struct TokenProvider {
    transport: Arc<dyn Transport>,
    token_url: String,
    cached: Mutex<Option<String>>,
}

impl TokenProvider {
    pub fn new(transport: Arc<dyn Transport>, token_url: impl Into<String>) -> Self {
        Self {
            transport,
            token_url: token_url.into(),
            cached: Mutex::new(None),
        }
    }

    /// Current token, fetching one on first use
    pub async fn token(&self) -> Result<String> {
        let cached = self.cached.lock().ok().and_then(|guard| guard.clone());
        match cached {
            Some(token) => Ok(token),
            None => self.refresh().await,
        }
    }

    /// Fetch and cache a fresh token
    pub async fn refresh(&self) -> Result<String> {
        let json = self.transport.receive_json(&self.token_url).await?;
        let TokenResponse { token } = serde_json::from_value(json)?;
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(token.clone());
        }
        log::debug!("Refreshed data store token");
        Ok(token)
    }

    /// Run `request` with the current token; on 403 refresh the token and
    /// retry exactly once
    pub async fn do_with_token<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let token = self.token().await?;
        match request(token).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_auth_expired() => {
                log::info!("Token rejected, requesting a new one");
                let token = self.refresh().await?;
                match request(token).await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_auth_expired() => Err(Error::AuthTokenExpired),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
