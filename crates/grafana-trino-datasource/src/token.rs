//! OAuth2 client credentials tokens and the cache that shares them.
//!
//! A [`TokenCache`] belongs to one datasource instance and is shared by every
//! request made through that instance. Readers of a fresh token never block;
//! a stale token is refreshed by exactly one caller while the others wait on
//! the refresh lock and then reuse its result.

use std::{fmt, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use chrono::prelude::*;
use grafana_plugin_sdk::backend::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::error::TokenError;

/// How long before its expiry a token stops being handed out.
///
/// This must be longer than any outbound request can take, so that a token
/// cannot expire while a request carrying it is in flight.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// Upper bound on `expires_in`, so that absurd values cannot overflow `Instant`.
const MAX_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A bearer token and the instant at which it expires.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    access_token: String,
    expires_at: Instant,
}

impl Token {
    /// Create a token expiring at `expires_at`.
    pub fn new(access_token: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// The opaque access token.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Whether the token can still be used for a request starting now.
    pub fn is_usable(&self) -> bool {
        self.is_usable_at(Instant::now())
    }

    /// Whether the token can still be used for a request starting at `now`.
    pub fn is_usable_at(&self, now: Instant) -> bool {
        !self.access_token.is_empty() && self.expires_at > now + EXPIRY_MARGIN
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can obtain a fresh [`Token`].
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a new token.
    async fn fetch_token(&self) -> Result<Token, TokenError>;
}

/// Caches a single token obtained from a [`TokenSource`].
pub struct TokenCache<S> {
    current: ArcSwapOption<Token>,
    refresh: Mutex<()>,
    source: S,
}

impl<S> fmt::Debug for TokenCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("current", &self.current.load_full())
            .finish_non_exhaustive()
    }
}

impl<S: TokenSource> TokenCache<S> {
    /// Create an empty cache.
    pub fn new(source: S) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            refresh: Mutex::new(()),
            source,
        }
    }

    /// Return a usable token, refreshing it first if needed.
    ///
    /// A failed refresh leaves the cached token as it was. Dropping the returned
    /// future mid-refresh releases the refresh lock without storing anything.
    pub async fn token(&self) -> Result<Arc<Token>, TokenError> {
        if let Some(token) = self.usable() {
            return Ok(token);
        }
        let _guard = self.refresh.lock().await;
        // Someone else may have refreshed while we waited for the lock.
        if let Some(token) = self.usable() {
            return Ok(token);
        }
        let token = Arc::new(self.source.fetch_token().await?);
        self.current.store(Some(Arc::clone(&token)));
        Ok(token)
    }

    /// The cached token, whether or not it is still usable.
    pub fn cached(&self) -> Option<Arc<Token>> {
        self.current.load_full()
    }

    fn usable(&self) -> Option<Arc<Token>> {
        self.current.load_full().filter(|token| token.is_usable())
    }
}

#[serde_as]
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    expires_in: u64,
}

/// Obtains tokens from an identity provider with the OAuth2 client credentials grant.
pub struct ClientCredentials {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Create a token source which sends its requests with `client`.
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn fetch_token(&self) -> Result<Token, TokenError> {
        debug!(token_url = %self.token_url, "Try retrieve token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(TokenError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let decoded: TokenResponse = serde_json::from_slice(&body)?;
        let lifetime = Duration::from_secs(decoded.expires_in).min(MAX_LIFETIME);
        if let Some(expires_at) = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
        {
            debug!(date = %expires_at.to_rfc2822(), "Token will expire at");
        }
        Ok(Token::new(decoded.access_token, Instant::now() + lifetime))
    }
}
