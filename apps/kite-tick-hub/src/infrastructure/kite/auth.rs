//! Kite Ticker Authentication
//!
//! The ticker authenticates with query parameters on the WebSocket URL:
//!
//! ```text
//! wss://ws.kite.trade/?api_key=<api_key>&access_token=<access_token>
//! ```
//!
//! A bad or expired token is rejected during the HTTP upgrade with status
//! 401 or 403. There is no in-band authentication message.
//!
//! The hub never logs in or refreshes tokens itself; it asks a
//! [`CredentialProvider`] for the current credential on every connect.

use async_trait::async_trait;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::StatusCode;
use url::Url;

use crate::application::ports::{AccessCredential, CredentialError, CredentialProvider};

// =============================================================================
// Error Types
// =============================================================================

/// Authentication failures against the ticker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credential was available.
    #[error("no access credential: {0}")]
    NoCredential(#[from] CredentialError),

    /// The ticker rejected the credential during the handshake.
    #[error("ticker rejected credential (HTTP {0})")]
    Rejected(u16),
}

/// Whether a handshake error means the credential was rejected.
///
/// Returns the HTTP status for 401/403 responses and `None` for any other
/// failure.
#[must_use]
pub fn rejection_status(error: &tungstenite::Error) -> Option<u16> {
    match error {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            Some(response.status().as_u16())
        }
        _ => None,
    }
}

/// Build the ticker URL for `credential`.
///
/// A base URL without a path gets `/`, and both credential parts are
/// percent-encoded into the query.
///
/// # Errors
///
/// Returns an error if `base_url` is not an absolute URL.
pub fn ticker_url(
    base_url: &str,
    credential: &AccessCredential,
) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base_url)?;
    url.query_pairs_mut()
        .append_pair("api_key", credential.api_key())
        .append_pair("access_token", credential.access_token());
    Ok(url.into())
}

// =============================================================================
// Providers
// =============================================================================

/// Environment variable holding the Kite API key.
pub const API_KEY_ENV: &str = "KITE_API_KEY";
/// Environment variable holding the Kite access token.
pub const ACCESS_TOKEN_ENV: &str = "KITE_ACCESS_TOKEN";

/// Reads the credential from `KITE_API_KEY` and `KITE_ACCESS_TOKEN`.
///
/// Variables are read on every call, so a token rotated by an external
/// login flow is picked up on the next reconnect.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    /// Create the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn access_credential(&self) -> Result<AccessCredential, CredentialError> {
        let api_key =
            std::env::var(API_KEY_ENV).map_err(|_| CredentialError::Missing(API_KEY_ENV))?;
        let access_token = std::env::var(ACCESS_TOKEN_ENV)
            .map_err(|_| CredentialError::Missing(ACCESS_TOKEN_ENV))?;

        AccessCredential::new(api_key, access_token)
    }
}

/// Always returns the same credential.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: AccessCredential,
}

impl StaticCredentialProvider {
    /// Wrap a fixed credential.
    #[must_use]
    pub const fn new(credential: AccessCredential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn access_credential(&self) -> Result<AccessCredential, CredentialError> {
        Ok(self.credential.clone())
    }
}
