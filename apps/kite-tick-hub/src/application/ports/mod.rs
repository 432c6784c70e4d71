//! Port Interfaces
//!
//! Contracts between the fan-out hub and the systems around it, following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedControl`: request or release instruments on the upstream feed
//! - `CredentialProvider`: fetch the access credential for the upstream feed
//!
//! ## Driver Ports (Inbound)
//!
//! - `TickSink`: accept decoded tick batches from the feed

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::streaming::{InstrumentToken, TickBatch};

// =============================================================================
// Feed Control
// =============================================================================

/// Upstream subscription control used by the broadcaster.
///
/// Implementations must not block: the broadcaster calls these while
/// holding its state lock. Calls made while the feed is down only update
/// the desired set.
#[cfg_attr(test, mockall::automock)]
pub trait FeedControl: Send + Sync {
    /// Add `tokens` to the set requested upstream.
    fn subscribe(&self, tokens: &[InstrumentToken]);

    /// Remove `tokens` from the set requested upstream.
    fn unsubscribe(&self, tokens: &[InstrumentToken]);
}

// =============================================================================
// Tick Sink
// =============================================================================

/// Destination of decoded tick batches.
///
/// Implemented by the fan-out broadcaster. `ingest` must not block on any
/// single client.
#[cfg_attr(test, mockall::automock)]
pub trait TickSink: Send + Sync {
    /// Cache and deliver one batch. Returns the number of messages queued.
    fn ingest(&self, batch: TickBatch) -> usize;
}

// =============================================================================
// Access Credential
// =============================================================================

/// API key and access token for the upstream ticker.
///
/// `Debug` redacts the access token for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential {
    api_key: String,
    access_token: String,
}

impl AccessCredential {
    /// Create a credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`] if either part is empty.
    pub fn new(
        api_key: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let api_key = api_key.into();
        let access_token = access_token.into();

        if api_key.trim().is_empty() {
            return Err(CredentialError::Missing("api_key"));
        }
        if access_token.trim().is_empty() {
            return Err(CredentialError::Missing("access_token"));
        }

        Ok(Self {
            api_key,
            access_token,
        })
    }

    /// API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCredential")
            .field("api_key", &self.api_key)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Errors fetching the access credential.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// No credential is configured.
    #[error("credential not configured: {0} is missing")]
    Missing(&'static str),

    /// The provider could not be reached.
    #[error("credential provider unavailable: {0}")]
    Unavailable(String),
}

/// Source of the upstream access credential.
///
/// Consulted on every connect attempt so a refreshed token is picked up
/// without restarting the connector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch the current credential.
    async fn access_credential(&self) -> Result<AccessCredential, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_rejects_empty_parts() {
        assert_eq!(
            AccessCredential::new("", "token"),
            Err(CredentialError::Missing("api_key"))
        );
        assert_eq!(
            AccessCredential::new("key", "  "),
            Err(CredentialError::Missing("access_token"))
        );
    }

    #[test]
    fn credential_debug_redacts_token() {
        let credential = AccessCredential::new("kite_key", "s3cret").unwrap();
        let debug = format!("{credential:?}");

        assert!(debug.contains("kite_key"));
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn mock_provider_returns_credential() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_access_credential()
            .times(1)
            .returning(|| AccessCredential::new("k", "t"));

        let credential = provider.access_credential().await.unwrap();
        assert_eq!(credential.api_key(), "k");
    }
}
