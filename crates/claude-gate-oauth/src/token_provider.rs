//! Serving valid access tokens to concurrent proxy requests.
//!
//! [`OAuthTokenProvider`] keeps the current token in memory behind a single
//! read-write lock. The read path returns the cached token without touching
//! storage; the write path re-checks the cache after acquiring the lock so
//! that concurrent callers arriving with a stale token trigger exactly one
//! refresh between them.

use std::sync::Arc;

use async_trait::async_trait;
use claude_gate_storage::{SharedBackend, StorageBackend, TokenRecord};
use tokio::sync::RwLock;

use crate::error::{OAuthError, Result};
use crate::oauth::OAuthClient;

/// Provider key under which the Anthropic credential is stored.
pub const ANTHROPIC_PROVIDER: &str = "anthropic";

// ============================================================================
// TokenProvider Trait
// ============================================================================

/// Source of bearer tokens for upstream requests.
#[async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    /// Get a valid access token, refreshing if necessary.
    async fn get_access_token(&self) -> Result<String>;

    /// Drop any cached token so the next call reloads from storage.
    async fn clear_cache(&self);
}

/// Shared token provider type.
pub type SharedTokenProvider = Arc<dyn TokenProvider>;

// ============================================================================
// OAuthTokenProvider
// ============================================================================

/// Storage-backed token provider with at most one refresh in flight.
#[derive(Debug)]
pub struct OAuthTokenProvider {
    client: OAuthClient,
    storage: SharedBackend,
    provider: String,
    cached: RwLock<Option<TokenRecord>>,
}

impl OAuthTokenProvider {
    pub fn new(client: OAuthClient, storage: SharedBackend) -> Self {
        Self::for_provider(client, storage, ANTHROPIC_PROVIDER)
    }

    pub fn for_provider(
        client: OAuthClient,
        storage: SharedBackend,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            client,
            storage,
            provider: provider.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Read the stored record off the async worker threads.
    async fn load(&self) -> Result<Option<TokenRecord>> {
        let storage = self.storage.clone();
        let provider = self.provider.clone();
        run_blocking(move || storage.get(&provider)).await
    }

    /// Write `record` to storage, handing it back on success.
    async fn persist(&self, record: TokenRecord) -> Result<TokenRecord> {
        let storage = self.storage.clone();
        let provider = self.provider.clone();
        run_blocking(move || storage.set(&provider, &record).map(|()| record)).await
    }

    fn fresh(cached: &Option<TokenRecord>) -> Option<String> {
        cached
            .as_ref()
            .filter(|record| record.is_oauth() && !record.needs_refresh())
            .map(|record| record.access_token.clone())
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn get_access_token(&self) -> Result<String> {
        if let Some(token) = Self::fresh(&*self.cached.read().await) {
            return Ok(token);
        }

        let mut cache = self.cached.write().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = Self::fresh(&cache) {
            return Ok(token);
        }

        let record = match self.load().await? {
            Some(record) if record.is_oauth() => record,
            Some(_) => {
                return Err(OAuthError::AuthenticationRequired(format!(
                    "stored credential for {} is not an OAuth token; run `claude-gate auth login`",
                    self.provider
                )));
            }
            None => {
                return Err(OAuthError::AuthenticationRequired(format!(
                    "no OAuth token stored for {}; run `claude-gate auth login`",
                    self.provider
                )));
            }
        };

        if !record.needs_refresh() {
            let token = record.access_token.clone();
            *cache = Some(record);
            return Ok(token);
        }

        if record.refresh_token.is_empty() {
            return Err(OAuthError::AuthenticationRequired(format!(
                "OAuth token for {} expired and has no refresh token",
                self.provider
            )));
        }

        tracing::info!(provider = %self.provider, "Access token expiring, refreshing");
        let mut refreshed = self.client.refresh_token(&record.refresh_token).await?;
        if refreshed.refresh_token.is_empty() {
            refreshed.refresh_token = record.refresh_token;
        }

        // Read-only storage is owned by another tool; the rotated token lives
        // only in memory until that tool writes its own.
        let refreshed = if self.storage.is_read_only() {
            tracing::info!(
                provider = %self.provider,
                backend = %self.storage.name(),
                "Storage is read-only, keeping refreshed token in memory"
            );
            refreshed
        } else {
            self.persist(refreshed).await.inspect_err(|e| {
                tracing::error!(provider = %self.provider, error = %e, "Failed to save refreshed token");
            })?
        };
        let token = refreshed.access_token.clone();
        *cache = Some(refreshed);

        tracing::info!(provider = %self.provider, "Token refreshed successfully");
        Ok(token)
    }

    async fn clear_cache(&self) {
        *self.cached.write().await = None;
    }
}

/// Run a synchronous storage call on the blocking pool.
///
/// File and keychain backends may block on disk or on an OS prompt.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> claude_gate_storage::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OAuthError::Backend(format!("storage task failed: {}", e)))?
        .map_err(OAuthError::Storage)
}
