//! Common test utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use reqwest::Client;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use claude_gate_oauth::{
    ANTHROPIC_PROVIDER, OAuthClient, OAuthConfig, OAuthTokenProvider, ProxyConfig, ProxyServer,
};
use claude_gate_storage::{FileStorage, StorageBackend, TokenRecord, now_secs};

/// Access token stored for every test gate.
pub const ACCESS_TOKEN: &str = "test-access";

/// A proxy running in the background against a test upstream.
pub struct TestGate {
    /// The proxy's address.
    pub addr: SocketAddr,
    /// HTTP client for talking to the proxy.
    pub client: Client,
    /// Backing storage, pre-seeded with a valid OAuth token.
    pub storage: Arc<FileStorage>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
    /// Temporary directory for the token file.
    pub temp_dir: TempDir,
}

impl TestGate {
    /// Start a proxy forwarding to `upstream_url`.
    pub async fn start(upstream_url: &str) -> Result<Self> {
        Self::start_with(upstream_url, |config| config).await
    }

    /// Start a proxy with settings adjusted by `configure`, e.g. a short
    /// shutdown grace.
    pub async fn start_with(
        upstream_url: &str,
        configure: impl FnOnce(ProxyConfig) -> ProxyConfig,
    ) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let storage = Arc::new(FileStorage::new(temp_dir.path().join("auth.json")));
        storage.set(
            ANTHROPIC_PROVIDER,
            &TokenRecord::oauth(ACCESS_TOKEN, "test-refresh", now_secs() + 3600),
        )?;

        let oauth = OAuthClient::new(OAuthConfig {
            token_url: format!("{}/v1/oauth/token", upstream_url),
            ..OAuthConfig::default()
        })?;
        let tokens = Arc::new(OAuthTokenProvider::new(oauth, storage.clone()));

        let config =
            configure(ProxyConfig::new("127.0.0.1:0".parse()?).with_upstream_url(upstream_url));
        let server = ProxyServer::new(config, tokens, storage.clone())?;

        let (tx, rx) = oneshot::channel::<()>();
        let (addr, handle) = server
            .run_with_shutdown(async {
                let _ = rx.await;
            })
            .await?;

        Ok(Self {
            addr,
            client: Client::new(),
            storage,
            shutdown: Some(tx),
            handle: Some(handle),
            temp_dir,
        })
    }

    /// Absolute URL for `path` on the proxy.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Signal shutdown and wait for the server task to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }
}

/// Serve `router` on an ephemeral port, returning its base URL.
pub async fn spawn_upstream(router: Router) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(format!("http://{}", addr))
}
