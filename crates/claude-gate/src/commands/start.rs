//! Start command - run the proxy server.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use claude_gate_oauth::{
    ANTHROPIC_PROVIDER, OAuthClient, OAuthTokenProvider, ProxyServer,
};
use claude_gate_storage::StorageBackend;

use super::Context;

/// Arguments for the start command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Address to bind to (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let storage = ctx
        .storage_factory()
        .create_with_migration()
        .context("Failed to prepare token storage")?;
    let storage = Arc::new(storage);

    match storage.get(ANTHROPIC_PROVIDER) {
        Ok(Some(record)) if record.is_oauth() => {
            tracing::info!(expires = %record.expires_in_display(), "OAuth token found");
        }
        Ok(_) => {
            tracing::warn!("No OAuth token stored; requests will fail until you run 'claude-gate auth login'");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not read stored token");
        }
    }

    let oauth = OAuthClient::new(config.to_oauth_config())?;
    let tokens = Arc::new(OAuthTokenProvider::new(oauth, storage.clone()));
    let proxy_config = config.to_proxy_config()?;
    let server = ProxyServer::new(proxy_config, tokens, storage.clone())?;

    let (addr, handle) = server
        .run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Failed to start proxy server")?;

    println!("Claude Gate listening on http://{}", addr);
    println!("  Storage:  {}", storage.name());
    println!("  Upstream: {}", config.upstream.base_url);
    println!();
    println!("  export ANTHROPIC_BASE_URL=http://{}", addr);
    println!("Press Ctrl-C to stop.");

    handle.await??;
    tracing::info!("Proxy server stopped");
    Ok(())
}
