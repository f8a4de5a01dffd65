//! Auth command - authentication management.

use std::io::Write;

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use claude_gate_oauth::{ANTHROPIC_PROVIDER, OAuthClient, split_code_state};
use claude_gate_storage::{StorageBackend, TokenKind};

use super::Context;

/// Arguments for the auth command.
#[derive(Args, Debug)]
pub struct AuthArgs {
    #[command(subcommand)]
    pub command: AuthCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Authenticate with Claude Pro/Max via OAuth
    Login,

    /// Show authentication status
    Status,

    /// Remove the stored OAuth token
    Logout,
}

/// Run the auth command.
pub async fn run(args: AuthArgs, ctx: &Context) -> Result<()> {
    match args.command {
        AuthCommand::Login => cmd_login(ctx).await,
        AuthCommand::Status => cmd_status(ctx),
        AuthCommand::Logout => cmd_logout(ctx),
    }
}

async fn cmd_login(ctx: &Context) -> Result<()> {
    let storage = ctx.open_storage()?;
    if storage.is_read_only() {
        return Err(anyhow!(
            "{} is read-only; log in with Claude Code or choose another storage backend",
            storage.name()
        ));
    }

    if let Ok(Some(record)) = storage.get(ANTHROPIC_PROVIDER)
        && record.is_oauth()
        && !record.is_expired()
    {
        println!(
            "Already authenticated (expires in {})",
            record.expires_in_display()
        );
        println!("Run 'claude-gate auth logout' first to re-authenticate.");
        return Ok(());
    }

    let client = OAuthClient::new(ctx.config.to_oauth_config())?;
    let request = client.authorization_url();

    println!("Claude Pro/Max OAuth Authentication");
    println!("===================================");
    println!();
    println!("Open this URL in your browser:");
    println!();
    println!("  {}", request.url);
    println!();
    println!("After authenticating, copy the code#state value and paste it here:");
    println!();

    if open_url(&request.url).is_err() {
        println!("(Could not open browser automatically)");
        println!();
    }

    print!("code#state> ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim();

    if input.is_empty() {
        println!("No input provided, aborting.");
        return Ok(());
    }

    if let (_, Some(state)) = split_code_state(input)
        && state != request.verifier
    {
        return Err(anyhow!(
            "State mismatch. The code does not belong to this login attempt."
        ));
    }

    println!("Exchanging code for tokens...");
    let record = client
        .exchange_code(input, &request.verifier)
        .await
        .map_err(|e| anyhow!("Token exchange failed: {}", e))?;

    storage
        .set(ANTHROPIC_PROVIDER, &record)
        .map_err(|e| anyhow!("Failed to save tokens: {}", e))?;

    println!();
    println!("Authentication successful!");
    println!("Token expires in: {}", record.expires_in_display());
    println!("Stored in: {}", storage.name());

    Ok(())
}

fn cmd_status(ctx: &Context) -> Result<()> {
    let storage = ctx.open_storage()?;

    println!("Authentication Status");
    println!("---------------------");
    println!("Storage: {}", storage.name());

    match storage.get(ANTHROPIC_PROVIDER) {
        Ok(Some(record)) => match record.kind {
            TokenKind::OAuth => {
                println!("OAuth: authenticated");
                println!("  Expires: {}", record.expires_in_display());
            }
            TokenKind::ApiKey => {
                println!("API key stored (the proxy needs an OAuth token)");
            }
        },
        Ok(None) => {
            println!("OAuth: not authenticated");
            println!("  Run 'claude-gate auth login' to authenticate");
        }
        Err(e) => {
            println!("OAuth: error reading token: {}", e);
        }
    }

    Ok(())
}

fn cmd_logout(ctx: &Context) -> Result<()> {
    let storage = ctx.open_storage()?;

    match storage.get(ANTHROPIC_PROVIDER) {
        Ok(Some(_)) => {
            storage
                .remove(ANTHROPIC_PROVIDER)
                .map_err(|e| anyhow!("Failed to remove token: {}", e))?;
            println!("OAuth token removed from {}.", storage.name());
        }
        Ok(None) => println!("No OAuth token found."),
        Err(e) => return Err(anyhow!("Failed to read token: {}", e)),
    }

    Ok(())
}

/// Try to open a URL in the default browser.
fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).status()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).status()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .status()?;
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = url;
    }
    Ok(())
}
