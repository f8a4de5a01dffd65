//! Storage command - inspect and migrate token storage.

use anyhow::{Context as _, Result, anyhow};
use clap::{Args, Subcommand};
use claude_gate_storage::{
    MigrationReport, Storage, StorageBackend, StorageFactory, StorageKind, StorageMigrator,
};

use super::Context;

/// Arguments for the storage command.
#[derive(Args, Debug)]
pub struct StorageArgs {
    #[command(subcommand)]
    pub command: StorageCommand,
}

/// Source and destination backends for migration commands.
#[derive(Args, Debug, Clone)]
pub struct MigrationTargets {
    /// Backend to copy from
    #[arg(long, default_value = "file")]
    pub from: StorageKind,

    /// Backend to copy to
    #[arg(long, default_value = "keyring")]
    pub to: StorageKind,
}

#[derive(Subcommand, Debug)]
pub enum StorageCommand {
    /// Show the active backend, stored providers and metrics
    Status,

    /// Copy tokens from one backend to another
    Migrate {
        #[command(flatten)]
        targets: MigrationTargets,

        /// Only migrate this provider
        #[arg(long)]
        provider: Option<String>,

        /// Skip the pre-migration backup of a file source
        #[arg(long)]
        no_backup: bool,
    },

    /// Check that every source token exists unchanged in the destination
    Verify {
        #[command(flatten)]
        targets: MigrationTargets,
    },

    /// Copy tokens back from the destination to the source
    Rollback {
        #[command(flatten)]
        targets: MigrationTargets,
    },
}

/// Run the storage command.
pub async fn run(args: StorageArgs, ctx: &Context) -> Result<()> {
    match args.command {
        StorageCommand::Status => cmd_status(ctx),
        StorageCommand::Migrate {
            targets,
            provider,
            no_backup,
        } => cmd_migrate(ctx, &targets, provider.as_deref(), no_backup),
        StorageCommand::Verify { targets } => cmd_verify(ctx, &targets),
        StorageCommand::Rollback { targets } => cmd_rollback(ctx, &targets),
    }
}

fn open_kind(ctx: &Context, kind: StorageKind) -> Result<Storage> {
    if kind == StorageKind::Auto {
        return Err(anyhow!(
            "'auto' is not a concrete backend; choose keyring, file or claude-code"
        ));
    }
    let mut config = ctx.config.to_storage_config();
    config.kind = kind;
    StorageFactory::new(config)
        .create()
        .with_context(|| format!("Failed to open {} storage", kind))
}

fn open_pair(ctx: &Context, targets: &MigrationTargets) -> Result<(Storage, Storage)> {
    if targets.from == targets.to {
        return Err(anyhow!("Source and destination are both {}", targets.from));
    }
    let source = open_kind(ctx, targets.from)?;
    let destination = open_kind(ctx, targets.to)?;
    if destination.is_read_only() {
        return Err(anyhow!("{} is read-only", destination.name()));
    }
    Ok((source, destination))
}

fn cmd_status(ctx: &Context) -> Result<()> {
    let storage = ctx.open_storage()?;
    let config = ctx.config.to_storage_config();

    println!("Token Storage");
    println!("-------------");
    println!("Configured: {}", config.kind);
    println!("Backend:    {}", storage.name());
    println!("Available:  {}", storage.is_available());
    if storage.requires_unlock() {
        println!("Requires unlock: yes");
    }
    if storage.is_read_only() {
        println!("Read-only:  yes");
    }

    match storage.list() {
        Ok(providers) if providers.is_empty() => println!("Providers:  (none)"),
        Ok(providers) => {
            println!("Providers:");
            for provider in providers {
                let expiry = storage
                    .get(&provider)
                    .ok()
                    .flatten()
                    .map(|record| record.expires_in_display())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("  {} (expires: {})", provider, expiry);
            }
        }
        Err(e) => println!("Providers:  error: {}", e),
    }

    if let Some(file) = storage.as_file() {
        let marker = file.migrated_path();
        if marker.exists() {
            println!("Migrated marker: {}", marker.display());
        }
    }

    let metrics = storage.metrics();
    if ctx.verbose && metrics.total_operations() > 0 {
        println!();
        println!("Metrics ({} operations, {} errors)", metrics.total_operations(), metrics.total_errors());
        for (op, count) in &metrics.operations {
            let errors = metrics.errors.get(op).copied().unwrap_or(0);
            let latency = metrics
                .latencies
                .get(op)
                .map(|d| format!("{:?}", d))
                .unwrap_or_default();
            println!("  {:<8} {:>5} ok  {:>3} err  last {}", op, count, errors, latency);
        }
        if let Some(error) = &metrics.last_error {
            println!("  Last error: {}", error);
        }
    }

    Ok(())
}

fn print_report(report: &MigrationReport) {
    println!("Migrated: {}", report.migrated);
    if report.skipped > 0 {
        println!("Skipped:  {}", report.skipped);
    }
    if let Some(backup) = &report.backup {
        println!("Backup:   {}", backup.display());
    }
}

fn cmd_migrate(
    ctx: &Context,
    targets: &MigrationTargets,
    provider: Option<&str>,
    no_backup: bool,
) -> Result<()> {
    let (source, destination) = open_pair(ctx, targets)?;
    let backup_dir = ctx.config.to_storage_config().backup_dir;
    let migrator = StorageMigrator::new(&source, &destination).with_backup_dir(backup_dir);
    let migrator = if no_backup {
        migrator.without_backup()
    } else {
        migrator
    };

    println!("Migrating {} -> {}", source.name(), destination.name());
    match provider {
        Some(provider) => {
            migrator.migrate_provider(provider)?;
            println!("Migrated: {}", provider);
        }
        None => print_report(&migrator.migrate()?),
    }
    Ok(())
}

fn cmd_verify(ctx: &Context, targets: &MigrationTargets) -> Result<()> {
    let (source, destination) = open_pair(ctx, targets)?;
    StorageMigrator::new(&source, &destination).verify_migration()?;
    println!(
        "All tokens in {} match {}.",
        source.name(),
        destination.name()
    );
    Ok(())
}

fn cmd_rollback(ctx: &Context, targets: &MigrationTargets) -> Result<()> {
    let (source, destination) = open_pair(ctx, targets)?;
    if source.is_read_only() {
        return Err(anyhow!("{} is read-only", source.name()));
    }
    println!("Rolling back {} -> {}", destination.name(), source.name());
    print_report(&StorageMigrator::new(&source, &destination).rollback()?);
    Ok(())
}
