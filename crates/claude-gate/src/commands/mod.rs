//! CLI command handlers.

pub mod auth;
pub mod start;
pub mod storage;

use anyhow::{Context as _, Result};
use claude_gate_config::GateConfig;
use claude_gate_storage::{Storage, StorageFactory};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Fully resolved configuration (files + environment).
    pub config: GateConfig,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    pub fn storage_factory(&self) -> StorageFactory {
        StorageFactory::new(self.config.to_storage_config())
    }

    /// Open the configured token storage without migrating.
    pub fn open_storage(&self) -> Result<Storage> {
        self.storage_factory()
            .create()
            .context("Failed to open token storage")
    }
}
