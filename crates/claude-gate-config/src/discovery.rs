//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier, key by key):
//! 1. `<config dir>/config.toml` (`CLAUDE_GATE_CONFIG_DIR` or the platform config dir)
//! 2. `./claude-gate.toml` (project-local)
//! 3. `CLAUDE_GATE_*` environment variables
//! 4. CLI arguments (handled externally)

use std::path::{Path, PathBuf};

use crate::{ConfigError, GateConfig, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "claude-gate.toml";

/// Default config filename within the config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for platform directory resolution.
const APP_NAME: &str = "claude-gate";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "CLAUDE_GATE_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: GateConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Problems that did not stop loading (bad files, bad env values).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `CLAUDE_GATE_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut merged = toml::Table::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_config_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_config_path {
        sources.push(load_layer(&mut merged, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut merged, &project_path, &mut warnings));

    let mut config = GateConfig::deserialize_table(merged)?;
    warnings.extend(config.apply_env());

    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery, no environment).
pub fn load_config_file(path: &Path) -> Result<GateConfig> {
    GateConfig::from_toml(&read_file(path)?)
}

/// Path of the user config file, if a config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The claude-gate config directory.
///
/// Checks `CLAUDE_GATE_CONFIG_DIR` first, then falls back to the platform
/// default (`~/.config/claude-gate` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Try to load a config file and merge it into the accumulated table.
fn load_layer(merged: &mut toml::Table, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    let mut source = ConfigSource {
        path: path.to_path_buf(),
        loaded: false,
    };
    if !path.is_file() {
        return source;
    }

    let layer = read_file(path).and_then(|contents| {
        let table: toml::Table = toml::from_str(&contents)?;
        // Validate the layer on its own so errors name the right file.
        GateConfig::deserialize_table(table.clone())?;
        Ok(table)
    });

    match layer {
        Ok(table) => {
            merge_tables(merged, table);
            source.loaded = true;
            tracing::debug!(path = %path.display(), "Loaded config layer");
        }
        Err(e) => warnings.push(format!("Failed to load {}: {}", path.display(), e)),
    }
    source
}

/// Merge `layer` into `base`; nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

impl GateConfig {
    fn deserialize_table(table: toml::Table) -> Result<Self> {
        Ok(toml::Value::Table(table).try_into()?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
