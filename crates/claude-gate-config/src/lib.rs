//! Configuration for the claude-gate proxy.
//!
//! TOML files are discovered and layered (user config dir, then a
//! project-local `claude-gate.toml`), then `CLAUDE_GATE_*` environment
//! variables override individual values. The result converts into the
//! storage, OAuth and proxy settings the other crates consume.

pub mod discovery;
pub mod env;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, config_dir, load_config, load_config_file,
    load_config_with_options, user_config_path,
};
pub use env::parse_duration_secs;
pub use error::{ConfigError, Result};
pub use types::*;
