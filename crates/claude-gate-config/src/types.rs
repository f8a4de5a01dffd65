//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [server]     # listen address, timeouts, limits
//! [upstream]   # Anthropic API base URL
//! [oauth]      # OAuth client registration overrides
//! [storage]    # token storage backend
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use claude_gate_oauth::{ANTHROPIC_API_URL, OAuthConfig, ProxyConfig};
use claude_gate_storage::{
    DEFAULT_SERVICE_NAME, KeyringConfig, StorageConfig, StorageKind, default_base_dir,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5789;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure. Every section and field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub oauth: OAuthSection,
    pub storage: StorageSection,
}

impl GateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Storage settings with `~` expanded and defaults filled in.
    pub fn to_storage_config(&self) -> StorageConfig {
        let storage = &self.storage;
        let base = default_base_dir();
        StorageConfig {
            kind: storage.kind,
            file_path: storage
                .file_path
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(|| base.join("auth.json")),
            backup_dir: storage
                .backup_dir
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(|| base.join("backups")),
            keyring: KeyringConfig {
                service_name: storage.service_name.clone(),
                trust_application: storage.keychain_trust_app,
                accessible_when_unlocked: storage.keychain_accessible_when_unlocked,
                synchronizable: storage.keychain_synchronizable,
            },
        }
    }

    /// OAuth endpoints: built-in registration with any configured overrides.
    pub fn to_oauth_config(&self) -> OAuthConfig {
        let mut config = OAuthConfig::anthropic_max();
        let section = &self.oauth;
        let overrides = [
            (&section.client_id, &mut config.client_id),
            (&section.authorize_url, &mut config.authorize_url),
            (&section.token_url, &mut config.token_url),
            (&section.redirect_uri, &mut config.redirect_uri),
            (&section.scope, &mut config.scope),
        ];
        for (value, target) in overrides {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        config
    }

    /// Proxy server settings. Fails if the listen address does not resolve.
    pub fn to_proxy_config(&self) -> Result<ProxyConfig> {
        let server = &self.server;
        Ok(ProxyConfig {
            bind_addr: server.bind_addr()?,
            upstream_url: self.upstream.base_url.clone(),
            request_timeout: Duration::from_secs(server.request_timeout_secs),
            shutdown_grace: Duration::from_secs(server.shutdown_grace_secs),
            max_request_size: server.max_request_size,
            enable_cors: server.enable_cors,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Upper bound for one proxied request, streams included.
    pub request_timeout_secs: u64,
    /// How long in-flight requests may run after shutdown is requested.
    pub shutdown_grace_secs: u64,
    /// Largest accepted request body in bytes.
    pub max_request_size: usize,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::invalid("server.host", format!("{}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| ConfigError::invalid("server.host", format!("{} did not resolve", self.host)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }
}

/// Optional overrides of the built-in OAuth client registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSection {
    pub client_id: Option<String>,
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
}

/// Token storage configuration.
///
/// The `keychain_*` flags only affect items written by the keyring backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub kind: StorageKind,
    /// Token file; defaults to `~/.claude-gate/auth.json`.
    pub file_path: Option<PathBuf>,
    pub service_name: String,
    /// Migration backups; defaults to `~/.claude-gate/backups`.
    pub backup_dir: Option<PathBuf>,
    pub keychain_trust_app: bool,
    pub keychain_accessible_when_unlocked: bool,
    pub keychain_synchronizable: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            kind: StorageKind::Auto,
            file_path: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            backup_dir: None,
            keychain_trust_app: true,
            keychain_accessible_when_unlocked: true,
            keychain_synchronizable: false,
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::new();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5789);
        assert_eq!(config.upstream.base_url, "https://api.anthropic.com");
        assert_eq!(config.storage.kind, StorageKind::Auto);

        let proxy = config.to_proxy_config().unwrap();
        assert_eq!(proxy.bind_addr, "127.0.0.1:5789".parse().unwrap());
        assert_eq!(proxy.request_timeout, Duration::from_secs(600));
        assert_eq!(proxy.max_request_size, 10 * 1024 * 1024);

        let storage = config.to_storage_config();
        assert!(storage.file_path.ends_with(".claude-gate/auth.json"));
        assert!(storage.backup_dir.ends_with(".claude-gate/backups"));
        assert_eq!(storage.keyring, KeyringConfig::default());
    }

    #[test]
    fn test_full_file() {
        let config = GateConfig::from_toml(
            r#"
[server]
host = "0.0.0.0"
port = 9000
request_timeout_secs = 120
enable_cors = false

[upstream]
base_url = "http://localhost:8080"

[oauth]
token_url = "http://localhost:8080/token"

[storage]
kind = "claude-code"
file_path = "/tmp/gate/auth.json"
service_name = "gate-test"
keychain_synchronizable = true
"#,
        )
        .unwrap();

        let proxy = config.to_proxy_config().unwrap();
        assert_eq!(proxy.bind_addr.port(), 9000);
        assert!(!proxy.enable_cors);
        assert_eq!(proxy.request_timeout, Duration::from_secs(120));
        assert_eq!(proxy.upstream_url, "http://localhost:8080");

        let oauth = config.to_oauth_config();
        assert_eq!(oauth.token_url, "http://localhost:8080/token");
        assert_eq!(oauth.client_id, OAuthConfig::anthropic_max().client_id);

        let storage = config.to_storage_config();
        assert_eq!(storage.kind, StorageKind::ClaudeCode);
        assert_eq!(storage.file_path, PathBuf::from("/tmp/gate/auth.json"));
        assert_eq!(storage.keyring.service_name, "gate-test");
        assert!(storage.keyring.synchronizable);
        assert!(storage.keyring.trust_application);
    }

    #[test]
    fn test_unknown_storage_kind_rejected() {
        let err = GateConfig::from_toml("[storage]\nkind = \"floppy\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/tokens/auth.json"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("tokens/auth.json"));
        }
        assert_eq!(
            expand_tilde(Path::new("/abs/auth.json")),
            PathBuf::from("/abs/auth.json")
        );
    }
}
