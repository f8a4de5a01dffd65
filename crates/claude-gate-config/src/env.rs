//! `CLAUDE_GATE_*` environment overrides, applied after all config files.

use std::path::PathBuf;

use claude_gate_storage::StorageKind;

use crate::types::GateConfig;

pub const ENV_HOST: &str = "CLAUDE_GATE_HOST";
pub const ENV_PORT: &str = "CLAUDE_GATE_PORT";
pub const ENV_BASE_URL: &str = "CLAUDE_GATE_ANTHROPIC_BASE_URL";
pub const ENV_REQUEST_TIMEOUT: &str = "CLAUDE_GATE_REQUEST_TIMEOUT";
pub const ENV_MAX_REQUEST_SIZE: &str = "CLAUDE_GATE_MAX_REQUEST_SIZE";
pub const ENV_STORAGE_PATH: &str = "CLAUDE_GATE_AUTH_STORAGE_PATH";
pub const ENV_STORAGE_TYPE: &str = "CLAUDE_GATE_AUTH_STORAGE_TYPE";
pub const ENV_KEYRING_SERVICE: &str = "CLAUDE_GATE_KEYRING_SERVICE";

impl GateConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Empty values are ignored; values that
    /// do not parse are skipped and reported in the returned warnings.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(host) = get(ENV_HOST) {
            self.server.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warnings.push(invalid(ENV_PORT, &port)),
            }
        }
        if let Some(url) = get(ENV_BASE_URL) {
            self.upstream.base_url = url;
        }
        if let Some(timeout) = get(ENV_REQUEST_TIMEOUT) {
            match parse_duration_secs(&timeout) {
                Some(secs) => self.server.request_timeout_secs = secs,
                None => warnings.push(invalid(ENV_REQUEST_TIMEOUT, &timeout)),
            }
        }
        if let Some(size) = get(ENV_MAX_REQUEST_SIZE) {
            match size.trim().parse() {
                Ok(size) => self.server.max_request_size = size,
                Err(_) => warnings.push(invalid(ENV_MAX_REQUEST_SIZE, &size)),
            }
        }
        if let Some(path) = get(ENV_STORAGE_PATH) {
            self.storage.file_path = Some(PathBuf::from(path));
        }
        if let Some(kind) = get(ENV_STORAGE_TYPE) {
            match kind.parse::<StorageKind>() {
                Ok(kind) => self.storage.kind = kind,
                Err(e) => warnings.push(format!("Ignoring {}: {}", ENV_STORAGE_TYPE, e)),
            }
        }
        if let Some(service) = get(ENV_KEYRING_SERVICE) {
            self.storage.service_name = service;
        }

        warnings
    }
}

fn invalid(name: &str, value: &str) -> String {
    format!("Ignoring {}: '{}' is not a valid value", name, value)
}

/// Parse `600`, `600s`, `10m` or `1h` into seconds.
pub fn parse_duration_secs(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last()? {
        (i, 's') => (&value[..i], 1),
        (i, 'm') => (&value[..i], 60),
        (i, 'h') => (&value[..i], 3600),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}
