//! Read-only adapter over the credentials Claude Code keeps in the OS keyring.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::backend::{MetricsRecorder, StorageBackend, StorageMetrics};
use crate::error::{Result, StorageError, classify};
use crate::record::TokenRecord;
use crate::secret_store::{OsSecretStore, SecretStore};

/// The only provider Claude Code credentials can serve.
pub const CLAUDE_CODE_PROVIDER: &str = "anthropic";

/// Keyring services Claude Code has been seen to store credentials under,
/// probed in order.
pub const CANDIDATE_SERVICES: &[&str] = &[
    "Claude Code-credentials",
    "claude.ai",
    "Claude Code",
    "com.anthropic.claude",
    "com.anthropic.claude-code",
];

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: Option<ClaudeAiOauth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeAiOauth {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    /// Milliseconds since the epoch.
    #[serde(default)]
    expires_at: i64,
}

/// One place a Claude Code credential may live.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    pub store: Arc<dyn SecretStore>,
    pub account: String,
}

/// Read-only storage serving Claude Code's OAuth credentials as provider
/// `anthropic`.
#[derive(Debug)]
pub struct ClaudeCodeStorage {
    sources: Vec<CredentialSource>,
    metrics: MetricsRecorder,
}

impl ClaudeCodeStorage {
    /// Probe the OS keyring for the current user under every candidate service.
    pub fn open() -> Self {
        let account = current_user();
        let sources = CANDIDATE_SERVICES
            .iter()
            .map(|service| CredentialSource {
                store: Arc::new(OsSecretStore::new(*service)) as Arc<dyn SecretStore>,
                account: account.clone(),
            })
            .collect();
        Self::with_sources(sources)
    }

    pub fn with_sources(sources: Vec<CredentialSource>) -> Self {
        Self {
            sources,
            metrics: MetricsRecorder::default(),
        }
    }

    fn read(&self) -> Result<Option<TokenRecord>> {
        let mut last_error = None;
        let mut failures = 0;

        for source in &self.sources {
            let raw = match source.store.get(&source.account) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    debug!(store = %source.store.name(), error = %e, "Claude Code credential probe failed");
                    failures += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            if let Some(record) = parse_credentials(&raw) {
                debug!(store = %source.store.name(), "Found Claude Code credentials");
                return Ok(Some(record));
            }
        }

        match last_error {
            Some(err) if failures == self.sources.len() => Err(classify("get", &err.0)),
            _ => Ok(None),
        }
    }
}

/// Parse Claude Code's credential JSON. Items without both tokens are skipped.
fn parse_credentials(raw: &[u8]) -> Option<TokenRecord> {
    let credentials: Credentials = serde_json::from_slice(raw).ok()?;
    let oauth = credentials.claude_ai_oauth?;
    if oauth.access_token.is_empty() || oauth.refresh_token.is_empty() {
        return None;
    }
    Some(TokenRecord::oauth(
        oauth.access_token,
        oauth.refresh_token,
        oauth.expires_at / 1000,
    ))
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

fn read_only(operation: &str) -> StorageError {
    StorageError::ReadOnly(format!(
        "{} is not supported on Claude Code credentials",
        operation
    ))
}

impl StorageBackend for ClaudeCodeStorage {
    fn get(&self, provider: &str) -> Result<Option<TokenRecord>> {
        self.metrics.track("get", || {
            if provider != CLAUDE_CODE_PROVIDER {
                return Ok(None);
            }
            self.read()
        })
    }

    fn set(&self, _provider: &str, _record: &TokenRecord) -> Result<()> {
        self.metrics.track("set", || Err(read_only("set")))
    }

    fn remove(&self, _provider: &str) -> Result<()> {
        self.metrics.track("remove", || Err(read_only("remove")))
    }

    fn list(&self) -> Result<Vec<String>> {
        self.metrics.track("list", || {
            Ok(match self.read()? {
                Some(_) => vec![CLAUDE_CODE_PROVIDER.to_string()],
                None => Vec::new(),
            })
        })
    }

    fn is_available(&self) -> bool {
        matches!(self.read(), Ok(Some(_)))
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        "claude-code".to_string()
    }

    fn metrics(&self) -> StorageMetrics {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Storage;
    use crate::error::StorageErrorKind;
    use crate::file::FileStorage;
    use crate::secret_store::MemorySecretStore;

    const CREDENTIALS: &str = r#"{
        "claudeAiOauth": {
            "accessToken": "sk-ant-oat01-access",
            "refreshToken": "sk-ant-ort01-refresh",
            "expiresAt": 1735689600123,
            "scopes": ["user:inference"],
            "subscriptionType": "max"
        }
    }"#;

    fn source(store: &Arc<MemorySecretStore>) -> CredentialSource {
        CredentialSource {
            store: store.clone(),
            account: "me".to_string(),
        }
    }

    #[test]
    fn test_maps_credentials_to_record() {
        let store = Arc::new(MemorySecretStore::new());
        store.insert_raw("me", CREDENTIALS);
        let storage = ClaudeCodeStorage::with_sources(vec![source(&store)]);

        let record = storage.get("anthropic").unwrap().unwrap();
        assert_eq!(record.access_token, "sk-ant-oat01-access");
        assert_eq!(record.refresh_token, "sk-ant-ort01-refresh");
        assert_eq!(record.expires_at, 1_735_689_600);
        assert!(record.is_oauth());

        assert_eq!(storage.list().unwrap(), vec!["anthropic"]);
        assert!(storage.is_available());
    }

    #[test]
    fn test_other_providers_are_absent() {
        let store = Arc::new(MemorySecretStore::new());
        store.insert_raw("me", CREDENTIALS);
        let storage = ClaudeCodeStorage::with_sources(vec![source(&store)]);
        assert_eq!(storage.get("openai").unwrap(), None);
    }

    #[test]
    fn test_probes_candidates_in_order() {
        let empty = Arc::new(MemorySecretStore::new());
        let junk = Arc::new(MemorySecretStore::new());
        junk.insert_raw("me", r#"{"claudeAiOauth":{"accessToken":"","refreshToken":"r"}}"#);
        let real = Arc::new(MemorySecretStore::new());
        real.insert_raw("me", CREDENTIALS);

        let storage = ClaudeCodeStorage::with_sources(vec![
            source(&empty),
            source(&junk),
            source(&real),
        ]);
        let record = storage.get("anthropic").unwrap().unwrap();
        assert_eq!(record.access_token, "sk-ant-oat01-access");
    }

    #[test]
    fn test_writes_are_read_only() {
        let storage = ClaudeCodeStorage::with_sources(Vec::new());
        let err = storage
            .set("anthropic", &TokenRecord::api_key("k"))
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::ReadOnly);
        assert_eq!(
            storage.remove("anthropic").unwrap_err().kind(),
            StorageErrorKind::ReadOnly
        );
        assert!(storage.is_read_only());
        assert!(!Storage::from(FileStorage::new("/tmp/unused.json")).is_read_only());
    }

    #[test]
    fn test_missing_credentials_are_not_an_error() {
        let storage = ClaudeCodeStorage::with_sources(vec![source(&Arc::new(
            MemorySecretStore::new(),
        ))]);
        assert_eq!(storage.get("anthropic").unwrap(), None);
        assert!(storage.list().unwrap().is_empty());
        assert!(!storage.is_available());
    }

    #[test]
    fn test_all_sources_failing_is_classified() {
        let locked = Arc::new(MemorySecretStore::new());
        locked.fail_all("keychain is locked");
        let storage = ClaudeCodeStorage::with_sources(vec![source(&locked)]);
        assert_eq!(
            storage.get("anthropic").unwrap_err().kind(),
            StorageErrorKind::Locked
        );
    }
}
