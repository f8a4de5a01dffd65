//! OAuth 2.0 PKCE flow for Claude Pro/Max subscription authentication.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use claude_gate_storage::{TokenRecord, now_secs};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OAuthError, Result};

/// Timeout for calls to the token endpoint.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth endpoints and client registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scope: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self::anthropic_max()
    }
}

impl OAuthConfig {
    /// OAuth config for Anthropic Pro/Max plans.
    pub fn anthropic_max() -> Self {
        Self {
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            authorize_url: "https://claude.ai/oauth/authorize".to_string(),
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_string(),
            scope: "org:create_api_key user:profile user:inference".to_string(),
        }
    }
}

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair from 32 random bytes.
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

        Self {
            verifier,
            challenge,
        }
    }
}

/// Build the authorization URL for the OAuth flow.
///
/// The verifier doubles as `state`; the authorization server echoes it back
/// as the `#state` suffix of the code, so no server-side session is needed.
pub fn build_authorization_url(config: &OAuthConfig, pkce: &PkceChallenge) -> String {
    let params = [
        ("code", "true"),
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("response_type", "code"),
        ("scope", config.scope.as_str()),
        ("code_challenge", pkce.challenge.as_str()),
        ("code_challenge_method", "S256"),
        ("state", pkce.verifier.as_str()),
    ];

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", config.authorize_url, query)
}

/// Split a pasted `code#state` into its parts. The state is optional.
pub fn split_code_state(input: &str) -> (&str, Option<&str>) {
    let trimmed = input.trim();
    match trimmed.split_once('#') {
        Some((code, state)) if !state.is_empty() => (code, Some(state)),
        Some((code, _)) => (code, None),
        None => (trimmed, None),
    }
}

/// An authorization URL and the verifier needed to redeem its code.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub verifier: String,
}

#[derive(Debug, Serialize)]
struct TokenExchangeRequest<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
    grant_type: &'static str,
    client_id: &'a str,
    redirect_uri: &'a str,
    code_verifier: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenRefreshRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: i64,
}

/// Client for the OAuth token endpoint. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OAuthError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Start an authorization: a fresh PKCE pair and the URL to visit.
    pub fn authorization_url(&self) -> AuthorizationRequest {
        let pkce = PkceChallenge::generate();
        AuthorizationRequest {
            url: build_authorization_url(&self.config, &pkce),
            verifier: pkce.verifier,
        }
    }

    /// Exchange an authorization code (optionally `code#state`) for tokens.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenRecord> {
        let (code, state) = split_code_state(code);
        if code.is_empty() {
            return Err(OAuthError::InvalidRequest(
                "Authorization code is empty".to_string(),
            ));
        }

        let body = TokenExchangeRequest {
            code,
            state,
            grant_type: "authorization_code",
            client_id: &self.config.client_id,
            redirect_uri: &self.config.redirect_uri,
            code_verifier: verifier,
        };
        self.token_request(&body, "Token exchange").await
    }

    /// Trade a refresh token for a new token pair.
    ///
    /// `expires_at` is derived from the response's `expires_in`. The
    /// returned refresh token may be empty if the server did not rotate it.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRecord> {
        let body = TokenRefreshRequest {
            grant_type: "refresh_token",
            client_id: &self.config.client_id,
            refresh_token,
        };
        self.token_request(&body, "Token refresh").await
    }

    async fn token_request(&self, body: &impl Serialize, what: &str) -> Result<TokenRecord> {
        let response = self
            .http
            .post(&self.config.token_url)
            .json(body)
            .send()
            .await
            .map_err(|e| OAuthError::Network(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OAuthError::Backend(format!(
                "{} failed ({}): {}",
                what, status, error_text
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::Backend(format!("Failed to parse token response: {}", e)))?;

        tracing::debug!(expires_in = tokens.expires_in, "{} succeeded", what);
        Ok(TokenRecord::oauth(
            tokens.access_token,
            tokens.refresh_token,
            now_secs() + tokens.expires_in,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OAuthClient {
        OAuthClient::new(OAuthConfig {
            token_url: format!("{}/v1/oauth/token", server.uri()),
            ..OAuthConfig::anthropic_max()
        })
        .unwrap()
    }

    #[test]
    fn test_pkce_generation() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.verifier.len(), 43);
        assert!(!pkce.verifier.contains('='));
        assert_ne!(pkce.verifier, pkce.challenge);

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
    }

    #[test]
    fn test_verifier_differs_per_call() {
        let client = OAuthClient::new(OAuthConfig::default()).unwrap();
        let a = client.authorization_url();
        let b = client.authorization_url();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.url, b.url);
    }

    #[test]
    fn test_authorization_url() {
        let client = OAuthClient::new(OAuthConfig::anthropic_max()).unwrap();
        let request = client.authorization_url();
        let url = &request.url;

        assert!(url.starts_with("https://claude.ai/oauth/authorize?"));
        assert!(url.contains("client_id=9d1c250a-e61b-44d9-88ed-5944d1962f5e"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", request.verifier)));
        assert!(url.contains("scope=org%3Acreate_api_key%20user%3Aprofile%20user%3Ainference"));
    }

    #[test]
    fn test_split_code_state() {
        assert_eq!(split_code_state("abc#xyz"), ("abc", Some("xyz")));
        assert_eq!(split_code_state("  abc#xyz \n"), ("abc", Some("xyz")));
        assert_eq!(split_code_state("abc"), ("abc", None));
        assert_eq!(split_code_state("abc#"), ("abc", None));
    }

    #[tokio::test]
    async fn test_exchange_code_splits_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_partial_json(serde_json::json!({
                "code": "the-code",
                "state": "the-state",
                "grant_type": "authorization_code",
                "code_verifier": "verifier"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let before = now_secs();
        let record = client_for(&server)
            .exchange_code("the-code#the-state", "verifier")
            .await
            .unwrap();

        assert_eq!(record.access_token, "access");
        assert_eq!(record.refresh_token, "refresh");
        assert!(record.expires_at >= before + 3600);
        assert!(record.expires_at <= now_secs() + 3600);
    }

    #[tokio::test]
    async fn test_exchange_surfaces_upstream_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_grant","error_description":"Code expired"}"#),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_code("code", "verifier")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, OAuthError::Backend(_)));
        assert!(message.contains("invalid_grant"));
        assert!(message.contains("Code expired"));
    }

    #[tokio::test]
    async fn test_refresh_derives_expiry_from_expires_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_partial_json(serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": "old-refresh"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 28800,
                "expires_at": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = client_for(&server).refresh_token("old-refresh").await.unwrap();
        assert_eq!(record.access_token, "new-access");
        assert!(record.refresh_token.is_empty());
        assert!(record.expires_at >= now_secs() + 28800 - 5);
    }

    #[test]
    fn test_oauth_config_default() {
        let config = OAuthConfig::default();
        assert_eq!(config.client_id, "9d1c250a-e61b-44d9-88ed-5944d1962f5e");
        assert!(config.authorize_url.contains("claude.ai"));
    }
}
