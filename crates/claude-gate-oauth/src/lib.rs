//! OAuth-authenticated proxy for the Anthropic API.
//!
//! Lets ordinary API clients use Claude Pro/Max subscription credentials:
//! the proxy holds the OAuth token, refreshes it as needed and injects it
//! into every forwarded request.
//!
//! # Components
//!
//! - [`oauth`]: PKCE flow, challenge generation, authorization URL, token exchange/refresh
//! - [`token_provider`]: Cached access tokens with single-flight refresh
//! - [`transform`]: System prompt injection, model aliases, outbound headers
//! - [`openai`]: OpenAI chat-completions request/response conversion
//! - [`proxy`]: Axum-based localhost proxy server

pub mod error;
pub mod oauth;
pub mod openai;
pub mod proxy;
pub mod token_provider;
pub mod transform;

pub use error::{OAuthError, Result};
pub use oauth::{AuthorizationRequest, OAuthClient, OAuthConfig, PkceChallenge, split_code_state};
pub use openai::ChatStreamConverter;
pub use proxy::{ProxyConfig, ProxyError, ProxyServer};
pub use token_provider::{
    ANTHROPIC_PROVIDER, OAuthTokenProvider, SharedTokenProvider, TokenProvider,
};
pub use transform::{ANTHROPIC_API_URL, RequestTransformer, resolve_model_alias};
