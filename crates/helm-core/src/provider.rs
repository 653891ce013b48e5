use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::LlmContext;
use crate::errors::ProviderError;
use crate::stream::StreamEvent;

/// Lazy, finite, non-restartable sequence of canonical events.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// One backend behind the canonical event model.
///
/// `stream` opens exactly one outbound request and yields events until a
/// terminal `Done` or `Error`. A returned `Err` means the request could not
/// be opened at all; once a stream is returned, all failures are reported
/// in-band as `Error` events.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Model identifier sent on the wire.
    fn model(&self) -> &str;

    /// Context window size for this model, in tokens.
    fn context_window(&self) -> u64;

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, ProviderError>;
}

/// Per-request knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub thinking: ThinkingConfig,
    /// Cancelling this token closes the in-flight connection.
    #[serde(skip, default = "CancellationToken::new")]
    pub cancel: CancellationToken,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            stop_sequences: Vec::new(),
            thinking: ThinkingConfig::Disabled,
            cancel: CancellationToken::new(),
        }
    }
}

/// Extended-reasoning budget for providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThinkingConfig {
    #[default]
    Disabled,
    Adaptive,
    Budget {
        tokens: u32,
    },
}

/// Resolves credentials per provider. Storage and refresh mechanics live
/// outside this crate.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, provider_name: &str) -> Option<SecretString>;
}

/// Resolver backed by a static map; enough for CLI and test use.
pub struct StaticCredentials {
    entries: Vec<(String, SecretString)>,
}

impl StaticCredentials {
    pub fn new(entries: Vec<(String, SecretString)>) -> Self {
        Self { entries }
    }

    pub fn single(provider_name: impl Into<String>, key: SecretString) -> Self {
        Self {
            entries: vec![(provider_name.into(), key)],
        }
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, provider_name: &str) -> Option<SecretString> {
        self.entries
            .iter()
            .find(|(name, _)| name == provider_name)
            .map(|(_, key)| key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_lookup() {
        let resolver =
            StaticCredentials::single("anthropic", SecretString::from("sk-test".to_string()));
        assert!(resolver.resolve("anthropic").is_some());
        assert!(resolver.resolve("openai").is_none());
    }

    #[test]
    fn stream_options_default_has_live_token() {
        let opts = StreamOptions::default();
        assert!(!opts.cancel.is_cancelled());
        assert_eq!(opts.thinking, ThinkingConfig::Disabled);
    }
}
