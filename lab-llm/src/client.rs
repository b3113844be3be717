use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, StreamChunk};
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;

/// A concrete chat-completion vendor. Constructed by the resolver in the
/// `llmlab` binary; downstream code matches on this exhaustively instead of
/// comparing provider name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat client scoped to one provider/model/credential triple.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    options: ChatOptions,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(provider = %provider, model = %model))]
    pub fn new(provider: Provider, api_key: &str, model: &str, options: ChatOptions) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            options,
            base_url: None,
            client,
        }
    }

    /// Point the client at an alternate endpoint root, e.g. a local proxy or
    /// a test server. The per-provider path is appended to this root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    /// Single blocking chat call. Returns the full assistant message.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        self.check_messages(messages)?;
        match self.provider {
            Provider::OpenAI => self.openai().chat(messages).await,
            Provider::Anthropic => self.anthropic().chat(messages).await,
        }
    }

    /// Streaming chat call. The returned sequence is finite, terminated by
    /// `StreamChunk::Done`, and not restartable; abandoning it is just
    /// dropping the stream.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        self.check_messages(messages)?;
        match self.provider {
            Provider::OpenAI => self.openai().chat_stream(messages).await,
            Provider::Anthropic => self.anthropic().chat_stream(messages).await,
        }
    }

    fn check_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("no messages to send".to_string()));
        }
        Ok(())
    }

    fn openai(&self) -> OpenAiClient {
        OpenAiClient::new(
            self.client.clone(),
            &self.api_key,
            &self.model,
            self.options,
            self.base_url.as_deref(),
        )
    }

    fn anthropic(&self) -> AnthropicClient {
        AnthropicClient::new(
            self.client.clone(),
            &self.api_key,
            &self.model,
            self.options,
            self.base_url.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_as_str() {
        assert_eq!(Provider::OpenAI.as_str(), "openai");
        assert_eq!(Provider::Anthropic.as_str(), "anthropic");
        assert_eq!(Provider::OpenAI.to_string(), "openai");
    }

    #[test]
    fn client_records_model_and_options() {
        let options = ChatOptions::default().with_temperature(0.7).with_max_tokens(128);
        let client = LlmClient::new(Provider::Anthropic, "key", "claude-3-sonnet-20240229", options);
        assert_eq!(client.provider(), Provider::Anthropic);
        assert_eq!(client.model(), "claude-3-sonnet-20240229");
        assert_eq!(client.options().temperature, Some(0.7));
        assert_eq!(client.options().max_tokens, Some(128));
        assert_eq!(client.options().top_p, None);
    }

    #[tokio::test]
    async fn empty_message_list_is_rejected_before_any_request() {
        let client = LlmClient::new(Provider::OpenAI, "key", "gpt-3.5-turbo", ChatOptions::default());
        let err = client.chat(&[]).await.expect_err("empty input must fail");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }
}
