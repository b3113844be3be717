use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, Role, StreamChunk, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_MESSAGES_PATH: &str = "/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// The messages API requires max_tokens; used when the options leave it unset.
const DEFAULT_MAX_TOKENS: u32 = 2048;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    options: ChatOptions,
    url: String,
}

impl AnthropicClient {
    pub fn new(
        http: reqwest::Client,
        api_key: &str,
        model: &str,
        options: ChatOptions,
        base_url: Option<&str>,
    ) -> Self {
        let base = base_url.unwrap_or(ANTHROPIC_DEFAULT_BASE_URL).trim_end_matches('/');
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            options,
            url: format!("{base}{ANTHROPIC_MESSAGES_PATH}"),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        let req = AnthropicRequest::new(&self.model, messages, self.options, false);

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic chat status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = AnthropicRequest::new(&self.model, messages, self.options, true);

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "anthropic stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let state = Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
        };

        let stream =
            futures_util::stream::unfold((sse, state), |(mut sse, mut usage)| async move {
                loop {
                    let next = sse.as_mut().next().await?;
                    let (event_name, data) = match next {
                        Ok(v) => v,
                        Err(e) => return Some((Err(e), (sse, usage))),
                    };

                    match event_name.as_str() {
                        "message_start" => {
                            if let Ok(v) = serde_json::from_str::<AnthropicMessageStart>(&data) {
                                usage.prompt_tokens = v.message.usage.input_tokens as u32;
                                usage.completion_tokens = v.message.usage.output_tokens as u32;
                            }
                        }
                        "content_block_delta" => {
                            let v: AnthropicContentBlockDelta = match serde_json::from_str(&data) {
                                Ok(v) => v,
                                Err(e) => {
                                    return Some((
                                        Err(LlmError::StreamParse(format!(
                                            "anthropic delta json error={e} data={data}"
                                        ))),
                                        (sse, usage),
                                    ));
                                }
                            };
                            if v.delta.kind == "text_delta" {
                                let text = v.delta.text.unwrap_or_default();
                                if !text.is_empty() {
                                    return Some((
                                        Ok(StreamChunk::Delta { content: text }),
                                        (sse, usage),
                                    ));
                                }
                            }
                        }
                        "message_delta" => {
                            // message_delta usage usually carries output_tokens
                            // only; keep the input count from message_start.
                            if let Ok(v) = serde_json::from_str::<AnthropicMessageDelta>(&data) {
                                if let Some(u) = v.usage {
                                    if u.input_tokens > 0 {
                                        usage.prompt_tokens = u.input_tokens as u32;
                                    }
                                    usage.completion_tokens = u.output_tokens as u32;
                                }
                            }
                        }
                        "message_stop" => {
                            let done = usage.clone();
                            return Some((Ok(StreamChunk::Done { usage: done }), (sse, usage)));
                        }
                        _ => {}
                    }
                }
            });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], options: ChatOptions, stream: bool) -> Self {
        let mut system = String::new();
        let mut out_messages = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                }
                Role::User => out_messages.push(AnthropicMessage::text("user", &m.content)),
                Role::Assistant => {
                    out_messages.push(AnthropicMessage::text("assistant", &m.content))
                }
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: out_messages,
            temperature: options.temperature,
            top_p: options.top_p,
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

impl AnthropicMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: vec![AnthropicContentBlock::Text {
                text: content.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl From<AnthropicResponse> for ChatResponse {
    fn from(v: AnthropicResponse) -> Self {
        let mut content = String::new();
        for block in v.content {
            let AnthropicContentBlock::Text { text } = block;
            content.push_str(&text);
        }

        ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
            },
            usage: Usage {
                prompt_tokens: v.usage.input_tokens as u32,
                completion_tokens: v.usage.output_tokens as u32,
            },
            finish_reason: v.stop_reason,
        }
    }
}

type SseItem = (String, String);

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseItem>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + 2..].to_string();

                    let mut event = String::new();
                    let mut data_lines = Vec::new();

                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("event:") {
                            event = rest.trim_start().to_string();
                            continue;
                        }
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }

                    let data = data_lines.join("\n");
                    if event.is_empty() && data.is_empty() {
                        continue;
                    }
                    if event.is_empty() {
                        event = "message".to_string();
                    }
                    return Some((Ok((event, data)), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)))
                    }
                    None => return None,
                }
            }
        },
    )
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    message: AnthropicMessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStartMessage {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockDelta {
    delta: AnthropicDelta,
}

// Deltas other than text_delta are ignored rather than treated as parse
// failures; the event set is open-ended on the provider side.
#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LlmClient, Provider};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn system_messages_are_promoted_to_the_system_field() {
        let messages = vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("how are you"),
        ];
        let req = AnthropicRequest::new(
            "claude-3-sonnet-20240229",
            &messages,
            ChatOptions::default(),
            false,
        );
        assert_eq!(req.system, "You are terse.");
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].role, "user");
        assert_eq!(req.messages[1].role, "assistant");
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn options_override_max_tokens_and_set_sampling() {
        let messages = vec![ChatMessage::user("hi")];
        let options = ChatOptions::default()
            .with_max_tokens(100)
            .with_temperature(0.5);
        let req = AnthropicRequest::new("claude-3-sonnet-20240229", &messages, options, true);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["max_tokens"], 100);
        assert_eq!(value["temperature"], 0.5);
        assert!(value.get("top_p").is_none());
        assert_eq!(value["stream"], true);
    }

    fn client_for(server: &MockServer) -> LlmClient {
        LlmClient::new(
            Provider::Anthropic,
            "ak-test",
            "claude-3-sonnet-20240229",
            ChatOptions::default(),
        )
        .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn chat_parses_a_canonical_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "OK"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server)
            .chat(&[ChatMessage::user("Reply with OK.")])
            .await
            .unwrap();
        assert_eq!(response.message.content, "OK");
        assert_eq!(response.usage.prompt_tokens, 9);
        assert_eq!(response.finish_reason, "end_turn");
    }

    #[tokio::test]
    async fn chat_surfaces_non_success_status_as_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({"error": "rate limited"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .chat(&[ChatMessage::user("hi")])
            .await
            .expect_err("429 must fail");
        assert!(matches!(err, LlmError::Http(_)));
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn chat_stream_yields_deltas_then_done_with_usage() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"message\":{\"usage\":{\"input_tokens\":4,\"output_tokens\":0}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_delta\n",
            "data: {\"usage\":{\"input_tokens\":4,\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut stream = client_for(&server)
            .chat_stream(&[ChatMessage::user("hi")])
            .await
            .unwrap();

        let mut text = String::new();
        let mut done_usage = None;
        while let Some(chunk) = stream.next().await {
            match chunk.unwrap() {
                StreamChunk::Delta { content } => text.push_str(&content),
                StreamChunk::Done { usage } => done_usage = Some(usage),
            }
        }
        assert_eq!(text, "Hello");
        let usage = done_usage.expect("stream must end with Done");
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 2);
    }
}
