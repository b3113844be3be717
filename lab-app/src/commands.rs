//! Subcommand handlers for the `llmlab` binary.

use crate::config::Settings;
use anyhow::Result;
use futures_util::StreamExt;
use lab_llm::{ChatMessage, ChatOptions, ChatTemplate, Role, StreamChunk, TemplateError};
use std::collections::HashMap;
use std::io::Write;

/// One chat request as assembled from the command line.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider: String,
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub vars: Vec<(String, String)>,
    pub options: ChatOptions,
}

impl ChatRequest {
    /// With `--var` values the prompt and system text are treated as
    /// templates; without them they are sent verbatim.
    fn messages(&self) -> Result<Vec<ChatMessage>, TemplateError> {
        if self.vars.is_empty() {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = &self.system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(&self.prompt));
            return Ok(messages);
        }

        let mut templates = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            templates.push((Role::System, system.as_str()));
        }
        templates.push((Role::User, self.prompt.as_str()));

        let values: HashMap<String, String> = self.vars.iter().cloned().collect();
        ChatTemplate::from_messages(&templates)?.render(&values)
    }
}

pub fn status(settings: &Settings) {
    println!("{}", settings.status_report());
}

pub async fn test(settings: &Settings, provider: &str) -> Result<()> {
    if settings.test_connection(provider).await {
        println!("{provider}: connection ok");
        Ok(())
    } else {
        anyhow::bail!("{provider}: connection failed")
    }
}

pub async fn ask(settings: &Settings, request: &ChatRequest) -> Result<()> {
    let client = settings.chat_client(&request.provider, request.model.as_deref(), request.options)?;
    let response = client.chat(&request.messages()?).await?;

    println!("{}", response.message.content);
    tracing::debug!(
        provider = %client.provider(),
        model = client.model(),
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        finish_reason = %response.finish_reason,
        "chat complete"
    );
    Ok(())
}

pub async fn stream(settings: &Settings, request: &ChatRequest) -> Result<()> {
    let client = settings.chat_client(&request.provider, request.model.as_deref(), request.options)?;
    let mut stream = client.chat_stream(&request.messages()?).await?;

    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Delta { content } => {
                stdout.write_all(content.as_bytes())?;
                stdout.flush()?;
            }
            StreamChunk::Done { usage } => {
                tracing::debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "stream complete"
                );
            }
        }
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(system: Option<&str>, prompt: &str) -> ChatRequest {
        ChatRequest {
            provider: "auto".to_string(),
            model: None,
            system: system.map(str::to_string),
            prompt: prompt.to_string(),
            vars: Vec::new(),
            options: ChatOptions::default(),
        }
    }

    #[test]
    fn request_without_system_is_a_single_user_turn() {
        let messages = request(None, "hello").messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
    }

    #[test]
    fn system_prompt_precedes_the_user_turn() {
        let messages = request(Some("be terse"), "hello").messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "be terse");
        assert_eq!(messages[1].role, Role::User);
    }

    #[test]
    fn braces_are_sent_verbatim_when_no_vars_are_given() {
        let messages = request(None, "print {\"json\": 1}").messages().unwrap();
        assert_eq!(messages[0].content, "print {\"json\": 1}");
    }

    #[test]
    fn vars_render_prompt_and_system_as_templates() {
        let mut req = request(Some("You teach {subject}."), "Explain {topic} briefly.");
        req.vars = vec![
            ("subject".to_string(), "Rust".to_string()),
            ("topic".to_string(), "ownership".to_string()),
        ];
        let messages = req.messages().unwrap();
        assert_eq!(messages[0].content, "You teach Rust.");
        assert_eq!(messages[1].content, "Explain ownership briefly.");
    }

    #[test]
    fn missing_template_value_is_an_error() {
        let mut req = request(None, "Explain {topic}.");
        req.vars = vec![("other".to_string(), "x".to_string())];
        let err = req.messages().expect_err("topic unset");
        assert!(matches!(err, TemplateError::MissingVariable { .. }));
    }
}
