//! Settings snapshot and provider resolution.
//!
//! The snapshot is read from the process environment once at startup
//! (optionally merged from a `.env` file) and then passed by reference into
//! every operation; nothing here mutates it afterwards.

use lab_llm::{ChatMessage, ChatOptions, LlmClient, Provider};
use std::fmt;
use thiserror::Error;

const DEFAULT_PROJECT_NAME: &str = "langchain-lab";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-sonnet-20240229";

const PROBE_PROMPT: &str = "Reply with just 'OK' to test the connection.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing credentials: {reason}")]
    MissingCredentials { reason: String },

    #[error("unsupported provider {name:?}; use \"openai\", \"anthropic\" or \"auto\"")]
    UnsupportedProvider { name: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Directive string for a tracing-subscriber `EnvFilter`. `Critical`
    /// maps to `error`, the most severe level tracing has.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Presence flags per credential. Tracing is optional and never causes
/// validation to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStatus {
    pub openai: bool,
    pub anthropic: bool,
    pub tracing: bool,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub tracing_api_key: Option<String>,
    pub tracing_enabled: bool,
    pub project_name: String,
    pub default_openai_model: String,
    pub default_anthropic_model: String,
    pub debug: bool,
    pub log_level: LogLevel,
}

impl Settings {
    /// Merge a `.env` file into the environment if one is present, then
    /// read the snapshot. Never fails and touches no network: absent
    /// variables become `None` or defaults.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read the snapshot from the process environment only.
    pub fn from_env() -> Self {
        Self {
            openai_api_key: env_opt("OPENAI_API_KEY"),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            tracing_api_key: env_opt("LANGCHAIN_API_KEY"),
            tracing_enabled: env_bool("LANGCHAIN_TRACING_V2"),
            project_name: env_or("LANGCHAIN_PROJECT", DEFAULT_PROJECT_NAME),
            default_openai_model: env_or("DEFAULT_OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
            default_anthropic_model: env_or("DEFAULT_ANTHROPIC_MODEL", DEFAULT_ANTHROPIC_MODEL),
            debug: env_bool("DEBUG"),
            log_level: env_opt("LOG_LEVEL")
                .and_then(|v| LogLevel::parse(&v))
                .unwrap_or_default(),
        }
    }

    pub fn key_status(&self) -> KeyStatus {
        KeyStatus {
            openai: self.openai_api_key.is_some(),
            anthropic: self.anthropic_api_key.is_some(),
            tracing: self.tracing_api_key.is_some(),
        }
    }

    /// Check that the snapshot is usable for client construction: at least
    /// one provider key must be present.
    pub fn validate_api_keys(&self) -> Result<KeyStatus, ConfigError> {
        let status = self.key_status();
        if !status.openai && !status.anthropic {
            return Err(ConfigError::MissingCredentials {
                reason: "at least one of OPENAI_API_KEY or ANTHROPIC_API_KEY must be set"
                    .to_string(),
            });
        }
        Ok(status)
    }

    /// Turn a provider request into a concrete `Provider`.
    ///
    /// `requested` is matched case-insensitively against "openai",
    /// "anthropic" and "auto". An explicit provider resolves to itself iff
    /// its key is present, regardless of the other key.
    pub fn resolve_provider(&self, requested: &str) -> Result<Provider, ConfigError> {
        match requested.to_ascii_lowercase().as_str() {
            // Fixed tie-break: OpenAI is preferred when both keys are set.
            "auto" => {
                if self.openai_api_key.is_some() {
                    Ok(Provider::OpenAI)
                } else if self.anthropic_api_key.is_some() {
                    Ok(Provider::Anthropic)
                } else {
                    Err(ConfigError::MissingCredentials {
                        reason: "at least one of OPENAI_API_KEY or ANTHROPIC_API_KEY must be set"
                            .to_string(),
                    })
                }
            }
            "openai" => {
                if self.openai_api_key.is_some() {
                    Ok(Provider::OpenAI)
                } else {
                    Err(ConfigError::MissingCredentials {
                        reason: "OPENAI_API_KEY is not set".to_string(),
                    })
                }
            }
            "anthropic" => {
                if self.anthropic_api_key.is_some() {
                    Ok(Provider::Anthropic)
                } else {
                    Err(ConfigError::MissingCredentials {
                        reason: "ANTHROPIC_API_KEY is not set".to_string(),
                    })
                }
            }
            _ => Err(ConfigError::UnsupportedProvider {
                name: requested.to_string(),
            }),
        }
    }

    /// Build a chat client for a concrete provider. Selects the snapshot's
    /// default model for the provider when `model` is `None`; the options
    /// are forwarded to the client untouched.
    pub fn build_client(
        &self,
        provider: Provider,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LlmClient, ConfigError> {
        let (api_key, default_model) = match provider {
            Provider::OpenAI => (
                self.openai_api_key.as_deref(),
                self.default_openai_model.as_str(),
            ),
            Provider::Anthropic => (
                self.anthropic_api_key.as_deref(),
                self.default_anthropic_model.as_str(),
            ),
        };
        let Some(api_key) = api_key else {
            return Err(ConfigError::MissingCredentials {
                reason: format!("no API key configured for provider {provider}"),
            });
        };
        let model = model.unwrap_or(default_model);
        Ok(LlmClient::new(provider, api_key, model, options))
    }

    /// Resolve and build in one step.
    pub fn chat_client(
        &self,
        requested: &str,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LlmClient, ConfigError> {
        let provider = self.resolve_provider(requested)?;
        self.build_client(provider, model, options)
    }

    /// Resolve a client and issue one minimal chat call. Never returns an
    /// error: any failure is logged and reported as `false`. The success
    /// path makes exactly one outbound call.
    pub async fn test_connection(&self, requested: &str) -> bool {
        let client = match self.chat_client(requested, None, ChatOptions::default()) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(requested, error = %e, "connection test could not build a client");
                return false;
            }
        };
        probe(&client).await
    }

    /// Human-readable configuration summary. Reports key presence only;
    /// key material is never included.
    pub fn status_report(&self) -> String {
        let status = self.key_status();
        let mut out = String::from("configuration status\n");
        out.push_str(&format!(
            "  openai_api_key:          {}\n",
            present(status.openai)
        ));
        out.push_str(&format!(
            "  anthropic_api_key:       {}\n",
            present(status.anthropic)
        ));
        out.push_str(&format!(
            "  tracing_api_key:         {} (optional)\n",
            present(status.tracing)
        ));
        out.push_str(&format!(
            "  tracing_enabled:         {}\n",
            self.tracing_enabled
        ));
        out.push_str(&format!("  project_name:            {}\n", self.project_name));
        out.push_str(&format!("  debug:                   {}\n", self.debug));
        out.push_str(&format!("  log_level:               {}\n", self.log_level));
        out.push_str(&format!(
            "  default_openai_model:    {}\n",
            self.default_openai_model
        ));
        out.push_str(&format!(
            "  default_anthropic_model: {}",
            self.default_anthropic_model
        ));
        out
    }

    /// EnvFilter directive derived from the snapshot; `DEBUG=true` wins
    /// over `LOG_LEVEL`.
    pub fn env_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            self.log_level.as_filter()
        }
    }
}

/// One minimal chat call against an already-built client, reported as a
/// boolean. Split out of `test_connection` so it can be exercised against a
/// local test server.
pub async fn probe(client: &LlmClient) -> bool {
    match client.chat(&[ChatMessage::user(PROBE_PROMPT)]).await {
        Ok(response) => {
            tracing::info!(
                provider = %client.provider(),
                model = client.model(),
                content = %response.message.content,
                "connection test succeeded"
            );
            true
        }
        Err(e) => {
            tracing::warn!(provider = %client.provider(), error = %e, "connection test failed");
            false
        }
    }
}

fn present(set: bool) -> &'static str {
    if set { "set" } else { "missing" }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_bool(name: &str) -> bool {
    env_opt(name).map(|v| parse_bool(&v)).unwrap_or(false)
}

// Only the literal "true" (any case) enables a boolean flag.
fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
