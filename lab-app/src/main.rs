//! llmlab main binary.

mod commands;
mod config;

use clap::{Args, Parser, Subcommand};
use config::Settings;
use lab_llm::ChatOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "llmlab", version, about = "Multi-provider LLM workbench")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show which credentials and defaults are configured.
    Status,
    /// Send one minimal chat call to verify credentials and connectivity.
    Test {
        /// Provider to test: openai, anthropic or auto.
        #[arg(long, default_value = "auto")]
        provider: String,
    },
    /// Send a prompt and print the full response.
    Ask {
        prompt: String,
        #[command(flatten)]
        flags: ChatFlags,
    },
    /// Send a prompt and print the response as it streams in.
    Stream {
        prompt: String,
        #[command(flatten)]
        flags: ChatFlags,
    },
}

#[derive(Debug, Args)]
struct ChatFlags {
    /// Provider to use: openai, anthropic or auto.
    #[arg(long, default_value = "auto")]
    provider: String,
    /// Model identifier; defaults to the provider's configured model.
    #[arg(long)]
    model: Option<String>,
    /// System prompt sent ahead of the user prompt.
    #[arg(long)]
    system: Option<String>,
    /// Template value as key=value; with vars, `{key}` placeholders in the
    /// prompt and system text are substituted before sending.
    #[arg(long = "var", value_parser = parse_key_val)]
    vars: Vec<(String, String)>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    top_p: Option<f32>,
}

impl ChatFlags {
    fn into_request(self, prompt: String) -> commands::ChatRequest {
        commands::ChatRequest {
            provider: self.provider,
            model: self.model,
            system: self.system,
            prompt,
            vars: self.vars,
            options: ChatOptions {
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                top_p: self.top_p,
            },
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load();
    init_tracing(&settings)?;

    let cli = Cli::parse();
    match cli.command {
        Command::Status => {
            commands::status(&settings);
            Ok(())
        }
        Command::Test { provider } => commands::test(&settings, &provider).await,
        Command::Ask { prompt, flags } => {
            commands::ask(&settings, &flags.into_request(prompt)).await
        }
        Command::Stream { prompt, flags } => {
            commands::stream(&settings, &flags.into_request(prompt)).await
        }
    }
}

fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(settings.env_filter()),
    };
    let log_format = std::env::var("LLMLAB_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_ascii_lowercase();

    // Logs go to stderr so piped command output stays clean.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .json()
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported LLMLAB_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        project = %settings.project_name,
        "tracing initialized"
    );
    Ok(())
}
