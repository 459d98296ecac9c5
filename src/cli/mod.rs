use clap::{ Parser, Subcommand };
use std::time::Duration;

use crate::llm::{ LlmConfig, LlmType, ParseLlmTypeError };
use crate::stream::action::ActionFields;
use crate::stream::segmenter::{ MarkerError, MarkerPair };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (ollama, openai)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "ollama")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider (e.g., OpenAI)
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., deepseek-r1:8b, gpt-4o-mini)
    #[arg(long, env = "CHAT_MODEL")]
    pub chat_model: Option<String>,

    // --- Stream Protocol Args ---
    /// Seconds before a model stream is cut off and closed with finishReason "timeout".
    #[arg(long, env = "STREAM_TIMEOUT_SECS", default_value = "120")]
    pub stream_timeout_secs: u64,

    /// Marker that opens a reasoning span in model output.
    #[arg(long, env = "THINK_OPEN", default_value = "<think>")]
    pub think_open: String,

    /// Marker that closes a reasoning span in model output.
    #[arg(long, env = "THINK_CLOSE", default_value = "</think>")]
    pub think_close: String,

    /// JSON key carrying the action kind in model answers.
    #[arg(long, env = "ACTION_FIELD", default_value = "action")]
    pub action_field: String,

    /// JSON key carrying the user-facing message in model answers.
    #[arg(long, env = "MESSAGE_FIELD", default_value = "message")]
    pub message_field: String,

    /// JSON key carrying note content in model answers.
    #[arg(long, env = "CONTENT_FIELD", default_value = "content")]
    pub content_field: String,

    /// JSON key carrying the file name for "create" actions.
    #[arg(long, env = "FILENAME_FIELD", default_value = "filename")]
    pub filename_field: String,

    // --- General App Args ---
    /// Path to the prompt configuration file. Built-in templates are used when it does not exist.
    #[arg(long, env = "PROMPTS_PATH", default_value = "json/prompts.json")]
    pub prompts_path: String,

    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Allowed CORS origin. Any origin is allowed when unset.
    #[arg(long, env = "CORS_ORIGIN")]
    pub cors_origin: Option<String>,

    /// Chat requests allowed per second across all clients.
    #[arg(long, env = "RATE_LIMIT_PER_SECOND", default_value = "10")]
    pub rate_limit_per_second: u32,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the chat server (default).
    Serve,
    /// Send one prompt to a running server and apply the returned action to a notes directory.
    Ask(AskArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct AskArgs {
    /// Prompt to send.
    pub prompt: String,

    /// Base URL of the chat server.
    #[arg(long, env = "ASK_SERVER_URL", default_value = "http://127.0.0.1:4000")]
    pub server_url: String,

    /// Directory holding notes as <id>.md files.
    #[arg(long, env = "NOTES_DIR", default_value = "notes")]
    pub notes_dir: String,

    /// Let the model create or edit notes.
    #[arg(long, default_value = "false")]
    pub allow_edits: bool,

    /// Id of the open note; its content is sent as context and "edit" appends to it.
    #[arg(long)]
    pub note: Option<String>,
}

impl Args {
    pub fn markers(&self) -> Result<MarkerPair, MarkerError> {
        MarkerPair::new(&self.think_open, &self.think_close)
    }

    pub fn action_fields(&self) -> ActionFields {
        ActionFields {
            action: self.action_field.clone(),
            message: self.message_field.clone(),
            content: self.content_field.clone(),
            filename: self.filename_field.clone(),
        }
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn llm_config(&self) -> Result<LlmConfig, ParseLlmTypeError> {
        let llm_type: LlmType = self.chat_llm_type.parse()?;
        Ok(LlmConfig {
            llm_type,
            api_key: Some(self.chat_api_key.clone()).filter(|k| !k.is_empty()),
            completion_model: self.chat_model.clone(),
            base_url: self.chat_base_url.clone(),
        })
    }
}
