use crate::models::chat::{ ChatContext, ChatMessage };
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use log::info;

pub const CHAT_RESPONSE_KEY: &str = "chat_response";
pub const EDIT_ALLOWED_KEY: &str = "edit_allowed";
pub const CHAT_ONLY_KEY: &str = "chat_only";

const HISTORY_FOR_PROMPT_LEN: usize = 6;
const ACTIVE_NOTE_PROMPT_CHARS: usize = 2000;

const DEFAULT_CHAT_RESPONSE: &str = r#"You are a research assistant inside a note-taking app. The open note is "{active_note_title}".

## Conversation
{history}

## Open note
{active_notes}

{mode_instruction}

Reply with one JSON object and nothing else:
{"action": "chat", "message": "markdown answer"}
{"action": "edit", "message": "short confirmation", "content": "markdown to append"}
{"action": "create", "filename": "short-name.md", "message": "short confirmation", "content": "markdown"}

Escape newlines as \n and quotes as \". Put all math inside $...$ or $$...$$."#;

const DEFAULT_EDIT_ALLOWED: &str = r#"Pick the action from the request: "chat" for questions and discussion, "edit" to add to the open note ("{active_note_title}"), "create" when the user asks for a new note or file."#;

const DEFAULT_CHAT_ONLY: &str = r#"Edits are disabled. Always use "action": "chat"."#;

#[derive(Debug)]
pub enum PromptError {
    TemplateNotFound(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::TemplateNotFound(key) => write!(f, "Prompt template '{}' not found", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PromptConfig {
    pub response_templates: HashMap<String, String>,
    #[serde(skip)]
    pub last_loaded: Option<SystemTime>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        let response_templates = [
            (CHAT_RESPONSE_KEY, DEFAULT_CHAT_RESPONSE),
            (EDIT_ALLOWED_KEY, DEFAULT_EDIT_ALLOWED),
            (CHAT_ONLY_KEY, DEFAULT_CHAT_ONLY),
        ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { response_templates, last_loaded: None }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        for key in [CHAT_RESPONSE_KEY, EDIT_ALLOWED_KEY, CHAT_ONLY_KEY] {
            if !self.response_templates.contains_key(key) {
                return Err(PromptError::TemplateNotFound(format!("response_templates:{}", key)));
            }
        }
        Ok(())
    }
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(&path)?;
    let mut config: PromptConfig = serde_json::from_str(&file_content)?;
    config.validate()?;
    config.last_loaded = Some(SystemTime::now());
    Ok(Arc::new(config))
}

/// Loads the prompts file, or the built-in templates when it does not exist.
pub fn load_prompts_or_default<P: AsRef<Path>>(path: P) -> Result<Arc<PromptConfig>, PromptError> {
    if !path.as_ref().exists() {
        info!("No prompts file at {}, using built-in templates", path.as_ref().display());
        return Ok(Arc::new(PromptConfig::default()));
    }
    info!("Loading prompts from {}", path.as_ref().display());
    load_prompts(path)
}

fn get_response_template<'a>(config: &'a PromptConfig, key: &str) -> Result<&'a str, PromptError> {
    config.response_templates
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| PromptError::TemplateNotFound(format!("response_templates:{}", key)))
}

pub fn format_history_for_prompt(messages: &[ChatMessage]) -> String {
    let start = messages.len().saturating_sub(HISTORY_FOR_PROMPT_LEN);
    let mut result = String::new();
    for msg in &messages[start..] {
        let role_display = match msg.role.as_str() {
            "user" => "User",
            "assistant" => "Assistant",
            other => other,
        };

        result.push_str(&format!("{}: {}\n", role_display, msg.text()));
    }

    result
}

pub fn get_chat_prompt(
    config: &PromptConfig,
    messages: &[ChatMessage],
    context: &ChatContext
) -> Result<String, PromptError> {
    let template = get_response_template(config, CHAT_RESPONSE_KEY)?;
    let mode_key = if context.allow_edits { EDIT_ALLOWED_KEY } else { CHAT_ONLY_KEY };
    let mode_instruction = get_response_template(config, mode_key)?;

    let title = if context.active_note_title.is_empty() { "Untitled" } else { context.active_note_title.as_str() };
    let active_notes: String = if context.current_note.is_empty() {
        "No active notes.".to_string()
    } else {
        context.current_note.chars().take(ACTIVE_NOTE_PROMPT_CHARS).collect()
    };

    // The mode instruction goes in first so its own placeholders get filled.
    Ok(
        template
            .replace("{mode_instruction}", mode_instruction)
            .replace("{history}", &format_history_for_prompt(messages))
            .replace("{active_notes}", &active_notes)
            .replace("{active_note_title}", title)
    )
}
