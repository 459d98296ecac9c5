use serde::{ Serialize, Deserialize };

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatMessagePart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: String,
}

/// Accepts both UI messages with `parts` and plain `{role, content}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ChatMessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: Vec::new(),
            content: Some(content.into()),
        }
    }

    pub fn text(&self) -> String {
        if !self.parts.is_empty() {
            return self.parts
                .iter()
                .filter(|p| p.part_type == "text" && !p.text.is_empty())
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
        }
        self.content.clone().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub current_note: String,
    #[serde(default)]
    pub allow_edits: bool,
    #[serde(default)]
    pub active_note_title: String,
    #[serde(default)]
    pub active_note_id: Option<String>,
}

impl ChatRequest {
    pub fn context(&self) -> ChatContext {
        ChatContext {
            current_note: self.current_note.clone(),
            allow_edits: self.allow_edits,
            active_note_title: self.active_note_title.clone(),
            active_note_id: self.active_note_id.clone().filter(|id| !id.is_empty()),
        }
    }
}

/// Per-request note context, passed explicitly to prompt rendering and
/// action application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatContext {
    pub current_note: String,
    pub allow_edits: bool,
    pub active_note_title: String,
    pub active_note_id: Option<String>,
}
