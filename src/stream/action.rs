//! Best-effort recovery of note actions from answer text.
//!
//! Models write LaTeX inside JSON strings without doubling the backslash, so
//! `\frac` and `\beta` arrive looking like the `\f` and `\b` escapes. A strict
//! JSON decoder accepts them and silently turns them into control characters.
//! This module walks each field by hand instead.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{ Deserialize, Serialize };

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub action: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Key names looked up in the model's JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFields {
    pub action: String,
    pub message: String,
    pub content: String,
    pub filename: String,
}

impl Default for ActionFields {
    fn default() -> Self {
        Self {
            action: "action".to_string(),
            message: "message".to_string(),
            content: "content".to_string(),
            filename: "filename".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionExtractor {
    action_key: String,
    action: Regex,
    message: Regex,
    content: Regex,
    filename: Regex,
}

lazy_static! {
    static ref DEFAULT_EXTRACTOR: ActionExtractor =
        ActionExtractor::new(&ActionFields::default()).expect("default action field patterns compile");
}

/// Extracts with the default field names.
pub fn extract(text: &str) -> Option<ActionPayload> {
    DEFAULT_EXTRACTOR.extract(text)
}

impl ActionExtractor {
    pub fn new(fields: &ActionFields) -> Result<Self, regex::Error> {
        Ok(Self {
            action_key: format!("\"{}\"", fields.action),
            action: key_pattern(&fields.action)?,
            message: key_pattern(&fields.message)?,
            content: key_pattern(&fields.content)?,
            filename: key_pattern(&fields.filename)?,
        })
    }

    /// Returns a payload only when both the action and message fields are
    /// present. Anything else, including ordinary prose, yields `None`.
    pub fn extract(&self, text: &str) -> Option<ActionPayload> {
        let text = text.trim();
        if !text.starts_with('{') || !text.contains(self.action_key.as_str()) {
            return None;
        }

        let action = field_value(&self.action, text)?;
        let message = field_value(&self.message, text)?;
        Some(ActionPayload {
            action,
            message,
            content: field_value(&self.content, text),
            filename: field_value(&self.filename, text),
        })
    }
}

impl Default for ActionExtractor {
    fn default() -> Self {
        DEFAULT_EXTRACTOR.clone()
    }
}

fn key_pattern(field: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r#""{}"\s*:\s*""#, regex::escape(field)))
}

fn field_value(pattern: &Regex, text: &str) -> Option<String> {
    pattern.find(text).map(|m| walk_string(&text[m.end()..]))
}

/// Decodes a JSON string body up to the first unescaped quote.
///
/// Differs from JSON in two ways: `\b`/`\f` followed by a letter stay literal
/// (`\beta`, `\frac`), and unknown escapes such as `\alpha` or `\partial` are
/// kept as the two characters they are.
fn walk_string(text: &str) -> String {
    let mut out = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('/') => out.push('/'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(esc @ ('b' | 'f')) => {
                    if chars.peek().is_some_and(|next| next.is_alphabetic()) {
                        out.push('\\');
                        out.push(esc);
                    } else if esc == 'b' {
                        out.push('\u{8}');
                    } else {
                        out.push('\u{c}');
                    }
                }
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_latex_that_collides_with_json_escapes() {
        let text = r#"{"action":"edit","message":"Use \beta and \frac{1}{2}"}"#;
        let payload = extract(text).unwrap();
        assert_eq!(payload.message, r"Use \beta and \frac{1}{2}");

        // what a strict decoder would have produced
        let strict: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(strict["message"], "Use \u{8}eta and \u{c}rac{1}{2}");
    }

    #[test]
    fn decodes_standard_escapes() {
        let payload = extract(r#"{"action":"edit","message":"line1\nline2 \"q\" a\/b \\ x\ty"}"#).unwrap();
        assert_eq!(payload.message, "line1\nline2 \"q\" a/b \\ x\ty");
    }

    #[test]
    fn backspace_and_form_feed_before_non_letters() {
        let payload = extract(r#"{"action":"chat","message":"a\b1\f "}"#).unwrap();
        assert_eq!(payload.message, "a\u{8}1\u{c} ");
    }

    #[test]
    fn keeps_unknown_escapes_literally() {
        let payload = extract(r#"{"action":"chat","message":"$\alpha + \partial_x \eta$"}"#).unwrap();
        assert_eq!(payload.message, r"$\alpha + \partial_x \eta$");
    }

    #[test]
    fn prose_is_not_an_action() {
        assert_eq!(extract("Just a normal sentence."), None);
        assert_eq!(extract("The answer is 4."), None);
        assert_eq!(extract(r#"Here you go: {"action":"edit","message":"x"}"#), None);
    }

    #[test]
    fn requires_action_and_message() {
        assert_eq!(extract(r#"{"action":"edit","content":"x"}"#), None);
        assert_eq!(extract(r#"{"message":"x", "note": "\"action\""}"#), None);
    }

    #[test]
    fn recovers_optional_fields_with_loose_spacing() {
        let text = "  {\n  \"action\" : \"create\",\n  \"filename\": \"attention.md\",\n  \"message\":\"Created.\",\n  \"content\": \"# Attention\\n\\n$$\\frac{QK^T}{\\sqrt{d}}$$\"\n}\n";
        let payload = extract(text).unwrap();
        assert_eq!(payload.action, "create");
        assert_eq!(payload.filename.as_deref(), Some("attention.md"));
        assert_eq!(payload.content.as_deref(), Some("# Attention\n\n$$\\frac{QK^T}{\\sqrt{d}}$$"));
    }

    #[test]
    fn unterminated_value_runs_to_end_of_text() {
        let payload = extract(r#"{"action":"edit","message":"cut off"#).unwrap();
        assert_eq!(payload.message, "cut off");
    }

    #[test]
    fn custom_field_names() {
        let fields = ActionFields {
            action: "op".into(),
            message: "summary".into(),
            content: "body".into(),
            filename: "file".into(),
        };
        let extractor = ActionExtractor::new(&fields).unwrap();
        let payload = extractor.extract(r#"{"op":"create","summary":"ok","file":"a.md"}"#).unwrap();
        assert_eq!(payload.action, "create");
        assert_eq!(payload.filename.as_deref(), Some("a.md"));
        assert_eq!(payload.content, None);
        assert_eq!(extractor.extract(r#"{"action":"create","message":"ok"}"#), None);
    }
}
