use async_trait::async_trait;
use log::info;
use reqwest::{Client as HttpClient, header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION}};
use serde::{Deserialize, Serialize};

use super::{http_line_stream, ChatClient, ChatStream, LineEvent, LlmError, ModelChunk};
use crate::llm::{LlmConfig, LlmType};
use crate::stream::wire::Usage;

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

pub struct OpenAIChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl OpenAIChatClient {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.llm_type != LlmType::OpenAI {
            return Err(LlmError::Config("Invalid config type for OpenAIChatClient".into()));
        }
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| LlmError::Config("OpenAI API key is required".into()))?;

        Ok(Self::new(api_key, config.completion_model.clone(), config.base_url.clone()))
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| LlmError::Config(format!("Invalid API key header: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}

/// Parses one SSE line of a chat completions stream.
pub fn parse_sse_line(line: &str) -> LineEvent {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => {
            return LineEvent::Skip;
        }
    };
    if data == "[DONE]" {
        return LineEvent::Done(None);
    }
    let resp = match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(resp) => resp,
        Err(e) => {
            info!("JSON parse error: {} for line: {}", e, line);
            return LineEvent::Skip;
        }
    };
    if let Some(usage) = resp.usage {
        return LineEvent::Chunk(ModelChunk::Usage(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }));
    }
    let text: String = resp.choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        return LineEvent::Skip;
    }
    LineEvent::Chunk(ModelChunk::Text(text))
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_completion(&self, prompt: &str) -> Result<ChatStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: true,
            stream_options: StreamOptions { include_usage: true },
        };
        let request = self.http.post(&url).headers(self.headers()?).json(&body);
        http_line_stream(request, parse_sse_line).await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
