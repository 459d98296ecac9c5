use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use super::{ http_line_stream, ChatClient, ChatStream, LineEvent, LlmError, ModelChunk };
use crate::llm::{ LlmConfig, LlmType };
use crate::stream::wire::Usage;
use log::{ info, warn };

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "deepseek-r1:8b";

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Self {
        let model = completion_model.unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());
        let url = base_url.unwrap_or_else(|| DEFAULT_OLLAMA_URL.into());

        Self {
            http: HttpClient::new(),
            base_url: url,
            completion_model: model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.llm_type != LlmType::Ollama {
            return Err(LlmError::Config("Invalid config type for OllamaClient".into()));
        }

        Ok(Self::new(config.base_url.clone(), config.completion_model.clone()))
    }
}

/// Parses one NDJSON line of `/api/chat` output.
pub fn parse_stream_line(line: &str) -> LineEvent {
    if line.trim().is_empty() {
        return LineEvent::Skip;
    }
    let resp = match serde_json::from_str::<StreamResponse>(line) {
        Ok(resp) => resp,
        Err(e) => {
            info!("JSON parse error: {} for line: {}", e, line);
            return LineEvent::Skip;
        }
    };
    if let Some(err) = resp.error {
        warn!("Ollama reported an error mid-stream: {}", err);
        return LineEvent::Error(err);
    }
    let content = resp.message.map(|m| m.content).unwrap_or_default();
    if resp.done {
        let usage = match (resp.prompt_eval_count, resp.eval_count) {
            (None, None) => None,
            (prompt, completion) => Some(Usage {
                prompt_tokens: prompt.unwrap_or(0),
                completion_tokens: completion.unwrap_or(0),
            }),
        };
        return LineEvent::Done(usage);
    }
    if content.is_empty() {
        return LineEvent::Skip;
    }
    LineEvent::Chunk(ModelChunk::Text(content))
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn stream_completion(&self, prompt: &str) -> Result<ChatStream, LlmError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = ChatRequestBody {
            model: &self.completion_model,
            messages: vec![RequestMessage { role: "user", content: prompt }],
            stream: true,
        };
        http_line_stream(self.http.post(&url).json(&body), parse_stream_line).await
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
