pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use std::pin::Pin;
use std::sync::Arc;
use super::{ LlmConfig, LlmType };
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use crate::stream::line::LineBuffer;
use crate::stream::wire::Usage;
use log::{ debug, warn };
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One increment from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChunk {
    Text(String),
    Usage(Usage),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model endpoint returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("model reported an error: {0}")]
    Upstream(String),
    #[error("invalid LLM configuration: {0}")]
    Config(String),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, LlmError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Starts a streaming completion. Dropping the returned stream closes the
    /// upstream connection.
    async fn stream_completion(&self, prompt: &str) -> Result<ChatStream, LlmError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

/// What a provider-specific parser made of one response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Skip,
    Chunk(ModelChunk),
    Error(String),
    Done(Option<Usage>),
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Ollama => {
            let specific_client = OllamaClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// Sends `request` and turns the line-delimited response body into a
/// [`ChatStream`], reassembling lines that straddle network reads.
pub async fn http_line_stream(
    request: reqwest::RequestBuilder,
    line_parser: fn(&str) -> LineEvent
) -> Result<ChatStream, LlmError> {
    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(LlmError::Status { status: status.as_u16(), body });
    }

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut bytes = Box::pin(resp.bytes_stream());
        let mut lines = LineBuffer::new();
        loop {
            // Stop reading once the receiver is gone, even while the model is silent.
            let chunk = tokio::select! {
                _ = tx.closed() => {
                    debug!("Model stream receiver dropped; closing upstream");
                    return;
                }
                chunk = bytes.next() => chunk,
            };
            match chunk {
                Some(Ok(buf)) => {
                    lines.push(&buf);
                    while let Some(line) = lines.next_line() {
                        let line = match line {
                            Ok(line) => line,
                            Err(e) => {
                                warn!("Skipping model response line: {}", e);
                                continue;
                            }
                        };
                        match forward_line(&tx, line_parser(&line)).await {
                            Forward::Continue => {}
                            Forward::Stop => {
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(LlmError::Http(e))).await;
                    return;
                }
                None => break,
            }
        }
        if let Some(Ok(rest)) = lines.take_remainder() {
            let _ = forward_line(&tx, line_parser(&rest)).await;
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

enum Forward {
    Continue,
    Stop,
}

async fn forward_line(
    tx: &mpsc::Sender<Result<ModelChunk, LlmError>>,
    event: LineEvent
) -> Forward {
    match event {
        LineEvent::Skip => Forward::Continue,
        LineEvent::Chunk(chunk) => {
            if tx.send(Ok(chunk)).await.is_err() {
                debug!("Model stream receiver dropped; closing upstream");
                return Forward::Stop;
            }
            Forward::Continue
        }
        LineEvent::Error(message) => {
            let _ = tx.send(Err(LlmError::Upstream(message))).await;
            Forward::Stop
        }
        LineEvent::Done(usage) => {
            if let Some(usage) = usage {
                let _ = tx.send(Ok(ModelChunk::Usage(usage))).await;
            }
            Forward::Stop
        }
    }
}
