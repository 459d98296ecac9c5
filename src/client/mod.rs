//! Consumer side: reads a wire stream back into parts and acts on the answer.

use crate::cli::{ Args, AskArgs };
use crate::models::chat::{ ChatMessage, ChatRequest };
use crate::notes::{ extract_title, ActionGuard, ApplyOutcome, DirNoteStore };
use crate::server::api::MESSAGE_ID_HEADER;
use crate::stream::action::{ ActionExtractor, ActionPayload };
use crate::stream::wire::{ Part, PartType, WireDecoder };
use bytes::Bytes;
use futures::{ Stream, StreamExt };
use log::{ info, warn };
use serde_json::Value;
use std::error::Error;
use std::fmt::Display;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Extra time the client waits past the server-side stream timeout, so the
/// server's own `timeout` end markers arrive first.
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// An end marker arrived before the stream closed.
    Completed,
    TimedOut,
    Interrupted(String),
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub parts: Vec<Part>,
    pub finish: Option<Value>,
    pub outcome: StreamOutcome,
    pub dropped_lines: usize,
}

impl ReceivedMessage {
    fn joined(&self, part_type: PartType) -> String {
        self.parts
            .iter()
            .filter(|p| p.part_type == part_type)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn answer_text(&self) -> String {
        self.joined(PartType::Text)
    }

    pub fn reasoning_text(&self) -> String {
        self.joined(PartType::Reasoning)
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish.as_ref()?.get("finishReason")?.as_str()
    }

    /// Recovers the action from the final answer part. Messages that never
    /// received their end marker have no finalized answer and yield `None`.
    pub fn action(&self, extractor: &ActionExtractor) -> Option<ActionPayload> {
        if self.outcome != StreamOutcome::Completed {
            return None;
        }
        self.parts
            .iter()
            .rev()
            .find(|p| p.part_type == PartType::Text)
            .and_then(|p| extractor.extract(&p.text))
    }
}

/// Decodes `stream` until it ends or `timeout` passes. Never fails: transport
/// errors and timeouts are reported through [`StreamOutcome`] alongside the
/// parts decoded up to that point. `on_update` sees the parts after every read.
pub async fn consume<S, E, F>(
    mut stream: S,
    message_id: Option<String>,
    timeout: Duration,
    mut on_update: F
) -> ReceivedMessage
    where S: Stream<Item = Result<Bytes, E>> + Unpin, E: Display, F: FnMut(&[Part])
{
    let deadline = Instant::now() + timeout;
    let mut decoder = WireDecoder::new();

    let outcome = loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                warn!("No end marker within {:?}; keeping {} parts", timeout, decoder.parts().len());
                break StreamOutcome::TimedOut;
            }
            Ok(None) => {
                if decoder.finish_metadata().is_some() {
                    break StreamOutcome::Completed;
                }
                break StreamOutcome::Interrupted("stream closed without an end marker".to_string());
            }
            Ok(Some(Ok(bytes))) => {
                on_update(decoder.feed(&bytes));
            }
            Ok(Some(Err(e))) => {
                warn!("Stream read failed: {}", e);
                break StreamOutcome::Interrupted(e.to_string());
            }
        }
    };
    drop(stream);
    decoder.finish();

    let finish = decoder.finish_metadata().cloned();
    let id = message_id
        .or_else(|| {
            finish
                .as_ref()
                .and_then(|m| m.get("messageId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let dropped_lines = decoder.dropped_lines();

    ReceivedMessage {
        id,
        parts: decoder.into_parts(),
        finish,
        outcome,
        dropped_lines,
    }
}

/// Prints only the text each update adds.
#[derive(Debug, Default)]
struct PartPrinter {
    part: usize,
    printed: usize,
}

impl PartPrinter {
    fn print_new(&mut self, parts: &[Part]) {
        let mut out = std::io::stdout().lock();
        while let Some(part) = parts.get(self.part) {
            if self.printed == 0 {
                let label = match part.part_type {
                    PartType::Reasoning => "reasoning",
                    PartType::Text => "answer",
                };
                let _ = write!(out, "\n--- {} ---\n", label);
            }
            let _ = write!(out, "{}", &part.text[self.printed..]);
            self.printed = part.text.len();
            if self.part + 1 >= parts.len() {
                break;
            }
            self.part += 1;
            self.printed = 0;
        }
        let _ = out.flush();
    }
}

pub async fn ask(args: &Args, ask: &AskArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let extractor = ActionExtractor::new(&args.action_fields())?;
    let store = Arc::new(DirNoteStore::open(&ask.notes_dir).await?);

    let (current_note, active_note_title) = match &ask.note {
        Some(note_id) => {
            let body = store.read_note(note_id).await?;
            let title = extract_title(&body, note_id);
            (body, title)
        }
        None => (String::new(), String::new()),
    };
    let request = ChatRequest {
        messages: vec![ChatMessage::user(ask.prompt.clone())],
        current_note,
        allow_edits: ask.allow_edits,
        active_note_title,
        active_note_id: ask.note.clone(),
    };
    let context = request.context();

    let url = format!("{}/api/chat", ask.server_url.trim_end_matches('/'));
    info!("Sending prompt to {}", url);
    let resp = reqwest::Client::new().post(&url).json(&request).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("Server returned {}: {}", status, body).into());
    }
    let header_id = resp
        .headers()
        .get(MESSAGE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut printer = PartPrinter::default();
    let message = consume(
        Box::pin(resp.bytes_stream()),
        header_id,
        args.stream_timeout() + CLIENT_TIMEOUT_SLACK,
        |parts| printer.print_new(parts)
    ).await;
    println!();

    match &message.outcome {
        StreamOutcome::Completed => {
            info!("Message {} finished: {}", message.id, message.finish_reason().unwrap_or("unknown"));
        }
        StreamOutcome::TimedOut => warn!("Message {} timed out", message.id),
        StreamOutcome::Interrupted(reason) => warn!("Message {} interrupted: {}", message.id, reason),
    }

    let payload = match message.action(&extractor) {
        Some(payload) => payload,
        None => {
            info!("Answer is not an action; shown as raw text");
            return Ok(());
        }
    };
    println!("\n{}", payload.message);

    let guard = ActionGuard::new(store);
    match guard.apply(&message.id, &payload, &context).await? {
        ApplyOutcome::Applied(record) => println!("[{}] {} ({})", payload.action, record.title, record.id),
        ApplyOutcome::AlreadyApplied => info!("Action for {} was already applied", message.id),
        ApplyOutcome::Skipped(reason) => info!("Action '{}' not applied: {:?}", payload.action, reason),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const WIRE: &str = concat!(
        "g\"2+2\"\n",
        "0\"{\\\"action\\\": \\\"chat\\\", \\\"message\\\": \\\"$\\\\frac{1}{2}$\\\"}\"\n",
        "e{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":1,\"completionTokens\":2},\"isContinued\":false}\n",
        "d{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":1,\"completionTokens\":2},\"latencyMs\":5,\"messageId\":\"m-42\"}\n"
    );

    fn chunks(bytes: &[u8], size: usize) -> Vec<Result<Bytes, String>> {
        bytes
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    #[tokio::test]
    async fn consumes_split_stream_and_recovers_action() {
        let mut updates = 0;
        let message = consume(
            stream::iter(chunks(WIRE.as_bytes(), 7)),
            None,
            Duration::from_secs(5),
            |_| updates += 1
        ).await;

        assert_eq!(message.outcome, StreamOutcome::Completed);
        assert_eq!(message.id, "m-42");
        assert_eq!(message.finish_reason(), Some("stop"));
        assert_eq!(message.reasoning_text(), "2+2");
        assert!(updates > 1);

        let payload = message.action(&ActionExtractor::default()).unwrap();
        assert_eq!(payload.action, "chat");
        assert_eq!(payload.message, "$\\frac{1}{2}$");
    }

    #[tokio::test]
    async fn header_id_wins_over_metadata() {
        let message = consume(
            stream::iter(chunks(WIRE.as_bytes(), 64)),
            Some("from-header".into()),
            Duration::from_secs(5),
            |_| {}
        ).await;
        assert_eq!(message.id, "from-header");
    }

    #[tokio::test]
    async fn timeout_keeps_partial_parts() {
        let head = stream::iter(chunks(b"0\"partial\"\n0\"cut", 64));
        let message = consume(
            Box::pin(head.chain(stream::pending())),
            None,
            Duration::from_millis(50),
            |_| {}
        ).await;
        assert_eq!(message.outcome, StreamOutcome::TimedOut);
        assert_eq!(message.answer_text(), "partial");
        assert_eq!(message.dropped_lines, 1);
        assert!(message.action(&ActionExtractor::default()).is_none());
    }

    #[tokio::test]
    async fn close_without_end_marker_is_interrupted() {
        let body = "0\"{\\\"action\\\": \\\"edit\\\", \\\"message\\\": \\\"ok\\\", \\\"content\\\": \\\"x\\\"}\"\n";
        let message = consume(stream::iter(chunks(body.as_bytes(), 5)), None, Duration::from_secs(5), |_| {}).await;
        assert!(matches!(message.outcome, StreamOutcome::Interrupted(_)));
        assert!(message.action(&ActionExtractor::default()).is_none());

        let failing = stream::iter(vec![Ok(Bytes::from_static(b"g\"x\"\n")), Err("reset".to_string())]);
        let message = consume(failing, None, Duration::from_secs(5), |_| {}).await;
        assert_eq!(message.outcome, StreamOutcome::Interrupted("reset".into()));
        assert_eq!(message.reasoning_text(), "x");
    }

    #[test]
    fn printer_tracks_growth_across_parts() {
        let mut printer = PartPrinter::default();
        printer.print_new(&[Part::reasoning("ab")]);
        assert_eq!((printer.part, printer.printed), (0, 2));
        printer.print_new(&[Part::reasoning("abc"), Part::text("d")]);
        assert_eq!((printer.part, printer.printed), (1, 1));
    }
}
