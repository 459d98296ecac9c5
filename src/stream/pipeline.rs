//! Producer side: model chunks in, wire lines out.

use super::segmenter::{ MarkerPair, Segment, SegmentKind, Segmenter };
use super::wire::{ FinishMessage, FinishReason, FinishStep, Usage, WireEncoder };
use crate::llm::chat::ModelChunk;
use bytes::Bytes;
use futures::{ Stream, StreamExt };
use log::{ info, warn };
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("upstream model error: {0}")]
    Upstream(String),
    #[error("stream timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport closed by the receiver")]
    TransportClosed,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub markers: MarkerPair,
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            markers: MarkerPair::default(),
            timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub reasoning_fragments: usize,
    pub answer_fragments: usize,
    pub usage: Usage,
    pub elapsed: Duration,
}

/// Drives one exchange: segments `source`, writes each fragment to `tx` as
/// soon as it is known, then closes with the `e` and `d` markers.
///
/// On an upstream error or timeout the segmenter is flushed and the end
/// markers still go out (with `finishReason` set accordingly) before the error
/// is returned. The source is dropped before returning, which closes the
/// model connection.
pub async fn stream_response<S, E>(
    mut source: S,
    config: &PipelineConfig,
    message_id: &str,
    tx: mpsc::Sender<Bytes>
) -> Result<StreamSummary, PipelineError>
    where S: Stream<Item = Result<ModelChunk, E>> + Unpin, E: Display
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut segmenter = Segmenter::new(config.markers.clone());
    let mut writer = LineWriter::new(tx, started);
    let mut usage = Usage::default();

    let outcome: Result<(), PipelineError> = loop {
        let next = match tokio::time::timeout_at(deadline, source.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!("Model stream for {} timed out after {:?}", message_id, config.timeout);
                break Err(PipelineError::Timeout(config.timeout));
            }
        };
        match next {
            None => {
                break Ok(());
            }
            Some(Ok(ModelChunk::Text(text))) => {
                if let Err(e) = writer.write_segments(segmenter.feed(&text)).await {
                    break Err(e);
                }
            }
            Some(Ok(ModelChunk::Usage(u))) => {
                usage = u;
            }
            Some(Err(e)) => {
                warn!("Model stream for {} failed: {}", message_id, e);
                break Err(PipelineError::Upstream(e.to_string()));
            }
        }
    };
    drop(source);

    if outcome == Err(PipelineError::TransportClosed) {
        info!("Client went away during {}; abandoning stream", message_id);
        return Err(PipelineError::TransportClosed);
    }

    writer.write_segments(segmenter.flush()).await?;

    let (finish_reason, error) = match &outcome {
        Ok(()) => (FinishReason::Stop, None),
        Err(e @ PipelineError::Timeout(_)) => (FinishReason::Timeout, Some(e.to_string())),
        Err(e) => (FinishReason::Error, Some(e.to_string())),
    };
    let elapsed = started.elapsed();
    writer.write_finish(
        &FinishStep { finish_reason, usage, is_continued: false, error },
        &FinishMessage {
            finish_reason,
            usage,
            latency_ms: elapsed.as_millis() as u64,
            message_id: message_id.to_string(),
        }
    ).await?;

    info!(
        "Stream {} complete: {:.3}s total, {} reasoning / {} answer fragments, {} lines",
        message_id,
        elapsed.as_secs_f64(),
        writer.reasoning_fragments,
        writer.answer_fragments,
        writer.encoder.lines()
    );

    outcome.map(|()| StreamSummary {
        reasoning_fragments: writer.reasoning_fragments,
        answer_fragments: writer.answer_fragments,
        usage,
        elapsed,
    })
}

struct LineWriter {
    tx: mpsc::Sender<Bytes>,
    encoder: WireEncoder,
    started: Instant,
    reasoning_fragments: usize,
    answer_fragments: usize,
}

impl LineWriter {
    fn new(tx: mpsc::Sender<Bytes>, started: Instant) -> Self {
        Self {
            tx,
            encoder: WireEncoder::new(),
            started,
            reasoning_fragments: 0,
            answer_fragments: 0,
        }
    }

    async fn write_segments(
        &mut self,
        segments: Vec<Segment>
    ) -> Result<(), PipelineError> {
        for segment in segments {
            let counter = match segment.kind {
                SegmentKind::Reasoning => &mut self.reasoning_fragments,
                SegmentKind::Answer => &mut self.answer_fragments,
            };
            if *counter == 0 {
                info!(
                    "First {:?} fragment at +{:.3}s",
                    segment.kind,
                    self.started.elapsed().as_secs_f64()
                );
            }
            *counter += 1;
            let line = self.encoder.encode_segment(&segment);
            self.send(line).await?;
        }
        Ok(())
    }

    async fn write_finish(
        &mut self,
        step: &FinishStep,
        message: &FinishMessage
    ) -> Result<(), PipelineError> {
        let step_line = self.encoder.encode_finish_step(step);
        self.send(step_line).await?;
        let message_line = self.encoder.encode_finish_message(message);
        self.send(message_line).await
    }

    async fn send(&self, line: String) -> Result<(), PipelineError> {
        self.tx.send(Bytes::from(line)).await.map_err(|_| PipelineError::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::wire::{ PartType, WireDecoder };
    use futures::stream;
    use std::pin::Pin;
    use std::sync::atomic::{ AtomicBool, Ordering };
    use std::sync::Arc;
    use std::task::{ Context, Poll };

    /// Sends one chunk, then goes quiet like a stalled model. Records when it
    /// is dropped.
    struct StalledModel {
        sent: bool,
        dropped: Arc<AtomicBool>,
    }

    impl StalledModel {
        fn new() -> (Self, Arc<AtomicBool>) {
            let dropped = Arc::new(AtomicBool::new(false));
            (Self { sent: false, dropped: dropped.clone() }, dropped)
        }
    }

    impl Stream for StalledModel {
        type Item = Result<ModelChunk, String>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            if self.sent {
                return Poll::Pending;
            }
            self.sent = true;
            Poll::Ready(Some(Ok(ModelChunk::Text("partial answer".to_string()))))
        }
    }

    impl Drop for StalledModel {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = rx.recv().await {
            out.extend_from_slice(&b);
        }
        out
    }

    fn text(s: &str) -> Result<ModelChunk, String> {
        Ok(ModelChunk::Text(s.to_string()))
    }

    #[tokio::test]
    async fn streams_fragments_in_order_and_closes() {
        let source = stream::iter(vec![
            text("<thi"),
            text("nk>compute 2+2"),
            text("</think>The answer is 4."),
            Ok(ModelChunk::Usage(Usage { prompt_tokens: 4, completion_tokens: 9 })),
        ]);
        let (tx, mut rx) = mpsc::channel(64);
        let summary = stream_response(source, &PipelineConfig::default(), "m1", tx).await.unwrap();
        assert_eq!(summary.reasoning_fragments, 1);
        assert_eq!(summary.answer_fragments, 1);
        assert_eq!(summary.usage.completion_tokens, 9);

        let wire = String::from_utf8(collect(&mut rx).await).unwrap();
        let lines: Vec<&str> = wire.lines().collect();
        assert_eq!(lines[0], "g\"compute 2+2\"");
        assert_eq!(lines[1], "0\"The answer is 4.\"");
        assert!(lines[2].starts_with("e{"));
        assert!(lines[3].starts_with("d{"));
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn upstream_error_flushes_before_propagating() {
        let source = stream::iter(vec![text("<think>half a thought </th"), Err("connection reset".to_string())]);
        let (tx, mut rx) = mpsc::channel(64);
        let err = stream_response(source, &PipelineConfig::default(), "m2", tx).await.unwrap_err();
        assert_eq!(err, PipelineError::Upstream("connection reset".into()));

        let bytes = collect(&mut rx).await;
        let mut decoder = WireDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.parts()[0].text, "half a thought </th");
        let meta = decoder.finish_metadata().unwrap();
        assert_eq!(meta["finishReason"], "error");
        assert_eq!(meta["messageId"], "m2");
    }

    #[tokio::test]
    async fn timeout_cancels_and_reports() {
        let head = stream::iter(vec![text("partial answer")]);
        let source = head.chain(stream::pending());
        let config = PipelineConfig { timeout: Duration::from_millis(50), ..PipelineConfig::default() };
        let (tx, mut rx) = mpsc::channel(64);
        let err = stream_response(Box::pin(source), &config, "m3", tx).await.unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(50)));

        let bytes = collect(&mut rx).await;
        let mut decoder = WireDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.parts()[0].part_type, PartType::Text);
        assert_eq!(decoder.parts()[0].text, "partial answer");
        assert_eq!(decoder.finish_metadata().unwrap()["finishReason"], "timeout");
    }

    #[tokio::test]
    async fn timeout_releases_the_model_stream() {
        let (source, dropped) = StalledModel::new();
        let config = PipelineConfig { timeout: Duration::from_millis(50), ..PipelineConfig::default() };
        let (tx, mut rx) = mpsc::channel(64);
        let err = stream_response(source, &config, "m5", tx).await.unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(50)));
        assert!(dropped.load(Ordering::SeqCst));

        let mut decoder = WireDecoder::new();
        decoder.feed(&collect(&mut rx).await);
        assert_eq!(decoder.parts()[0].text, "partial answer");
    }

    #[tokio::test]
    async fn departed_client_releases_the_model_stream() {
        let (source, dropped) = StalledModel::new();
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let err = stream_response(source, &PipelineConfig::default(), "m6", tx).await.unwrap_err();
        assert_eq!(err, PipelineError::TransportClosed);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stops_when_receiver_is_gone() {
        let source = stream::iter(vec![text("a"), text("b")]);
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let err = stream_response(source, &PipelineConfig::default(), "m4", tx).await.unwrap_err();
        assert_eq!(err, PipelineError::TransportClosed);
    }
}
