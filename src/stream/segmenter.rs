use serde::{ Deserialize, Serialize };
use thiserror::Error;

pub const DEFAULT_OPEN_MARKER: &str = "<think>";
pub const DEFAULT_CLOSE_MARKER: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Reasoning,
    Answer,
}

/// A run of model text of a single kind.
///
/// Segments returned by [`Segmenter::feed`] are incremental: each carries only
/// the text that arrived since the previous call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    pub fn new(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(SegmentKind::Reasoning, text)
    }

    pub fn answer(text: impl Into<String>) -> Self {
        Self::new(SegmentKind::Answer, text)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkerError {
    #[error("reasoning markers must not be empty")]
    Empty,
    #[error("open and close reasoning markers must differ (both '{0}')")]
    Identical(String),
}

/// Literal strings that open and close a reasoning block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPair {
    open: String,
    close: String,
}

impl MarkerPair {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Result<Self, MarkerError> {
        let open = open.into();
        let close = close.into();
        if open.is_empty() || close.is_empty() {
            return Err(MarkerError::Empty);
        }
        if open == close {
            return Err(MarkerError::Identical(open));
        }
        Ok(Self { open, close })
    }

    pub fn open(&self) -> &str {
        &self.open
    }

    pub fn close(&self) -> &str {
        &self.close
    }
}

impl Default for MarkerPair {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN_MARKER.to_string(),
            close: DEFAULT_CLOSE_MARKER.to_string(),
        }
    }
}

/// Splits incremental model output into reasoning and answer segments.
///
/// Text outside a marker pair is answer text, text inside is reasoning.
/// Markers may be split across any number of chunks: after each chunk the
/// longest tail that could still start the next marker (at most
/// `marker.len() - 1` bytes) is held back and joined with the next chunk.
#[derive(Debug)]
pub struct Segmenter {
    markers: MarkerPair,
    inside: bool,
    lookback: String,
}

impl Segmenter {
    pub fn new(markers: MarkerPair) -> Self {
        Self {
            markers,
            inside: false,
            lookback: String::new(),
        }
    }

    pub fn kind(&self) -> SegmentKind {
        if self.inside { SegmentKind::Reasoning } else { SegmentKind::Answer }
    }

    /// Consumes one raw chunk and returns the segments it completed or
    /// extended, in arrival order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Segment> {
        let mut text = std::mem::take(&mut self.lookback);
        text.push_str(chunk);

        let mut out = Vec::new();
        let mut cursor = 0;
        loop {
            let marker = if self.inside { self.markers.close.as_str() } else { self.markers.open.as_str() };
            let rest = &text[cursor..];
            match rest.find(marker) {
                Some(pos) => {
                    push_text(&mut out, self.kind(), &rest[..pos]);
                    cursor += pos + marker.len();
                    self.inside = !self.inside;
                }
                None => {
                    let held = partial_marker_len(rest, marker);
                    let emit_to = rest.len() - held;
                    push_text(&mut out, self.kind(), &rest[..emit_to]);
                    self.lookback = rest[emit_to..].to_string();
                    break;
                }
            }
        }
        out
    }

    /// Emits any held-back text at end of stream.
    ///
    /// A marker prefix still sitting in the lookback never completed, so it is
    /// emitted as ordinary text of the current kind. Unterminated reasoning
    /// stays reasoning.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.lookback);
        push_text(&mut out, self.kind(), &rest);
        out
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(MarkerPair::default())
    }
}

fn push_text(out: &mut Vec<Segment>, kind: SegmentKind, text: &str) {
    if text.is_empty() {
        return;
    }
    match out.last_mut() {
        Some(last) if last.kind == kind => last.text.push_str(text),
        _ => out.push(Segment::new(kind, text)),
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&n| {
            let start = text.len() - n;
            text.is_char_boundary(start) && marker.starts_with(&text[start..])
        })
        .unwrap_or(0)
}
