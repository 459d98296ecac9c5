//! Line-oriented transport format.
//!
//! Every record is `<tag><json>\n`. Text records (`0` answer, `g` reasoning)
//! carry a JSON string holding only the new text; `e` and `d` close the
//! stream with a metadata object that is passed through untouched.

use super::line::LineBuffer;
use super::segmenter::{ Segment, SegmentKind };
use log::{ debug, warn };
use serde::{ Deserialize, Serialize };
use serde_json::Value;

pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const DATA_STREAM_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTag {
    Text,
    Reasoning,
    FinishStep,
    FinishMessage,
}

impl WireTag {
    pub fn as_char(self) -> char {
        match self {
            WireTag::Text => '0',
            WireTag::Reasoning => 'g',
            WireTag::FinishStep => 'e',
            WireTag::FinishMessage => 'd',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(WireTag::Text),
            'g' => Some(WireTag::Reasoning),
            'e' => Some(WireTag::FinishStep),
            'd' => Some(WireTag::FinishMessage),
            _ => None,
        }
    }
}

impl From<SegmentKind> for WireTag {
    fn from(kind: SegmentKind) -> Self {
        match kind {
            SegmentKind::Answer => WireTag::Text,
            SegmentKind::Reasoning => WireTag::Reasoning,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Timeout,
    Error,
}

/// Payload of the `e` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishStep {
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub is_continued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of the `d` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishMessage {
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub latency_ms: u64,
    pub message_id: String,
}

/// Serializes segment fragments, one line per fragment.
#[derive(Debug, Default)]
pub struct WireEncoder {
    lines: usize,
}

impl WireEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_segment(&mut self, segment: &Segment) -> String {
        self.encode(WireTag::from(segment.kind), Value::String(segment.text.clone()))
    }

    pub fn encode_finish_step(&mut self, step: &FinishStep) -> String {
        self.encode(WireTag::FinishStep, to_value(step))
    }

    pub fn encode_finish_message(&mut self, message: &FinishMessage) -> String {
        self.encode(WireTag::FinishMessage, to_value(message))
    }

    /// Number of lines produced so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    fn encode(&mut self, tag: WireTag, payload: Value) -> String {
        self.lines += 1;
        format!("{}{}\n", tag.as_char(), payload)
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    // Plain structs of strings, enums and integers always serialize.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartType {
    Reasoning,
    Text,
}

/// Client-side reconstruction of one or more consecutive segments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Part {
    #[serde(rename = "type")]
    pub part_type: PartType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Part {
    pub fn new(part_type: PartType, text: impl Into<String>) -> Self {
        Self { part_type, text: text.into(), metadata: None }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(PartType::Reasoning, text)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(PartType::Text, text)
    }
}

/// Rebuilds [`Part`]s from a byte stream of wire lines.
#[derive(Debug, Default)]
pub struct WireDecoder {
    lines: LineBuffer,
    parts: Vec<Part>,
    open: bool,
    finish: Option<Value>,
    dropped: usize,
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network read and returns every part decoded so far. The last
    /// part may still grow on later reads while [`is_open`](Self::is_open).
    pub fn feed(&mut self, bytes: &[u8]) -> &[Part] {
        self.lines.push(bytes);
        while let Some(line) = self.lines.next_line() {
            match line {
                Ok(line) => self.decode_line(&line),
                Err(e) => {
                    warn!("Dropping wire line: {}", e);
                    self.dropped += 1;
                }
            }
        }
        &self.parts
    }

    /// Ends decoding. A trailing line without its newline was never completed
    /// and is discarded.
    pub fn finish(&mut self) -> &[Part] {
        let rest = self.lines.take_remainder();
        let incomplete = match &rest {
            Some(Ok(rest)) => !rest.trim().is_empty(),
            Some(Err(_)) => true,
            None => false,
        };
        if incomplete {
            warn!("Discarding incomplete wire line at end of stream");
            self.dropped += 1;
        }
        self.open = false;
        &self.parts
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Merged metadata of every end marker seen.
    pub fn finish_metadata(&self) -> Option<&Value> {
        self.finish.as_ref()
    }

    /// Number of complete lines that could not be decoded.
    pub fn dropped_lines(&self) -> usize {
        self.dropped
    }

    fn decode_line(&mut self, line: &str) {
        let mut chars = line.chars();
        let tag_char = match chars.next() {
            Some(c) => c,
            None => return,
        };
        let payload = chars.as_str();
        let tag = match WireTag::from_char(tag_char) {
            Some(tag) => tag,
            None => {
                debug!("Ignoring wire line with unknown tag '{}'", tag_char);
                return;
            }
        };

        match tag {
            WireTag::Text | WireTag::Reasoning => {
                match serde_json::from_str::<String>(payload) {
                    Ok(text) => {
                        let part_type = if tag == WireTag::Text { PartType::Text } else { PartType::Reasoning };
                        self.append(part_type, text);
                    }
                    Err(e) => {
                        warn!("Dropping malformed '{}' wire line: {}", tag_char, e);
                        self.dropped += 1;
                    }
                }
            }
            WireTag::FinishStep | WireTag::FinishMessage => {
                match serde_json::from_str::<Value>(payload) {
                    Ok(meta) => self.close(meta),
                    Err(e) => {
                        warn!("Dropping malformed '{}' end marker: {}", tag_char, e);
                        self.dropped += 1;
                    }
                }
            }
        }
    }

    fn append(&mut self, part_type: PartType, text: String) {
        if text.is_empty() {
            return;
        }
        if self.open {
            if let Some(last) = self.parts.last_mut() {
                if last.part_type == part_type {
                    last.text.push_str(&text);
                    return;
                }
            }
        }
        self.parts.push(Part::new(part_type, text));
        self.open = true;
    }

    fn close(&mut self, meta: Value) {
        self.open = false;
        if let Some(last) = self.parts.last_mut() {
            merge_metadata(&mut last.metadata, meta.clone());
        }
        merge_metadata(&mut self.finish, meta);
    }
}

fn merge_metadata(slot: &mut Option<Value>, meta: Value) {
    match (slot.as_mut(), meta) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => existing.extend(incoming),
        (_, meta) => *slot = Some(meta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_all(segments: &[Segment]) -> String {
        let mut encoder = WireEncoder::new();
        segments.iter().map(|s| encoder.encode_segment(s)).collect()
    }

    #[test]
    fn encodes_tag_and_escaped_text() {
        let mut encoder = WireEncoder::new();
        let line = encoder.encode_segment(&Segment::answer("say \"hi\"\n\\beta"));
        assert_eq!(line, "0\"say \\\"hi\\\"\\n\\\\beta\"\n");
        let line = encoder.encode_segment(&Segment::reasoning("hmm"));
        assert_eq!(line, "g\"hmm\"\n");
        assert_eq!(encoder.lines(), 2);
    }

    #[test]
    fn finish_records_use_camel_case() {
        let mut encoder = WireEncoder::new();
        let line = encoder.encode_finish_step(&FinishStep {
            finish_reason: FinishReason::Stop,
            usage: Usage { prompt_tokens: 3, completion_tokens: 5 },
            is_continued: false,
            error: None,
        });
        assert!(line.starts_with('e'));
        let value: Value = serde_json::from_str(line[1..].trim_end()).unwrap();
        assert_eq!(
            value,
            json!({
                "finishReason": "stop",
                "usage": {"promptTokens": 3, "completionTokens": 5},
                "isContinued": false
            })
        );
    }

    #[test]
    fn merges_consecutive_lines_of_same_kind() {
        let wire = encode_all(&[
            Segment::reasoning("a"),
            Segment::reasoning("b"),
            Segment::answer("c"),
            Segment::answer("d"),
        ]);
        let mut decoder = WireDecoder::new();
        let parts = decoder.feed(wire.as_bytes()).to_vec();
        assert_eq!(parts, vec![Part::reasoning("ab"), Part::text("cd")]);
        assert!(decoder.is_open());
    }

    #[test]
    fn round_trips_under_every_byte_split() {
        let segments = vec![
            Segment::reasoning("think é \"quoted\" \\frac"),
            Segment::answer("line1\nline2 ∂"),
            Segment::reasoning("again"),
            Segment::answer("{\"action\":\"chat\"}"),
        ];
        let wire = encode_all(&segments);
        let bytes = wire.as_bytes();
        let expected: Vec<Part> = vec![
            Part::reasoning("think é \"quoted\" \\frac"),
            Part::text("line1\nline2 ∂"),
            Part::reasoning("again"),
            Part::text("{\"action\":\"chat\"}"),
        ];
        for split in 0..=bytes.len() {
            let mut decoder = WireDecoder::new();
            decoder.feed(&bytes[..split]);
            decoder.feed(&bytes[split..]);
            assert_eq!(decoder.finish(), expected.as_slice(), "split at {}", split);
        }
        let mut decoder = WireDecoder::new();
        for b in bytes {
            decoder.feed(std::slice::from_ref(b));
        }
        assert_eq!(decoder.finish(), expected.as_slice());
    }

    #[test]
    fn end_markers_close_and_attach_metadata() {
        let wire = "0\"hi\"\ne{\"finishReason\":\"stop\"}\nd{\"messageId\":\"m1\"}\n0\"more\"\n";
        let mut decoder = WireDecoder::new();
        let parts = decoder.feed(wire.as_bytes()).to_vec();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].metadata, Some(json!({"finishReason": "stop", "messageId": "m1"})));
        assert_eq!(parts[1], Part::text("more"));
        assert_eq!(decoder.finish_metadata(), Some(&json!({"finishReason": "stop", "messageId": "m1"})));
    }

    #[test]
    fn drops_bad_lines_and_ignores_unknown_tags() {
        let wire = "0\"ok\"\n0\"broken\n9\"future\"\n0\" then\"\n";
        let mut decoder = WireDecoder::new();
        decoder.feed(wire.as_bytes());
        assert_eq!(decoder.parts(), &[Part::text("ok then")]);
        assert_eq!(decoder.dropped_lines(), 1);
    }

    #[test]
    fn drops_lines_that_are_not_utf8() {
        let mut decoder = WireDecoder::new();
        decoder.feed(b"0\"caf\xe9\"\n0\"ok\"\n");
        assert_eq!(decoder.parts(), &[Part::text("ok")]);
        assert_eq!(decoder.dropped_lines(), 1);
        assert!(!decoder.parts()[0].text.contains('\u{fffd}'));
    }

    #[test]
    fn finish_discards_unterminated_line() {
        let mut decoder = WireDecoder::new();
        decoder.feed(b"g\"done\"\n0\"never fini");
        let parts = decoder.finish().to_vec();
        assert_eq!(parts, vec![Part::reasoning("done")]);
        assert_eq!(decoder.dropped_lines(), 1);
        assert!(!decoder.is_open());
    }
}
