// Streaming response protocol.
//
// model text -> Segmenter -> WireEncoder -> transport -> WireDecoder -> parts
// and, per finished answer part, the tolerant ActionExtractor.

pub mod action;
pub mod line;
pub mod pipeline;
pub mod segmenter;
pub mod wire;

pub use action::{ ActionExtractor, ActionFields, ActionPayload };
pub use pipeline::{ stream_response, PipelineConfig, PipelineError, StreamSummary };
pub use segmenter::{ MarkerPair, Segment, SegmentKind, Segmenter };
pub use wire::{ Part, PartType, WireDecoder, WireEncoder };
