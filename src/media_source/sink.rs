//! The append-buffer sink capability
//!
//! An MSE-style sink: per-track append buffers that ingest container
//! bytes, clip samples to an append window, and report buffered ranges.
//! The platform (browser SourceBuffer, native demuxer, test fake)
//! provides the implementation; [`super::MediaSourceEngine`] owns it
//! exclusively and serializes access per track.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::manifest::ContentType;

/// A closed range of buffered presentation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Sink-side failures.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// The append buffer is full; recoverable after eviction.
    #[error("append-buffer quota exceeded")]
    QuotaExceeded,
    /// Anything else; fatal to the track.
    #[error("sink operation failed: {0}")]
    Failed(String),
}

/// Per-append bookkeeping the sink may use.
#[derive(Debug, Clone, Default)]
pub struct AppendContext {
    /// Append contiguously, ignoring container timestamps.
    pub sequence_mode: bool,
    /// Presentation-time interval the manifest declared for the bytes.
    /// Sinks that trust manifest timing over container timing (and the
    /// test fake) use it; real MSE sinks ignore it.
    pub reference_times: Option<(f64, f64)>,
}

/// The append-buffer sink.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Attach a track for `content_type` with the given full mime type
    /// (`mime; codecs="..."`). Called once per type before any append.
    fn init_track(&self, content_type: ContentType, mime_codecs: &str) -> Result<(), SinkError>;

    /// Mime types this sink ingests natively (transmux targets).
    fn native_mime_types(&self) -> Vec<String>;

    async fn append(
        &self,
        content_type: ContentType,
        data: Bytes,
        context: AppendContext,
    ) -> Result<(), SinkError>;

    /// Remove `[start, end)` of buffered data.
    async fn remove(&self, content_type: ContentType, start: f64, end: f64)
        -> Result<(), SinkError>;

    /// Current buffered ranges, sorted by start time.
    fn buffered(&self, content_type: ContentType) -> Vec<BufferedRange>;

    fn set_timestamp_offset(&self, content_type: ContentType, offset: f64);

    fn set_append_window(&self, content_type: ContentType, start: f64, end: f64);

    /// Change the declared mime/codecs of a track mid-stream.
    fn change_type(&self, content_type: ContentType, mime_codecs: &str);

    fn set_duration(&self, duration: f64);

    fn duration(&self) -> f64;

    /// Signal that no further appends will occur. Idempotent on the
    /// engine side; sinks may assume at most one effective call.
    async fn end_of_stream(&self) -> Result<(), SinkError>;

    /// Drop any sink-internal pipeline state for a track (post-seek).
    async fn flush(&self, content_type: ContentType) -> Result<(), SinkError>;
}

/// First buffered range start, if any.
pub fn buffer_start(ranges: &[BufferedRange]) -> Option<f64> {
    ranges.first().map(|r| r.start)
}

/// Last buffered range end, if any.
pub fn buffer_end(ranges: &[BufferedRange]) -> Option<f64> {
    ranges.last().map(|r| r.end)
}

/// Seconds buffered ahead of `time`, counting only the range containing
/// it (a gap ends the continuous lead).
pub fn buffered_ahead_of(ranges: &[BufferedRange], time: f64) -> f64 {
    // A small tolerance so a playhead sitting exactly on a range edge
    // still counts as inside it.
    const EDGE: f64 = 1e-4;
    for r in ranges {
        if time >= r.start - EDGE && time < r.end {
            return r.end - time.max(r.start);
        }
    }
    0.0
}

/// True when `time` falls inside a buffered range.
pub fn is_buffered(ranges: &[BufferedRange], time: f64) -> bool {
    buffered_ahead_of(ranges, time) > 0.0
}
