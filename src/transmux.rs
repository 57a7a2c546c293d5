//! Transmuxer capability
//!
//! When the sink cannot natively ingest a stream's container (TS, raw
//! AAC), the engine routes segment bytes through a transmuxer between
//! decryption and append. The conversion itself is external; the engine
//! only forwards its outputs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::captions::CaptionPacket;
use crate::error::Result;
use crate::events::MetadataFrame;
use crate::manifest::{ContentType, SegmentReference};

/// What a transmux pass produced.
pub struct TransmuxOutput {
    /// Converted media bytes in a sink-ingestible container.
    pub data: Bytes,
    /// Captions the transmuxer demuxed along the way, fully formed.
    pub captions: Vec<CaptionPacket>,
    /// Timed metadata demuxed along the way (e.g. TS ID3).
    pub metadata: Vec<MetadataFrame>,
}

/// The transmuxer capability.
#[async_trait]
pub trait Transmuxer: Send + Sync {
    /// Whether `input_mime` must be converted before the sink (whose
    /// native types are `sink_mimes`) can ingest it.
    fn needs_transmux(&self, input_mime: &str, sink_mimes: &[String]) -> bool;

    /// Convert one segment.
    async fn transmux(
        &self,
        data: Bytes,
        reference: Option<&SegmentReference>,
        duration: f64,
        content_type: ContentType,
    ) -> Result<TransmuxOutput>;
}

/// Decide whether bytes must pass through the transmuxer.
pub fn should_transmux(
    transmuxer: Option<&Arc<dyn Transmuxer>>,
    input_mime: &str,
    sink_mimes: &[String],
    force: bool,
) -> bool {
    match transmuxer {
        Some(t) => force || t.needs_transmux(input_mime, sink_mimes),
        None => false,
    }
}
