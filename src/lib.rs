//! # Streaming Engine
//!
//! The core of an adaptive media streaming engine: it ingests a manifest
//! describing a timeline of periods, variants and text streams, and
//! continuously fetches, optionally transforms (decrypt, transmux), and
//! appends media segments to keep per-track buffers filled ahead of the
//! playhead, over an MSE-style append-buffer sink.
//!
//! ## Structure
//!
//! - [`engine::StreamingEngine`]: per-track scheduling. Segment
//!   selection, abortable fetches, variant/text switches, seeks, trick
//!   play, eviction, live-window handling, end-of-stream detection and
//!   the failure policy.
//! - [`media_source::MediaSourceEngine`]: serialized per-track
//!   operation queues over the append sink, init-segment de-duplication,
//!   append-window management, `emsg`/`prft` parsing, embedded-caption
//!   and metadata dispatch.
//!
//! The transport, the manifest parser, the ABR algorithm, the caption
//! decoder and the transmuxer are consumed as capabilities; see
//! [`net::Networking`], [`media_source::MediaSink`], [`events`],
//! [`captions::ClosedCaptionParser`] and [`transmux::Transmuxer`].
//!
//! ## Usage
//!
//! ```ignore
//! let mse = Arc::new(MediaSourceEngine::new(sink, event_bus));
//! let engine = StreamingEngine::new(
//!     manifest, timeline, StreamingConfig::default(),
//!     networking, owner, mse, Arc::new(SoftwareCrypto), Some(text_sink),
//! );
//! engine.start(initial_variant, initial_text).await?;
//! // ... switch_variant / seeked / set_trick_play as playback proceeds
//! engine.destroy().await;
//! ```

pub mod boxes;
pub mod captions;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod manifest;
pub mod media_source;
pub mod metadata;
pub mod net;
pub mod prefetch;
pub mod timeline;
pub mod transmux;

#[cfg(test)]
pub(crate) mod tests;

pub use config::{CrossBoundaryStrategy, RetryParameters, StreamingConfig};
pub use engine::{EngineOwner, StreamingEngine};
pub use error::{Category, Code, Result, Severity, StreamingError};
pub use manifest::{
    AesKey, AesMethod, ContentType, InitSegmentReference, Manifest, ManifestStream, ManifestType,
    Period, SegmentIndex, SegmentReference, Stream, Variant,
};
pub use media_source::{MediaSink, MediaSourceEngine, SinkError};
pub use timeline::PresentationTimeline;
