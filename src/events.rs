//! Engine events and consumer-side sinks
//!
//! The engine reports inband events, appends and timed metadata through
//! capability handles the owner installs. None of these calls may block;
//! heavy consumers should hand off to their own tasks.

use chrono::{DateTime, Utc};

use crate::captions::Cue;
use crate::manifest::ContentType;
pub use crate::metadata::{MetadataFrame, MetadataValue};

/// An `emsg` event resolved into presentation time.
#[derive(Debug, Clone)]
pub struct EmsgEvent {
    pub scheme_id_uri: String,
    pub value: String,
    pub start_time: f64,
    pub end_time: f64,
    pub timescale: u32,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: bytes::Bytes,
}

/// Producer reference time resolved to wall clock.
#[derive(Debug, Clone)]
pub struct ProgramDateEvent {
    /// Wall-clock time of the reference point, Unix milliseconds.
    pub wall_clock_time_ms: f64,
    /// Wall-clock date at which media time zero played out.
    pub program_start_date: DateTime<Utc>,
}

/// Events the engine emits.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An inband event message in a registered scheme.
    Emsg(EmsgEvent),
    /// First `prft` box of the session (when enabled).
    ProgramDate(ProgramDateEvent),
    /// An inband signal requested a manifest refresh.
    ManifestUpdate,
    /// A media segment finished appending.
    SegmentAppended {
        content_type: ContentType,
        start_time: f64,
        end_time: f64,
        is_muxed: bool,
    },
    /// An init segment finished appending.
    InitSegmentAppended {
        content_type: ContentType,
    },
}

/// The event bus the owner installs.
pub trait EventBus: Send + Sync {
    /// Deliver an event. Returning `true` marks the event handled and
    /// suppresses the engine's default action (e.g. ID3 decode of an
    /// emsg payload).
    fn on_event(&self, event: &EngineEvent) -> bool;
}

/// A bus that drops everything.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn on_event(&self, _event: &EngineEvent) -> bool {
        false
    }
}

/// Where extracted text cues go.
pub trait TextSink: Send + Sync {
    fn append(&self, cues: Vec<Cue>);
    fn remove(&self, start: f64, end: f64);
    fn is_text_visible(&self) -> bool;
}

/// Where timed metadata goes.
pub trait MetadataSink: Send + Sync {
    fn on_metadata(&self, frames: Vec<MetadataFrame>, start_time: f64, end_time: Option<f64>);
}
