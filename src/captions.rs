//! Embedded caption extraction
//!
//! CEA-608/708 captions ride inside H.264/H.265 video segments. The
//! decoder itself is a capability ([`ClosedCaptionParser`]); the
//! [`CaptionExtractor`] owns channel selection and forwards the selected
//! channel's cues to the text sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::TextSink;

/// One rendered caption cue.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start_time: f64,
    pub end_time: f64,
    pub payload: String,
}

/// A cue tagged with the caption channel it came from (e.g. "CC1").
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionPacket {
    pub channel: String,
    pub cue: Cue,
}

/// The caption decoder capability.
///
/// Implementations carry decoder state across segments; `reset` drops it
/// (used after seeks, never after plain stream switches).
pub trait ClosedCaptionParser: Send + Sync {
    /// Feed an init segment so the parser learns the track layout.
    fn init(&self, init_segment: &[u8]);

    /// Extract caption packets from one media segment.
    fn parse(&self, media_segment: &[u8]) -> Vec<CaptionPacket>;

    /// Drop accumulated decoder state.
    fn reset(&self);
}

/// Demuxes embedded captions and forwards the selected channel.
pub struct CaptionExtractor {
    parser: Arc<dyn ClosedCaptionParser>,
    text_sink: Arc<dyn TextSink>,
    selected_channel: Mutex<Option<String>>,
}

impl CaptionExtractor {
    pub fn new(parser: Arc<dyn ClosedCaptionParser>, text_sink: Arc<dyn TextSink>) -> Self {
        Self {
            parser,
            text_sink,
            selected_channel: Mutex::new(None),
        }
    }

    /// Select which caption channel reaches the text sink; `None`
    /// disables forwarding but keeps the decoder warm.
    pub fn set_selected_channel(&self, channel: Option<String>) {
        *self.selected_channel.lock() = channel;
    }

    pub fn selected_channel(&self) -> Option<String> {
        self.selected_channel.lock().clone()
    }

    pub fn on_init_segment(&self, data: &[u8]) {
        self.parser.init(data);
    }

    /// Parse a media segment and forward cues of the selected channel.
    pub fn on_media_segment(&self, data: &[u8]) {
        if self.selected_channel.lock().is_none() {
            return;
        }
        let packets = self.parser.parse(data);
        self.forward_packets(packets);
    }

    /// Forward already-demuxed packets (e.g. from a transmux pass),
    /// filtered to the selected channel.
    pub fn forward_packets(&self, packets: Vec<CaptionPacket>) {
        let selected = self.selected_channel.lock().clone();
        let Some(selected) = selected else {
            return;
        };
        let cues: Vec<Cue> = packets
            .into_iter()
            .filter(|p| p.channel == selected)
            .map(|p| p.cue)
            .collect();
        if !cues.is_empty() {
            tracing::debug!(channel = %selected, count = cues.len(), "forwarding embedded captions");
            self.text_sink.append(cues);
        }
    }

    /// Drop decoder state (after a seek).
    pub fn reset(&self) {
        self.parser.reset();
    }
}
