//! Per-track pipeline state
//!
//! One [`TrackCell`] exists per active content type. The cell holds the
//! mutable pipeline state behind a mutex; the scheduling loop in the
//! engine drives it:
//!
//! ```text
//!   Idle --pick-next--> Fetching --bytes-ready--> Processing --queue-append--> Appending
//!    ^                      |                          |                          |
//!    |                      v (abort on switch)        v (failure)               |
//!    +--- Waiting (cleared buffer, seeked, disabled) <-+------------------------ +
//! ```

use std::sync::Arc;

use tokio::sync::Notify;

use crate::manifest::{ContentType, SegmentReference, Stream};
use crate::net::AbortHandle;

/// Stream properties the sink has last been configured with. A reference
/// whose properties differ marks a period transition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamProps {
    pub timestamp_offset: f64,
    pub append_window_start: f64,
    pub append_window_end: f64,
}

impl StreamProps {
    pub fn of(reference: &SegmentReference) -> Self {
        Self {
            timestamp_offset: reference.timestamp_offset,
            append_window_start: reference.append_window_start,
            append_window_end: reference.append_window_end,
        }
    }
}

/// Why a clear was requested. A seek-triggered clear of the video track
/// also resets the caption decoder; switch-triggered clears never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClearTrigger {
    Seek,
    Switch,
}

/// Mutable per-track pipeline state.
pub(crate) struct TrackState {
    pub stream: Arc<dyn Stream>,
    /// The last media reference appended, anchor for sequential advance.
    pub last_reference: Option<Arc<SegmentReference>>,
    /// Sink properties currently applied for this track.
    pub applied_props: Option<StreamProps>,
    pub end_of_stream: bool,
    pub waiting_to_clear_buffer: bool,
    pub clear_safe_margin: f64,
    pub clear_flush: bool,
    pub clear_trigger: ClearTrigger,
    pub clearing_buffer: bool,
    /// A fetch/append cycle is running.
    pub performing_update: bool,
    /// Playhead jumped; the next append resets the caption decoder.
    pub seeked: bool,
    /// Abortable handle of the in-flight fetch.
    pub in_flight: Option<AbortHandle>,
    /// Consecutive quota failures on the current reference.
    pub quota_attempts: u32,
    /// Scale applied to the buffering goal after quota pressure.
    pub buffering_goal_scale: f64,
    /// Consecutive "reference missing" retries (live window).
    pub missing_retries: u32,
    /// Presentation-clock time until which this track's stream is
    /// disabled after repeated failures.
    pub disabled_until: Option<f64>,
    /// The loop observed destroy and exited.
    pub stopped: bool,
}

impl TrackState {
    pub fn new(stream: Arc<dyn Stream>) -> Self {
        Self {
            stream,
            last_reference: None,
            applied_props: None,
            end_of_stream: false,
            waiting_to_clear_buffer: false,
            clear_safe_margin: 0.0,
            clear_flush: false,
            clear_trigger: ClearTrigger::Seek,
            clearing_buffer: false,
            performing_update: false,
            seeked: false,
            in_flight: None,
            quota_attempts: 0,
            buffering_goal_scale: 1.0,
            missing_retries: 0,
            disabled_until: None,
            stopped: false,
        }
    }

    /// Forget append continuity (after a clear).
    pub fn reset_continuity(&mut self) {
        self.last_reference = None;
        self.applied_props = None;
        self.end_of_stream = false;
        self.quota_attempts = 0;
        self.missing_retries = 0;
    }
}

/// One active track: state plus its wakeup handle.
pub(crate) struct TrackCell {
    pub content_type: ContentType,
    pub state: parking_lot::Mutex<TrackState>,
    pub notify: Notify,
}

impl TrackCell {
    pub fn new(content_type: ContentType, stream: Arc<dyn Stream>) -> Self {
        Self {
            content_type,
            state: parking_lot::Mutex::new(TrackState::new(stream)),
            notify: Notify::new(),
        }
    }

    pub fn wake(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// New segments larger than this are let through without aborting the
/// in-flight request when sizes are only partially known, bytes.
const ABORT_LARGE_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Whether replacing the active stream should abort the in-flight fetch.
///
/// Aborting is worth it only when fetching the replacement (plus its
/// init segment, if different) costs less than finishing the download in
/// progress. With both sizes known that is a straight comparison; an
/// unknown remaining size defaults to abort, while an unknown or very
/// large replacement cost defaults to letting the in-flight complete.
pub(crate) fn should_abort_in_flight(
    bytes_remaining: Option<u64>,
    new_segment_bytes: Option<u64>,
    clearing_buffer: bool,
) -> bool {
    if clearing_buffer {
        // The result would be thrown away with the buffer.
        return true;
    }
    match (bytes_remaining, new_segment_bytes) {
        (Some(remaining), Some(new_bytes)) => new_bytes < remaining,
        (None, Some(new_bytes)) => new_bytes <= ABORT_LARGE_THRESHOLD,
        (Some(_), None) | (None, None) => true,
    }
}

/// Byte cost of fetching `reference` plus its init segment when that
/// init differs from the one already appended.
pub(crate) fn estimated_fetch_bytes(
    reference: &SegmentReference,
    init_needed: bool,
) -> Option<u64> {
    let media = reference.end_byte.map(|end| end + 1 - reference.start_byte)?;
    if !init_needed {
        return Some(media);
    }
    let init = reference.init_segment.as_ref()?;
    let init_bytes = init.end_byte.map(|end| end + 1 - init.start_byte)?;
    Some(media + init_bytes)
}
