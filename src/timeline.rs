//! Presentation timeline
//!
//! Tracks duration, the live segment availability window and the seek
//! range. For live presentations the window advances with wall-clock
//! time; VOD reports a fixed duration. The wall clock is injected so
//! tests can drive it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Source of "now" in seconds. Defaults to the system clock.
pub type ClockFn = Arc<dyn Fn() -> f64 + Send + Sync>;

fn system_clock() -> ClockFn {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    })
}

struct TimelineState {
    duration: f64,
    is_live: bool,
    /// Wall-clock seconds at which presentation time 0 started (live).
    presentation_start_time: f64,
    /// Sliding-window size in seconds (live). Infinite for event streams.
    segment_availability_duration: f64,
    /// Offset applied to the local clock to match the server clock, ms.
    clock_offset_ms: f64,
    /// Delay subtracted from the live edge so in-flight segments finish.
    presentation_delay: f64,
    max_segment_duration: f64,
    /// Furthest end time the manifest has declared segments for.
    max_notified_end: f64,
}

/// Dynamic timeline shared by the engine and its owner.
pub struct PresentationTimeline {
    state: RwLock<TimelineState>,
    clock: ClockFn,
}

impl PresentationTimeline {
    /// A fixed-duration VOD timeline.
    pub fn vod(duration: f64) -> Self {
        Self {
            state: RwLock::new(TimelineState {
                duration,
                is_live: false,
                presentation_start_time: 0.0,
                segment_availability_duration: f64::INFINITY,
                clock_offset_ms: 0.0,
                presentation_delay: 0.0,
                max_segment_duration: 1.0,
                max_notified_end: 0.0,
            }),
            clock: system_clock(),
        }
    }

    /// A live timeline whose availability window slides with the clock.
    pub fn live(presentation_start_time: f64, availability_duration: f64) -> Self {
        Self {
            state: RwLock::new(TimelineState {
                duration: f64::INFINITY,
                is_live: true,
                presentation_start_time,
                segment_availability_duration: availability_duration,
                clock_offset_ms: 0.0,
                presentation_delay: 0.0,
                max_segment_duration: 1.0,
                max_notified_end: 0.0,
            }),
            clock: system_clock(),
        }
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    /// Read `now` without touching the state lock; pass the offset from
    /// an already-copied state so no read lock is ever re-entered.
    fn now_with_offset(&self, clock_offset_ms: f64) -> f64 {
        (self.clock)() + clock_offset_ms / 1000.0
    }

    pub fn get_duration(&self) -> f64 {
        self.state.read().duration
    }

    pub fn set_duration(&self, duration: f64) {
        self.state.write().duration = duration;
    }

    pub fn is_live(&self) -> bool {
        self.state.read().is_live
    }

    /// Presentation time of the live edge, before any delay.
    fn live_edge(&self) -> f64 {
        let (start, max_end, offset) = {
            let state = self.state.read();
            (
                state.presentation_start_time,
                state.max_notified_end,
                state.clock_offset_ms,
            )
        };
        let elapsed = self.now_with_offset(offset) - start;
        elapsed.max(max_end)
    }

    /// Earliest presentation time whose segment is still fetchable.
    pub fn get_segment_availability_start(&self) -> f64 {
        let (is_live, availability_duration) = {
            let state = self.state.read();
            (state.is_live, state.segment_availability_duration)
        };
        if !is_live || availability_duration.is_infinite() {
            return 0.0;
        }
        (self.get_segment_availability_end() - availability_duration).max(0.0)
    }

    /// Latest presentation time whose segment is fetchable.
    pub fn get_segment_availability_end(&self) -> f64 {
        let (is_live, duration) = {
            let state = self.state.read();
            (state.is_live, state.duration)
        };
        if !is_live {
            return duration;
        }
        self.live_edge()
    }

    pub fn get_seek_range_start(&self) -> f64 {
        self.get_segment_availability_start()
    }

    pub fn get_seek_range_end(&self) -> f64 {
        let (is_live, duration, delay) = {
            let state = self.state.read();
            (
                state.is_live,
                state.duration,
                state.presentation_delay.max(state.max_segment_duration),
            )
        };
        if !is_live {
            return duration;
        }
        (self.get_segment_availability_end() - delay).max(0.0)
    }

    /// Seek range start pushed forward by `offset`, clamped to the range
    /// end. Used to avoid seeking right onto the eviction edge.
    pub fn get_safe_seek_range_start(&self, offset: f64) -> f64 {
        let start = self.get_seek_range_start() + offset;
        start.min(self.get_seek_range_end())
    }

    /// Record references the manifest declared, growing the live edge.
    pub fn notify_segments(&self, references: &[crate::manifest::SegmentReference]) {
        let mut state = self.state.write();
        for r in references {
            if r.end_time > state.max_notified_end {
                state.max_notified_end = r.end_time;
            }
            let d = r.end_time - r.start_time;
            if d > state.max_segment_duration {
                state.max_segment_duration = d;
            }
        }
    }

    pub fn notify_max_segment_duration(&self, duration: f64) {
        let mut state = self.state.write();
        if duration > state.max_segment_duration {
            state.max_segment_duration = duration;
        }
    }

    pub fn get_max_segment_duration(&self) -> f64 {
        self.state.read().max_segment_duration
    }

    /// Align the local clock with the server clock.
    pub fn set_clock_offset(&self, offset_ms: f64) {
        self.state.write().clock_offset_ms = offset_ms;
    }

    pub fn set_presentation_delay(&self, delay: f64) {
        self.state.write().presentation_delay = delay;
    }
}
