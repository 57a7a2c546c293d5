//! StreamingEngine: per-track scheduling over the media source
//!
//! Owns one pipeline task per active content type. Each task
//! independently picks the next segment for its track, fetches it
//! (abortable), decrypts and transmuxes as needed, and appends it
//! through the media source's serialized queues. The engine applies
//! variant and text switches, coordinates seeks and trick play, evicts
//! behind the playhead, detects end of stream, and enforces the failure
//! policy.

pub(crate) mod track;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{CrossBoundaryStrategy, StreamingConfig};
use crate::crypto::{Crypto, Decryptor};
use crate::error::{Code, Result, Severity, StreamingError};
use crate::events::TextSink;
use crate::manifest::{
    same_stream, ContentType, Manifest, SegmentReference, Stream, Variant,
};
use crate::media_source::{MediaSourceEngine, MediaSourceSettings};
use crate::net::{NetRequest, Networking, RequestType};
use crate::prefetch::SegmentPrefetch;
use crate::timeline::PresentationTimeline;

use track::{
    estimated_fetch_bytes, should_abort_in_flight, ClearTrigger, StreamProps, TrackCell,
};

/// Seek landing within this window past a segment boundary still picks
/// the earlier segment, so no sample is skipped.
const BOUNDARY_TOLERANCE: f64 = 0.1;

/// Slack when deciding a VOD track has reached the presentation end.
const EOS_EPSILON: f64 = 0.001;

/// Capability handles the owner provides to the engine.
///
/// Callbacks must not block; they run on the engine's executor.
pub trait EngineOwner: Send + Sync {
    /// Current playhead position in presentation time.
    fn presentation_time(&self) -> f64;

    /// Current bandwidth estimate in bits per second; 0 when unknown.
    fn bandwidth_estimate(&self) -> f64 {
        0.0
    }

    /// Observe an error before the failure policy applies. Setting
    /// `handled` suppresses the failure callback.
    fn on_error(&self, _error: &mut StreamingError) {}

    /// The retry budget for a recoverable error is exhausted. The owner
    /// may later call [`StreamingEngine::retry`] to resume.
    fn failure_callback(&self, _error: &StreamingError) {}

    /// Disable a failing stream until `disabled_until` (presentation
    /// clock). Return `true` when an alternative was selected and
    /// force-switched in.
    fn disable_stream(&self, _stream: &Arc<dyn Stream>, _disabled_until: f64) -> bool {
        false
    }
}

/// What a track loop should do next.
enum Action {
    /// Nothing to do; wait for a wakeup or the tick.
    Park(Duration),
    /// Execute a pending buffer clear.
    Clear,
    /// The current stream has no segment index yet.
    CreateIndex,
    /// Fetch and append this reference.
    Fetch(Arc<SegmentReference>),
    /// The track ran past the presentation end.
    SignalEos,
    /// Report this error through the failure policy.
    Fail(StreamingError),
    /// The track is done for good.
    Stop,
}

struct Inner {
    manifest: Arc<Manifest>,
    timeline: Arc<PresentationTimeline>,
    config: RwLock<StreamingConfig>,
    net: Arc<dyn Networking>,
    owner: Arc<dyn EngineOwner>,
    mse: Arc<MediaSourceEngine>,
    decryptor: Decryptor<dyn Crypto>,
    text_sink: Option<Arc<dyn TextSink>>,
    tracks: RwLock<HashMap<ContentType, Arc<TrackCell>>>,
    task_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    current_variant: Mutex<Option<Arc<Variant>>>,
    current_text: Mutex<Option<Arc<dyn Stream>>>,
    trick_play_active: AtomicBool,
    cancel: CancellationToken,
    started: AtomicBool,
    destroyed: AtomicBool,
    /// Set when streaming halted on an unrecovered error; cleared by retry.
    fatal_error: Mutex<Option<StreamingError>>,
    /// Superseded segment indexes waiting for in-flight cycles to finish.
    deferred_close: Mutex<Vec<Arc<dyn Stream>>>,
    prefetches: Mutex<HashMap<ContentType, Arc<SegmentPrefetch>>>,
    /// Shadow prefetchers kept alive per audio language across switches.
    audio_shadow_prefetches: Mutex<HashMap<String, Arc<SegmentPrefetch>>>,
}

/// The streaming engine the owner drives.
pub struct StreamingEngine {
    inner: Arc<Inner>,
}

impl StreamingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest: Arc<Manifest>,
        timeline: Arc<PresentationTimeline>,
        config: StreamingConfig,
        net: Arc<dyn Networking>,
        owner: Arc<dyn EngineOwner>,
        mse: Arc<MediaSourceEngine>,
        crypto: Arc<dyn Crypto>,
        text_sink: Option<Arc<dyn TextSink>>,
    ) -> Self {
        mse.configure(MediaSourceSettings {
            force_transmux: config.force_transmux,
            append_window_start_fudge: config.append_window_start_fudge,
            append_window_end_fudge: config.append_window_end_fudge,
            parse_prft_box: config.parse_prft_box,
        });
        Self {
            inner: Arc::new(Inner {
                manifest,
                timeline,
                config: RwLock::new(config),
                net,
                owner,
                mse,
                decryptor: Decryptor::new(crypto),
                text_sink,
                tracks: RwLock::new(HashMap::new()),
                task_handles: Mutex::new(Vec::new()),
                current_variant: Mutex::new(None),
                current_text: Mutex::new(None),
                trick_play_active: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                fatal_error: Mutex::new(None),
                deferred_close: Mutex::new(Vec::new()),
                prefetches: Mutex::new(HashMap::new()),
                audio_shadow_prefetches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Hot-reload the configuration.
    pub fn configure(&self, config: StreamingConfig) {
        self.inner.mse.configure(MediaSourceSettings {
            force_transmux: config.force_transmux,
            append_window_start_fudge: config.append_window_start_fudge,
            append_window_end_fudge: config.append_window_end_fudge,
            parse_prft_box: config.parse_prft_box,
        });
        *self.inner.config.write() = config;
        self.inner.wake_all();
    }

    /// Initialize sinks, install the initial streams and start the
    /// per-track scheduling loops.
    pub async fn start(
        &self,
        initial_variant: Arc<Variant>,
        initial_text: Option<Arc<dyn Stream>>,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(StreamingError::new(
                Severity::Critical,
                crate::error::Category::Player,
                Code::StreamingEngineStartupFailure,
                "engine already started",
            ));
        }

        let mut streams: HashMap<ContentType, Arc<dyn Stream>> = HashMap::new();
        if let Some(audio) = &initial_variant.audio {
            if !audio.is_audio_muxed_in_video() {
                streams.insert(ContentType::Audio, audio.clone());
            }
        }
        if let Some(video) = &initial_variant.video {
            streams.insert(ContentType::Video, video.clone());
        }
        if let Some(text) = &initial_text {
            streams.insert(ContentType::Text, text.clone());
        }
        if streams.is_empty() {
            return Err(StreamingError::new(
                Severity::Critical,
                crate::error::Category::Player,
                Code::StreamingEngineStartupFailure,
                "variant carries no streams",
            ));
        }

        for stream in streams.values() {
            stream.create_segment_index().await?;
        }

        inner.mse.init(
            &streams,
            inner.manifest.sequence_mode,
            inner.manifest.manifest_type,
            inner.manifest.ignore_manifest_timestamps_in_segments_mode,
        )?;

        *inner.current_variant.lock() = Some(initial_variant);
        *inner.current_text.lock() = initial_text;

        for (content_type, stream) in streams {
            inner.spawn_track(content_type, stream);
        }
        tracing::info!("streaming engine started");
        Ok(())
    }

    /// Replace the active audio/video streams. Streams with unchanged
    /// identity are left alone unless `force` is set.
    pub fn switch_variant(
        &self,
        variant: Arc<Variant>,
        clear_buffer: bool,
        safe_margin: f64,
        force: bool,
    ) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        *inner.current_variant.lock() = Some(variant.clone());

        if let Some(audio) = &variant.audio {
            if !audio.is_audio_muxed_in_video() {
                inner.switch_internal(
                    ContentType::Audio,
                    audio.clone(),
                    clear_buffer,
                    safe_margin,
                    force,
                );
            }
        }
        if let Some(video) = &variant.video {
            let target = if inner.trick_play_active.load(Ordering::SeqCst) {
                video.trick_mode_video().unwrap_or_else(|| video.clone())
            } else {
                video.clone()
            };
            inner.switch_internal(ContentType::Video, target, clear_buffer, safe_margin, force);
        }
    }

    /// Replace the active text stream. The text sink is re-initialized
    /// when the mime/codecs change; the caption parser is never reset.
    pub fn switch_text_stream(&self, stream: Arc<dyn Stream>) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let changed = !same_stream(inner.current_text.lock().as_ref(), Some(&stream));
        *inner.current_text.lock() = Some(stream.clone());
        if !changed {
            return;
        }
        let existing = inner.tracks.read().get(&ContentType::Text).cloned();
        match existing {
            Some(_) => {
                inner.switch_internal(ContentType::Text, stream, true, 0.0, false);
            }
            None => {
                // Late text activation.
                if inner.mse.init_track(ContentType::Text, &stream).is_ok() {
                    inner.spawn_track(ContentType::Text, stream);
                }
            }
        }
    }

    /// Stop streaming text. Outstanding text operations complete.
    pub fn unload_text_stream(&self) {
        let inner = &self.inner;
        *inner.current_text.lock() = None;
        if let Some(cell) = inner.tracks.write().remove(&ContentType::Text) {
            let mut state = cell.state.lock();
            state.stopped = true;
            if let Some(handle) = state.in_flight.take() {
                handle.abort();
            }
            drop(state);
            cell.wake();
            tracing::debug!("text stream unloaded");
        }
        inner.prefetches.lock().remove(&ContentType::Text);
    }

    /// The playhead jumped. Tracks whose buffer does not cover the new
    /// position are cleared and refilled.
    pub fn seeked(&self) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let playhead = inner.owner.presentation_time();
        let tracks: Vec<Arc<TrackCell>> = inner.tracks.read().values().cloned().collect();
        for cell in tracks {
            let buffered = inner.mse.is_buffered(cell.content_type, playhead);
            let mut state = cell.state.lock();
            if buffered {
                // Seek into buffered data: keep everything, no re-fetch.
                continue;
            }
            tracing::debug!(content_type = %cell.content_type, playhead, "seek outside buffer, scheduling clear");
            state.seeked = true;
            state.waiting_to_clear_buffer = true;
            state.clear_trigger = ClearTrigger::Seek;
            state.clear_safe_margin = 0.0;
            state.clear_flush = true;
            state.end_of_stream = false;
            if let Some(handle) = &state.in_flight {
                handle.abort();
            }
            drop(state);
            cell.wake();
        }
    }

    /// Route video fetches to the trick-mode stream (on), or back to the
    /// normal stream with a video-only clear and refill (off).
    pub fn set_trick_play(&self, on: bool) {
        let inner = &self.inner;
        let variant = inner.current_variant.lock().clone();
        let Some(variant) = variant else {
            return;
        };
        let Some(video) = &variant.video else {
            return;
        };
        if on {
            let Some(trick) = video.trick_mode_video() else {
                tracing::warn!("trick play requested but the variant has no trick-mode video");
                return;
            };
            if inner.trick_play_active.swap(true, Ordering::SeqCst) {
                return;
            }
            inner.switch_internal(ContentType::Video, trick, false, 0.0, false);
        } else {
            if !inner.trick_play_active.swap(false, Ordering::SeqCst) {
                return;
            }
            inner.switch_internal(ContentType::Video, video.clone(), true, 0.0, false);
        }
    }

    /// Resume streaming after a fatal non-quota error. Returns `true`
    /// when there was something to resume.
    pub async fn retry(&self, delay_secs: f64) -> bool {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let had_error = inner.fatal_error.lock().take().is_some();
        if !had_error {
            return false;
        }
        if delay_secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay_secs)).await;
        }
        tracing::info!("resuming streaming after error");
        inner.wake_all();
        true
    }

    /// Abort everything in flight, drain the queues and stop the loops.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.cancel.cancel();
        let cells: Vec<Arc<TrackCell>> = inner.tracks.write().drain().map(|(_, c)| c).collect();
        for cell in &cells {
            let mut state = cell.state.lock();
            state.stopped = true;
            if let Some(handle) = state.in_flight.take() {
                handle.abort();
            }
            drop(state);
            cell.wake();
        }
        let handles: Vec<_> = inner.task_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        for (_, prefetch) in inner.prefetches.lock().drain() {
            prefetch.clear();
        }
        for (_, prefetch) in inner.audio_shadow_prefetches.lock().drain() {
            prefetch.clear();
        }
        for cell in &cells {
            cell.state.lock().stream.close_segment_index();
        }
        inner.mse.destroy().await;
        tracing::info!("streaming engine destroyed");
    }

    pub fn current_variant(&self) -> Option<Arc<Variant>> {
        self.inner.current_variant.lock().clone()
    }

    pub fn current_text_stream(&self) -> Option<Arc<dyn Stream>> {
        self.inner.current_text.lock().clone()
    }

    pub fn is_text_visible(&self) -> bool {
        self.inner
            .text_sink
            .as_ref()
            .map(|s| s.is_text_visible())
            .unwrap_or(false)
    }

    /// The unrecovered error streaming halted on, if any.
    pub fn fatal_error(&self) -> Option<StreamingError> {
        self.inner.fatal_error.lock().clone()
    }
}

impl Inner {
    fn wake_all(&self) {
        for cell in self.tracks.read().values() {
            cell.wake();
        }
    }

    fn spawn_track(self: &Arc<Self>, content_type: ContentType, stream: Arc<dyn Stream>) {
        let cell = Arc::new(TrackCell::new(content_type, stream.clone()));
        self.tracks.write().insert(content_type, cell.clone());
        self.create_prefetch(content_type, stream);
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner.run_track(cell).await;
        });
        self.task_handles.lock().push(handle);
    }

    fn prefetch_enabled(&self, content_type: ContentType) -> bool {
        let config = self.config.read();
        config.segment_prefetch_limit > 0
            && !(content_type == ContentType::Video && config.disable_video_prefetch)
    }

    fn create_prefetch(&self, content_type: ContentType, stream: Arc<dyn Stream>) {
        if !self.prefetch_enabled(content_type) {
            return;
        }
        let config = self.config.read();
        let prefetch = Arc::new(SegmentPrefetch::new(
            stream,
            self.net.clone(),
            config.retry_parameters.clone(),
            config.segment_prefetch_limit,
        ));
        drop(config);
        self.prefetches.lock().insert(content_type, prefetch);
    }

    async fn run_track(self: Arc<Self>, cell: Arc<TrackCell>) {
        let content_type = cell.content_type;
        tracing::debug!(%content_type, "track pipeline started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let action = self.next_action(&cell);
            match action {
                Action::Stop => break,
                Action::Park(duration) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = cell.notify.notified() => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                Action::Clear => {
                    self.execute_clear(&cell).await;
                }
                Action::CreateIndex => {
                    let stream = cell.state.lock().stream.clone();
                    if let Err(e) = stream.create_segment_index().await {
                        self.handle_failure(&cell, e).await;
                    }
                }
                Action::Fetch(reference) => {
                    self.execute_fetch_append(&cell, reference).await;
                    self.finish_cycle(&cell);
                }
                Action::SignalEos => {
                    cell.state.lock().end_of_stream = true;
                    tracing::debug!(%content_type, "track reached end of stream");
                    self.maybe_signal_eos().await;
                }
                Action::Fail(error) => {
                    self.handle_failure(&cell, error).await;
                }
            }
        }
        cell.state.lock().stopped = true;
        tracing::debug!(%content_type, "track pipeline stopped");
    }

    /// Decide the next step for a track. Pure bookkeeping; the heavy
    /// work happens in the execute functions.
    fn next_action(&self, cell: &TrackCell) -> Action {
        let content_type = cell.content_type;
        let config = self.config.read();
        let mut tick = Duration::from_secs_f64(config.update_interval_secs.max(0.01));
        if config.low_latency_mode {
            tick /= 2;
        }

        if self.fatal_error.lock().is_some() {
            return Action::Park(tick);
        }

        let playhead = self.owner.presentation_time();
        let buffered_ahead = self.mse.buffered_ahead_of(content_type, playhead);
        let buffer_end = self.mse.buffer_end(content_type);
        // Close to a stall: re-evaluate blocked states more eagerly.
        let urgent_tick = if buffered_ahead < config.rebuffering_goal {
            tick / 4
        } else {
            tick
        };

        // Lead cap: audio and video advance together. Evaluated before
        // taking our own state lock so two tracks never hold each
        // other's locks.
        let lead_capped = if matches!(content_type, ContentType::Audio | ContentType::Video) {
            match buffer_end {
                Some(my_end) => {
                    let other = match content_type {
                        ContentType::Audio => ContentType::Video,
                        _ => ContentType::Audio,
                    };
                    let other_cell = self.tracks.read().get(&other).cloned();
                    match other_cell {
                        Some(other_cell) => {
                            let other_active = {
                                let s = other_cell.state.lock();
                                !s.end_of_stream && !s.stopped
                            };
                            other_active
                                && match self.mse.buffer_end(other) {
                                    Some(other_end) => {
                                        my_end - other_end
                                            >= self.timeline.get_max_segment_duration()
                                    }
                                    None => false,
                                }
                        }
                        None => false,
                    }
                }
                None => false,
            }
        } else {
            false
        };

        let mut state = cell.state.lock();
        if state.stopped {
            return Action::Stop;
        }
        if state.waiting_to_clear_buffer && !state.clearing_buffer {
            return Action::Clear;
        }
        if state.end_of_stream {
            return Action::Park(tick);
        }
        if let Some(until) = state.disabled_until {
            if playhead < until {
                return Action::Park(Duration::from_secs_f64((until - playhead).max(0.1)));
            }
            state.disabled_until = None;
        }

        // A hidden text track only streams when configured to.
        if content_type == ContentType::Text && !config.always_stream_text {
            if let Some(sink) = &self.text_sink {
                if !sink.is_text_visible() {
                    return Action::Park(tick);
                }
            }
        }

        let goal = config.buffering_goal * state.buffering_goal_scale;
        if buffered_ahead >= goal {
            return Action::Park(tick);
        }

        if lead_capped {
            return Action::Park(urgent_tick / 2);
        }

        let Some(index) = state.stream.segment_index() else {
            return Action::CreateIndex;
        };

        // Sequential advance when continuity holds, time lookup otherwise.
        // The prefer-earlier boundary tolerance only applies when
        // resolving into an empty buffer (seek, fresh start): anchoring
        // at the buffer edge with it would re-pick the segment already
        // appended there.
        let mut reference = match &state.last_reference {
            Some(last) => index.next_after(last),
            None => {
                let anchor = buffer_end.unwrap_or(playhead).max(playhead);
                let tolerance = if buffer_end.is_none() {
                    BOUNDARY_TOLERANCE
                } else {
                    0.0
                };
                index.find(anchor, tolerance)
            }
        };

        // Live: drop references that slid out of the availability window.
        if self.timeline.is_live() {
            let availability_start = self.timeline.get_segment_availability_start();
            while let Some(r) = &reference {
                if r.end_time < availability_start {
                    tracing::debug!(
                        %content_type,
                        start = r.start_time,
                        "segment slid out of availability window"
                    );
                    reference = index.next_after(r);
                } else {
                    break;
                }
            }
            if let Some(r) = &reference {
                if r.start_time > self.timeline.get_segment_availability_end() {
                    // Not yet available; the window will slide to it.
                    return Action::Park(urgent_tick);
                }
            }
        }

        let reference = match reference {
            Some(r) => r,
            None => {
                let duration = self.timeline.get_duration();
                let anchor = buffer_end.unwrap_or(playhead).max(playhead);
                if !self.timeline.is_live() && anchor >= duration - EOS_EPSILON {
                    return Action::SignalEos;
                }
                if self.timeline.is_live()
                    && anchor < self.timeline.get_segment_availability_end()
                {
                    state.missing_retries += 1;
                    if state.missing_retries > config.retry_parameters.max_attempts {
                        state.missing_retries = 0;
                        return Action::Fail(
                            StreamingError::network(
                                Code::SegmentMissing,
                                format!("no segment covers t={anchor}"),
                            )
                            .with_content_type(content_type),
                        );
                    }
                }
                return Action::Park(tick);
            }
        };

        if reference.status == crate::manifest::SegmentStatus::Missing {
            state.missing_retries += 1;
            if state.missing_retries > config.retry_parameters.max_attempts {
                state.missing_retries = 0;
                return Action::Fail(
                    StreamingError::network(
                        Code::SegmentMissing,
                        format!("segment at t={} marked missing", reference.start_time),
                    )
                    .with_content_type(content_type),
                );
            }
            return Action::Park(tick);
        }

        // Period boundary with the reset strategy: drop the buffer first.
        if config.cross_boundary_strategy == CrossBoundaryStrategy::Reset {
            if let Some(applied) = &state.applied_props {
                if *applied != StreamProps::of(&reference) && buffer_end.is_some() {
                    state.waiting_to_clear_buffer = true;
                    state.clear_trigger = ClearTrigger::Switch;
                    state.clear_safe_margin = 0.0;
                    state.clear_flush = false;
                    return Action::Clear;
                }
            }
        }

        state.performing_update = true;
        Action::Fetch(reference)
    }

    async fn execute_clear(&self, cell: &TrackCell) {
        let content_type = cell.content_type;
        let (safe_margin, flush, trigger) = {
            let mut state = cell.state.lock();
            state.waiting_to_clear_buffer = false;
            state.clearing_buffer = true;
            (state.clear_safe_margin, state.clear_flush, state.clear_trigger)
        };
        tracing::debug!(%content_type, safe_margin, "clearing track buffer");

        let result = if safe_margin > 0.0 {
            // Preserve [playhead, playhead + margin].
            let playhead = self.owner.presentation_time();
            let r1 = self.mse.remove(content_type, 0.0, playhead).await;
            let r2 = self
                .mse
                .remove(content_type, playhead + safe_margin, f64::INFINITY)
                .await;
            self.mse.forget_init(content_type);
            r1.and(r2)
        } else {
            self.mse.clear(content_type).await
        };

        if flush {
            let _ = self.mse.flush(content_type).await;
        }

        if content_type == ContentType::Text {
            if let Some(sink) = &self.text_sink {
                sink.remove(0.0, f64::INFINITY);
            }
        }

        if trigger == ClearTrigger::Seek && content_type == ContentType::Video {
            let _ = self.mse.reset_caption_parser().await;
        }

        {
            let mut state = cell.state.lock();
            state.clearing_buffer = false;
            state.reset_continuity();
        }

        if let Err(e) = result {
            if !e.is_aborted() {
                self.handle_failure(cell, e).await;
            }
        }
        self.wake_all();
    }

    async fn execute_fetch_append(&self, cell: &TrackCell, reference: Arc<SegmentReference>) {
        let content_type = cell.content_type;
        let (stream, seeked) = {
            let state = cell.state.lock();
            (state.stream.clone(), state.seeked)
        };

        // Apply the reference's period properties when they changed.
        let props = StreamProps::of(&reference);
        let needs_props = cell.state.lock().applied_props.as_ref() != Some(&props);
        if needs_props {
            let result = self
                .mse
                .set_stream_properties(
                    content_type,
                    props.timestamp_offset,
                    props.append_window_start,
                    props.append_window_end,
                    stream.mime_type(),
                    stream.codecs(),
                )
                .await;
            match result {
                Ok(()) => cell.state.lock().applied_props = Some(props),
                Err(e) => {
                    self.handle_failure(cell, e).await;
                    return;
                }
            }
        }

        // Init segment, de-duplicated by the media source.
        if let Some(init_ref) = &reference.init_segment {
            if self.mse.needs_init(content_type, init_ref) {
                let request = NetRequest {
                    request_type: RequestType::Segment,
                    uris: init_ref.uris().to_vec(),
                    byte_range: Some((init_ref.start_byte, init_ref.end_byte)),
                    retry: self.config.read().retry_parameters.clone(),
                };
                let op = self.net.request(request);
                cell.state.lock().in_flight = Some(op.handle());
                let result = op.wait().await;
                cell.state.lock().in_flight = None;
                let data = match result {
                    Ok(response) => response.data,
                    Err(e) if e.is_aborted() => return,
                    Err(e) => {
                        self.handle_failure(cell, e.with_content_type(content_type)).await;
                        return;
                    }
                };
                if let Err(e) = self
                    .mse
                    .append_init(content_type, data, init_ref, &stream)
                    .await
                    .map(|_| ())
                {
                    if !e.is_aborted() {
                        self.handle_failure(cell, e).await;
                    }
                    return;
                }
            }
        }

        // Media bytes: prefetched when available, fetched otherwise.
        let prefetched = self
            .prefetches
            .lock()
            .get(&content_type)
            .and_then(|p| p.take(&reference));
        let op = match prefetched {
            Some(op) => op,
            None => {
                let request = NetRequest::segment(
                    reference.uris().to_vec(),
                    self.config.read().retry_parameters.clone(),
                )
                .byte_range(reference.start_byte, reference.end_byte);
                self.net.request(request)
            }
        };
        tracing::debug!(
            %content_type,
            start = reference.start_time,
            end = reference.end_time,
            "fetching segment"
        );
        cell.state.lock().in_flight = Some(op.handle());
        let result = op.wait().await;
        cell.state.lock().in_flight = None;
        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_aborted() => {
                tracing::debug!(%content_type, "fetch aborted");
                return;
            }
            Err(e) => {
                self.handle_failure(cell, e.with_content_type(content_type)).await;
                return;
            }
        };

        // The availability window may have slid past us mid-fetch.
        if self.timeline.is_live()
            && reference.end_time < self.timeline.get_segment_availability_start()
        {
            tracing::debug!(%content_type, "segment expired during fetch, skipping append");
            cell.state.lock().last_reference = Some(reference);
            return;
        }

        let data = if let Some(key) = &reference.aes_key {
            match self
                .decryptor
                .decrypt(response.data, key, reference.media_sequence)
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    self.handle_failure(cell, e.with_content_type(content_type)).await;
                    return;
                }
            }
        } else {
            response.data
        };

        let playhead = self.owner.presentation_time();
        if let Err(e) = self.evict(content_type, playhead).await {
            if !e.is_aborted() {
                self.handle_failure(cell, e).await;
                return;
            }
        }

        // Append, absorbing quota pressure by evicting and shrinking.
        let has_captions =
            content_type == ContentType::Video && stream.closed_captions_id().is_some();
        loop {
            let append = self
                .mse
                .append_media(
                    content_type,
                    data.clone(),
                    &reference,
                    &stream,
                    has_captions,
                    seeked,
                )
                .await;
            match append {
                Ok(()) => break,
                Err(e) if e.code == Code::QuotaExceeded => {
                    let attempts = {
                        let mut state = cell.state.lock();
                        state.quota_attempts += 1;
                        state.quota_attempts
                    };
                    let config = self.config.read().clone();
                    if attempts > config.quota_exceeded_max_retries {
                        tracing::error!(%content_type, "quota exceeded beyond retry budget");
                        self.handle_failure(cell, e.into_critical()).await;
                        return;
                    }
                    if attempts >= 2 {
                        let mut state = cell.state.lock();
                        state.buffering_goal_scale /= 2.0;
                        tracing::warn!(
                            %content_type,
                            scale = state.buffering_goal_scale,
                            "repeated quota pressure, shrinking buffering goal"
                        );
                    }
                    // Force one segment duration of eviction and retry.
                    let seg_duration = reference.duration().max(0.1);
                    if let Some(start) = self.mse.buffer_start(content_type) {
                        let end = (start + seg_duration).min(playhead);
                        if end > start {
                            if let Err(e) = self.mse.remove(content_type, start, end).await {
                                if !e.is_aborted() {
                                    self.handle_failure(cell, e).await;
                                }
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.is_aborted() => return,
                Err(e) => {
                    self.handle_failure(cell, e).await;
                    return;
                }
            }
        }

        {
            let mut state = cell.state.lock();
            state.quota_attempts = 0;
            state.missing_retries = 0;
            state.seeked = false;
            state.last_reference = Some(reference.clone());
        }

        if let Some(prefetch) = self.prefetches.lock().get(&content_type) {
            prefetch.prefetch_after(&reference);
        }

        // Another track may have been parked on the lead cap.
        self.wake_all();
    }

    /// Evict data behind the playhead, honoring the retention window.
    async fn evict(&self, content_type: ContentType, playhead: f64) -> Result<()> {
        let (buffer_behind, eviction_goal) = {
            let config = self.config.read();
            (config.buffer_behind, config.eviction_goal)
        };
        let Some(start) = self.mse.buffer_start(content_type) else {
            return Ok(());
        };
        let limit = playhead - buffer_behind;
        // Hysteresis: do not bother with sub-goal slivers.
        if limit - start < eviction_goal {
            return Ok(());
        }
        tracing::debug!(%content_type, start, limit, "evicting behind playhead");
        self.mse.remove(content_type, start, limit).await
    }

    fn finish_cycle(&self, cell: &TrackCell) {
        cell.state.lock().performing_update = false;
        self.drain_deferred_closes();
    }

    /// Close superseded segment indexes once no cycle is running.
    fn drain_deferred_closes(&self) {
        let any_updating = self
            .tracks
            .read()
            .values()
            .any(|c| c.state.lock().performing_update);
        if any_updating {
            return;
        }
        let pending: Vec<Arc<dyn Stream>> = self.deferred_close.lock().drain(..).collect();
        for stream in pending {
            if !self.stream_in_use(&stream) {
                tracing::debug!(stream = stream.id(), "closing superseded segment index");
                stream.close_segment_index();
            }
        }
    }

    fn stream_in_use(&self, stream: &Arc<dyn Stream>) -> bool {
        let id = stream.id();
        if self
            .tracks
            .read()
            .values()
            .any(|c| c.state.lock().stream.id() == id)
        {
            return true;
        }
        if let Some(text) = self.current_text.lock().as_ref() {
            if text.id() == id {
                return true;
            }
        }
        false
    }

    fn switch_internal(
        self: &Arc<Self>,
        content_type: ContentType,
        new_stream: Arc<dyn Stream>,
        clear_buffer: bool,
        safe_margin: f64,
        force: bool,
    ) {
        let Some(cell) = self.tracks.read().get(&content_type).cloned() else {
            return;
        };
        let old_stream;
        {
            let mut state = cell.state.lock();
            if !force && same_stream(Some(&state.stream), Some(&new_stream)) {
                return;
            }
            old_stream = state.stream.clone();
            tracing::info!(
                %content_type,
                from = old_stream.id(),
                to = new_stream.id(),
                clear_buffer,
                "switching stream"
            );
            state.stream = new_stream.clone();
            state.end_of_stream = false;
            // Continuity is per stream: re-resolve from time after a
            // switch, and reapply sink properties so a mime/codecs
            // change reaches the sink before the next append.
            if old_stream.id() != new_stream.id() {
                state.last_reference = None;
                state.applied_props = None;
            }

            if clear_buffer {
                state.waiting_to_clear_buffer = true;
                state.clear_trigger = ClearTrigger::Switch;
                state.clear_safe_margin = safe_margin;
                state.clear_flush = false;
            }

            // Abort the in-flight fetch only when re-fetching pays off.
            if let Some(handle) = &state.in_flight {
                let playhead = self.owner.presentation_time();
                let new_bytes = new_stream.segment_index().and_then(|index| {
                    index
                        .find(playhead, 0.0)
                        .and_then(|r| estimated_fetch_bytes(&r, r.init_segment.is_some()))
                });
                if should_abort_in_flight(handle.bytes_remaining(), new_bytes, clear_buffer) {
                    tracing::debug!(%content_type, "aborting in-flight fetch for switch");
                    handle.abort();
                }
            }

            if state.performing_update {
                self.deferred_close.lock().push(old_stream.clone());
            }
        }

        if old_stream.id() != new_stream.id() {
            self.handle_prefetch_switch(content_type, &old_stream, new_stream);
            if !cell.state.lock().performing_update && !self.stream_in_use(&old_stream) {
                old_stream.close_segment_index();
            }
        }
        cell.wake();
    }

    /// Prefetch survival across switches: identical stream keeps its
    /// cache; an abandoned audio stream in a configured language parks
    /// as a shadow prefetcher instead of being released.
    fn handle_prefetch_switch(
        &self,
        content_type: ContentType,
        old_stream: &Arc<dyn Stream>,
        new_stream: Arc<dyn Stream>,
    ) {
        let config = self.config.read();
        let keep_languages = config.prefetch_audio_languages.clone();
        drop(config);

        let old = self.prefetches.lock().remove(&content_type);
        if let Some(old_prefetch) = old {
            let language = old_stream.language().to_string();
            if content_type == ContentType::Audio
                && !language.is_empty()
                && keep_languages.iter().any(|l| l == &language)
            {
                self.audio_shadow_prefetches
                    .lock()
                    .insert(language, old_prefetch);
            } else {
                old_prefetch.clear();
            }
        }

        if !self.prefetch_enabled(content_type) {
            return;
        }
        // Reactivate a shadow prefetcher for the incoming language.
        let revived = if content_type == ContentType::Audio {
            let language = new_stream.language().to_string();
            self.audio_shadow_prefetches
                .lock()
                .remove(&language)
                .filter(|p| p.stream().id() == new_stream.id())
        } else {
            None
        };
        let prefetch = match revived {
            Some(p) => p,
            None => {
                let config = self.config.read();
                Arc::new(SegmentPrefetch::new(
                    new_stream,
                    self.net.clone(),
                    config.retry_parameters.clone(),
                    config.segment_prefetch_limit,
                ))
            }
        };
        self.prefetches.lock().insert(content_type, prefetch);
    }

    async fn maybe_signal_eos(&self) {
        let tracks = self.tracks.read().clone();
        if tracks.is_empty() {
            return;
        }
        let all_done = tracks.values().all(|c| {
            let state = c.state.lock();
            state.end_of_stream || state.stopped
        });
        if !all_done {
            return;
        }
        if let Err(e) = self.mse.end_of_stream().await {
            tracing::error!("end-of-stream signaling failed: {e}");
            return;
        }
        // Propagate a shorter sink duration; never extend the manifest.
        let sink_duration = self.mse.duration();
        if sink_duration > 0.0
            && sink_duration.is_finite()
            && sink_duration < self.timeline.get_duration()
        {
            tracing::debug!(sink_duration, "clamping timeline duration to sink");
            self.timeline.set_duration(sink_duration);
        }
    }

    /// The failure policy of §errors: text forgiveness, stream disabling,
    /// observer veto, failure callback, halt.
    async fn handle_failure(&self, cell: &TrackCell, mut error: StreamingError) {
        let content_type = cell.content_type;
        if error.is_aborted() {
            return;
        }

        let config = self.config.read().clone();
        if content_type == ContentType::Text && config.ignore_text_stream_failures {
            tracing::warn!("ignoring text stream failure: {error}");
            cell.state.lock().stopped = true;
            return;
        }

        // Stream disabling: eligible HTTP categories only. A missing
        // segment is always worth routing around; a timeout never is.
        let disable_eligible = match error.code {
            Code::SegmentMissing => true,
            Code::BadHttpStatus | Code::HttpError => config.max_disabled_time > 0.0,
            _ => false,
        };
        if disable_eligible {
            let stream = cell.state.lock().stream.clone();
            let until = self.owner.presentation_time() + config.max_disabled_time;
            if self.owner.disable_stream(&stream, until) {
                tracing::info!(
                    %content_type,
                    stream = stream.id(),
                    "stream disabled, owner switched to an alternative"
                );
                error.severity = Severity::Recoverable;
                error.handled = true;
                // If the owner kept the same stream active, park the
                // track until the disable window passes instead of
                // hammering the failing segment.
                let mut state = cell.state.lock();
                if state.stream.id() == stream.id() {
                    state.disabled_until = Some(until);
                }
                return;
            }
            error.severity = Severity::Critical;
        }

        self.owner.on_error(&mut error);
        if error.handled {
            tracing::debug!("error marked handled by observer: {error}");
            return;
        }

        tracing::error!(%content_type, "streaming halted on error: {error}");
        *self.fatal_error.lock() = Some(error.clone());
        self.owner.failure_callback(&error);
    }
}
