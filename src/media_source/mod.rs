//! MediaSourceEngine: serialized per-track access to the append sink
//!
//! Holds one [`OperationQueue`] per track and guarantees FIFO execution
//! of append/remove/duration/window operations. Appends pass through the
//! ancillary pipeline on the way in: optional transmux, embedded-caption
//! extraction, `emsg`/`prft` parsing and metadata dispatch, init-segment
//! de-duplication, and append-window widening.

pub mod queue;
pub mod sink;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::TimeZone;
use parking_lot::{Mutex, RwLock};

use crate::boxes;
use crate::captions::CaptionExtractor;
use crate::error::{Code, Result, Severity, StreamingError};
use crate::events::{EmsgEvent, EngineEvent, EventBus, MetadataSink, ProgramDateEvent};
use crate::manifest::{
    ContentType, InitSegmentReference, ManifestType, SegmentReference, Stream,
};
use crate::metadata::decode_id3;
use crate::transmux::{should_transmux, Transmuxer};

pub use queue::{OpKind, OperationQueue};
pub use sink::{
    buffer_end, buffer_start, buffered_ahead_of, is_buffered, AppendContext, BufferedRange,
    MediaSink, SinkError,
};

/// Scheme that triggers a manifest refresh instead of an application event.
const SCHEME_DASH_EVENT: &str = "urn:mpeg:dash:event:2012";
/// Scheme whose message data is an ID3 tag.
const SCHEME_ID3: &str = "https://aomedia.org/emsg/ID3";

/// Settings the engine hot-reloads into the media source.
#[derive(Debug, Clone)]
pub struct MediaSourceSettings {
    pub force_transmux: bool,
    pub append_window_start_fudge: f64,
    pub append_window_end_fudge: f64,
    pub parse_prft_box: bool,
}

impl Default for MediaSourceSettings {
    fn default() -> Self {
        Self {
            force_transmux: false,
            append_window_start_fudge: 0.1,
            append_window_end_fudge: 0.1,
            parse_prft_box: false,
        }
    }
}

/// Per-track sink-facing state, guarded by the track's queue discipline.
#[derive(Default)]
struct TrackSinkState {
    mime_type: String,
    codecs: String,
    timestamp_offset: f64,
    append_window: (f64, f64),
    last_init: Option<Arc<InitSegmentReference>>,
    /// Timescale parsed from the last init segment's `mdhd`.
    timescale: Option<u32>,
}

struct Track {
    queue: OperationQueue,
    state: Mutex<TrackSinkState>,
}

/// Serialized operation front-end over the append-buffer sink.
pub struct MediaSourceEngine {
    sink: Arc<dyn MediaSink>,
    transmuxer: Option<Arc<dyn Transmuxer>>,
    captions: Option<Arc<CaptionExtractor>>,
    metadata_sink: Option<Arc<dyn MetadataSink>>,
    events: Arc<dyn EventBus>,
    settings: RwLock<MediaSourceSettings>,
    tracks: RwLock<HashMap<ContentType, Arc<Track>>>,
    sequence_mode: AtomicBool,
    manifest_type: Mutex<ManifestType>,
    ignore_manifest_timestamps: AtomicBool,
    eos_signaled: AtomicBool,
    prft_reported: AtomicBool,
    destroyed: AtomicBool,
}

impl MediaSourceEngine {
    pub fn new(sink: Arc<dyn MediaSink>, events: Arc<dyn EventBus>) -> Self {
        Self {
            sink,
            transmuxer: None,
            captions: None,
            metadata_sink: None,
            events,
            settings: RwLock::new(MediaSourceSettings::default()),
            tracks: RwLock::new(HashMap::new()),
            sequence_mode: AtomicBool::new(false),
            manifest_type: Mutex::new(ManifestType::Dash),
            ignore_manifest_timestamps: AtomicBool::new(false),
            eos_signaled: AtomicBool::new(false),
            prft_reported: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_transmuxer(mut self, transmuxer: Arc<dyn Transmuxer>) -> Self {
        self.transmuxer = Some(transmuxer);
        self
    }

    pub fn with_captions(mut self, captions: Arc<CaptionExtractor>) -> Self {
        self.captions = Some(captions);
        self
    }

    pub fn with_metadata_sink(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.metadata_sink = Some(sink);
        self
    }

    pub fn configure(&self, settings: MediaSourceSettings) {
        *self.settings.write() = settings;
    }

    pub fn caption_extractor(&self) -> Option<&Arc<CaptionExtractor>> {
        self.captions.as_ref()
    }

    /// Attach sinks for the given streams. Synchronously succeeds once
    /// every track is attached.
    pub fn init(
        &self,
        streams_by_type: &HashMap<ContentType, Arc<dyn Stream>>,
        sequence_mode: bool,
        manifest_type: ManifestType,
        ignore_manifest_timestamps: bool,
    ) -> Result<()> {
        self.sequence_mode.store(sequence_mode, Ordering::SeqCst);
        *self.manifest_type.lock() = manifest_type;
        self.ignore_manifest_timestamps
            .store(ignore_manifest_timestamps, Ordering::SeqCst);

        let mut tracks = self.tracks.write();
        for (&content_type, stream) in streams_by_type {
            let mime_codecs = full_mime_type(stream.mime_type(), stream.codecs());
            tracing::info!(%content_type, mime = %mime_codecs, "attaching sink track");
            self.sink
                .init_track(content_type, &mime_codecs)
                .map_err(|e| sink_error_to_streaming(e, content_type))?;
            let track = Arc::new(Track {
                queue: OperationQueue::new(content_type.as_str()),
                state: Mutex::new(TrackSinkState {
                    mime_type: stream.mime_type().to_string(),
                    codecs: stream.codecs().to_string(),
                    append_window: (0.0, f64::INFINITY),
                    ..Default::default()
                }),
            });
            tracks.insert(content_type, track);
        }
        Ok(())
    }

    /// Attach a single additional track (late text activation).
    pub fn init_track(&self, content_type: ContentType, stream: &Arc<dyn Stream>) -> Result<()> {
        let mime_codecs = full_mime_type(stream.mime_type(), stream.codecs());
        self.sink
            .init_track(content_type, &mime_codecs)
            .map_err(|e| sink_error_to_streaming(e, content_type))?;
        self.tracks.write().insert(
            content_type,
            Arc::new(Track {
                queue: OperationQueue::new(content_type.as_str()),
                state: Mutex::new(TrackSinkState {
                    mime_type: stream.mime_type().to_string(),
                    codecs: stream.codecs().to_string(),
                    append_window: (0.0, f64::INFINITY),
                    ..Default::default()
                }),
            }),
        );
        Ok(())
    }

    pub fn has_track(&self, content_type: ContentType) -> bool {
        self.tracks.read().contains_key(&content_type)
    }

    fn track(&self, content_type: ContentType) -> Result<Arc<Track>> {
        self.tracks.read().get(&content_type).cloned().ok_or_else(|| {
            StreamingError::media(
                Code::MediaSourceOperationFailed,
                format!("no sink track for {content_type}"),
            )
        })
    }

    /// Clamp the sink's presentation duration.
    pub async fn set_duration(&self, duration: f64) -> Result<()> {
        // Duration is global: serialize behind every track queue to keep
        // it ordered with in-flight appends.
        let tracks: Vec<Arc<Track>> = self.tracks.read().values().cloned().collect();
        for track in &tracks {
            track
                .queue
                .submit(OpKind::SetDuration, async { Ok(()) })
                .await?;
        }
        self.sink.set_duration(duration);
        Ok(())
    }

    pub fn duration(&self) -> f64 {
        self.sink.duration()
    }

    /// Update a track's timestamp offset, append window and codec type.
    ///
    /// The effective window is widened by the configured fudge on both
    /// sides so codec-level sample timing rounding near a boundary does
    /// not drop a sample.
    pub async fn set_stream_properties(
        &self,
        content_type: ContentType,
        timestamp_offset: f64,
        append_window_start: f64,
        append_window_end: f64,
        mime_type: &str,
        codecs: &str,
    ) -> Result<()> {
        let track = self.track(content_type)?;
        let (fudge_start, fudge_end) = {
            let s = self.settings.read();
            (s.append_window_start_fudge, s.append_window_end_fudge)
        };

        let (type_changed, offset_changed, window_changed) = {
            let mut state = track.state.lock();
            let type_changed = state.mime_type != mime_type || state.codecs != codecs;
            let offset_changed = state.timestamp_offset != timestamp_offset;
            let window_changed =
                state.append_window != (append_window_start, append_window_end);
            state.mime_type = mime_type.to_string();
            state.codecs = codecs.to_string();
            state.timestamp_offset = timestamp_offset;
            state.append_window = (append_window_start, append_window_end);
            (type_changed, offset_changed, window_changed)
        };

        if type_changed {
            let sink = self.sink.clone();
            let mime_codecs = full_mime_type(mime_type, codecs);
            track
                .queue
                .submit(OpKind::ChangeType, async move {
                    sink.change_type(content_type, &mime_codecs);
                    Ok(())
                })
                .await?;
        }

        if offset_changed || type_changed {
            let sink = self.sink.clone();
            track
                .queue
                .submit(OpKind::SetTimestampOffset, async move {
                    sink.set_timestamp_offset(content_type, timestamp_offset);
                    Ok(())
                })
                .await?;
        }

        if window_changed || type_changed {
            let effective_start = (append_window_start - fudge_start).max(0.0);
            let effective_end = append_window_end + fudge_end;
            let sink = self.sink.clone();
            track
                .queue
                .submit(OpKind::SetAppendWindow, async move {
                    sink.set_append_window(content_type, effective_start, effective_end);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Append an init segment, de-duplicated against the last one.
    /// Returns `false` when the append was skipped as redundant.
    pub async fn append_init(
        &self,
        content_type: ContentType,
        data: Bytes,
        init_ref: &Arc<InitSegmentReference>,
        stream: &Arc<dyn Stream>,
    ) -> Result<bool> {
        let track = self.track(content_type)?;
        {
            let state = track.state.lock();
            if let Some(last) = &state.last_init {
                if last.same_identity(init_ref) {
                    tracing::debug!(%content_type, "init segment unchanged, skipping append");
                    return Ok(false);
                }
            }
        }

        let data = self
            .transform(content_type, data, None, stream, 0.0)
            .await?;

        // The init segment's mdhd timescale feeds later prft math.
        let scan = boxes::scan(&data);
        if let Some(timescale) = scan.mdhd_timescale {
            track.state.lock().timescale = Some(timescale);
        }

        if content_type == ContentType::Video {
            if let Some(captions) = &self.captions {
                captions.on_init_segment(&data);
            }
        }

        let sink = self.sink.clone();
        let context = AppendContext {
            sequence_mode: self.sequence_mode.load(Ordering::SeqCst),
            reference_times: None,
        };
        track
            .queue
            .submit(OpKind::AppendInit, async move {
                sink.append(content_type, data, context)
                    .await
                    .map_err(|e| sink_error_to_streaming(e, content_type))
            })
            .await?;

        track.state.lock().last_init = Some(init_ref.clone());
        self.events
            .on_event(&EngineEvent::InitSegmentAppended { content_type });
        Ok(true)
    }

    /// Append a media segment.
    pub async fn append_media(
        &self,
        content_type: ContentType,
        data: Bytes,
        reference: &Arc<SegmentReference>,
        stream: &Arc<dyn Stream>,
        has_closed_captions: bool,
        seeked: bool,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(StreamingError::media(
                Code::MediaSourceOperationFailed,
                "refusing to append empty segment",
            )
            .with_content_type(content_type));
        }
        let track = self.track(content_type)?;

        let data = self
            .transform(
                content_type,
                data,
                Some(reference),
                stream,
                reference.duration(),
            )
            .await?;

        // Ancillary boxes: inband events and producer reference time.
        if content_type == ContentType::Video || !stream.emsg_scheme_id_uris().is_empty() {
            let timescale = track.state.lock().timescale;
            self.dispatch_ancillary(&data, reference, stream, timescale);
        }

        if has_closed_captions && content_type == ContentType::Video {
            if let Some(captions) = &self.captions {
                if seeked {
                    captions.reset();
                }
                captions.on_media_segment(&data);
            }
        }

        let sink = self.sink.clone();
        let context = AppendContext {
            sequence_mode: self.sequence_mode.load(Ordering::SeqCst),
            reference_times: Some((reference.start_time, reference.end_time)),
        };
        track
            .queue
            .submit(OpKind::AppendMedia, async move {
                sink.append(content_type, data, context)
                    .await
                    .map_err(|e| sink_error_to_streaming(e, content_type))
            })
            .await?;

        self.events.on_event(&EngineEvent::SegmentAppended {
            content_type,
            start_time: reference.start_time,
            end_time: reference.end_time,
            is_muxed: stream.is_audio_muxed_in_video(),
        });
        Ok(())
    }

    /// Transmux when the sink cannot ingest the stream's container.
    async fn transform(
        &self,
        content_type: ContentType,
        data: Bytes,
        reference: Option<&Arc<SegmentReference>>,
        stream: &Arc<dyn Stream>,
        duration: f64,
    ) -> Result<Bytes> {
        let force = self.settings.read().force_transmux;
        let native = self.sink.native_mime_types();
        if !should_transmux(self.transmuxer.as_ref(), stream.mime_type(), &native, force) {
            return Ok(data);
        }
        let transmuxer = self.transmuxer.as_ref().unwrap();
        let output = transmuxer
            .transmux(data, reference.map(|r| r.as_ref()), duration, content_type)
            .await?;
        if !output.captions.is_empty() {
            if let Some(captions) = &self.captions {
                captions.forward_packets(output.captions);
            }
        }
        if !output.metadata.is_empty() {
            if let Some(sink) = &self.metadata_sink {
                let start = reference.map(|r| r.start_time).unwrap_or(0.0);
                let end = reference.map(|r| r.end_time);
                sink.on_metadata(output.metadata, start, end);
            }
        }
        Ok(output.data)
    }

    /// Parse `emsg`/`prft` and dispatch events; does not append.
    pub fn get_timestamp_and_dispatch_metadata(
        &self,
        content_type: ContentType,
        data: &[u8],
        reference: &Arc<SegmentReference>,
        stream: &Arc<dyn Stream>,
    ) -> Result<()> {
        let timescale = self
            .track(content_type)
            .ok()
            .and_then(|t| t.state.lock().timescale);
        self.dispatch_ancillary(data, reference, stream, timescale);
        Ok(())
    }

    fn dispatch_ancillary(
        &self,
        data: &[u8],
        reference: &Arc<SegmentReference>,
        stream: &Arc<dyn Stream>,
        init_timescale: Option<u32>,
    ) {
        let scan = boxes::scan(data);

        for raw in scan.emsg {
            let registered = stream
                .emsg_scheme_id_uris()
                .iter()
                .any(|s| s == &raw.scheme_id_uri);
            let well_known =
                raw.scheme_id_uri == SCHEME_DASH_EVENT || raw.scheme_id_uri == SCHEME_ID3;
            if !registered && !well_known {
                tracing::debug!(scheme = %raw.scheme_id_uri, "ignoring emsg with unregistered scheme");
                continue;
            }

            if raw.scheme_id_uri == SCHEME_DASH_EVENT {
                tracing::debug!("inband manifest update event");
                self.events.on_event(&EngineEvent::ManifestUpdate);
                continue;
            }

            let timescale = raw.timescale.max(1);
            let start_time = if raw.version == 0 {
                reference.start_time + raw.presentation_time_delta as f64 / timescale as f64
            } else {
                raw.presentation_time as f64 / timescale as f64 + reference.timestamp_offset
            };
            let event = EmsgEvent {
                scheme_id_uri: raw.scheme_id_uri.clone(),
                value: raw.value,
                start_time,
                end_time: start_time + raw.event_duration as f64 / timescale as f64,
                timescale,
                event_duration: raw.event_duration,
                id: raw.id,
                message_data: raw.message_data.clone(),
            };
            let end_time = event.end_time;
            let handled = self.events.on_event(&EngineEvent::Emsg(event));

            if raw.scheme_id_uri == SCHEME_ID3 && !handled {
                let frames = decode_id3(&raw.message_data);
                if !frames.is_empty() {
                    if let Some(sink) = &self.metadata_sink {
                        sink.on_metadata(frames, start_time, Some(end_time));
                    }
                }
            }
        }

        if self.settings.read().parse_prft_box {
            for prft in scan.prft {
                if self.prft_reported.swap(true, Ordering::SeqCst) {
                    break;
                }
                let timescale = init_timescale
                    .or_else(|| reference.init_segment.as_ref().and_then(|i| i.timescale));
                let Some(timescale) = timescale else {
                    tracing::warn!("prft box without a known timescale, dropping");
                    self.prft_reported.store(false, Ordering::SeqCst);
                    break;
                };
                let start_ms = prft.program_start_ms(timescale);
                let program_start_date = chrono::Utc
                    .timestamp_millis_opt(start_ms as i64)
                    .single()
                    .unwrap_or_default();
                self.events
                    .on_event(&EngineEvent::ProgramDate(ProgramDateEvent {
                        wall_clock_time_ms: prft.wall_clock_time_ms(),
                        program_start_date,
                    }));
            }
        }
    }

    /// Remove `[start, end)` from a track's buffer.
    pub async fn remove(&self, content_type: ContentType, start: f64, end: f64) -> Result<()> {
        let track = self.track(content_type)?;
        let sink = self.sink.clone();
        track
            .queue
            .submit(OpKind::Remove, async move {
                sink.remove(content_type, start, end)
                    .await
                    .map_err(|e| sink_error_to_streaming(e, content_type))
            })
            .await
    }

    /// Remove everything buffered for a track.
    pub async fn clear(&self, content_type: ContentType) -> Result<()> {
        let track = self.track(content_type)?;
        let sink = self.sink.clone();
        tracing::debug!(%content_type, "clearing buffer");
        track
            .queue
            .submit(OpKind::Remove, async move {
                sink.remove(content_type, 0.0, f64::INFINITY)
                    .await
                    .map_err(|e| sink_error_to_streaming(e, content_type))
            })
            .await?;
        track.state.lock().last_init = None;
        Ok(())
    }

    /// Drop sink pipeline state for a track (post-seek flush).
    pub async fn flush(&self, content_type: ContentType) -> Result<()> {
        let track = self.track(content_type)?;
        let sink = self.sink.clone();
        track
            .queue
            .submit(OpKind::Flush, async move {
                sink.flush(content_type)
                    .await
                    .map_err(|e| sink_error_to_streaming(e, content_type))
            })
            .await
    }

    /// Reset the embedded-caption decoder, serialized with appends.
    pub async fn reset_caption_parser(&self) -> Result<()> {
        let Some(captions) = self.captions.clone() else {
            return Ok(());
        };
        let track = match self.track(ContentType::Video) {
            Ok(t) => t,
            Err(_) => {
                captions.reset();
                return Ok(());
            }
        };
        track
            .queue
            .submit(OpKind::ResetCaptionParser, async move {
                captions.reset();
                Ok(())
            })
            .await
    }

    pub fn buffer_start(&self, content_type: ContentType) -> Option<f64> {
        buffer_start(&self.sink.buffered(content_type))
    }

    pub fn buffer_end(&self, content_type: ContentType) -> Option<f64> {
        buffer_end(&self.sink.buffered(content_type))
    }

    pub fn buffered_ahead_of(&self, content_type: ContentType, time: f64) -> f64 {
        buffered_ahead_of(&self.sink.buffered(content_type), time)
    }

    pub fn is_buffered(&self, content_type: ContentType, time: f64) -> bool {
        is_buffered(&self.sink.buffered(content_type), time)
    }

    /// Signal that the last segment has been appended. Idempotent.
    pub async fn end_of_stream(&self) -> Result<()> {
        if self.eos_signaled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("signaling end of stream to sink");
        // Barrier every queue so pending appends land first.
        let tracks: Vec<Arc<Track>> = self.tracks.read().values().cloned().collect();
        for track in &tracks {
            track
                .queue
                .submit(OpKind::EndOfStream, async { Ok(()) })
                .await?;
        }
        self.sink
            .end_of_stream()
            .await
            .map_err(|e| sink_error_to_streaming(e, ContentType::Video).into_critical())
    }

    pub fn eos_signaled(&self) -> bool {
        self.eos_signaled.load(Ordering::SeqCst)
    }

    pub fn manifest_type(&self) -> ManifestType {
        *self.manifest_type.lock()
    }

    /// Whether container timestamps are ignored in sequence mode.
    pub fn ignores_manifest_timestamps(&self) -> bool {
        self.ignore_manifest_timestamps.load(Ordering::SeqCst)
    }

    /// Whether appending `init_ref` would actually reach the sink, or be
    /// skipped as a duplicate of the last init segment.
    pub fn needs_init(&self, content_type: ContentType, init_ref: &InitSegmentReference) -> bool {
        match self.track(content_type) {
            Ok(track) => match &track.state.lock().last_init {
                Some(last) => !last.same_identity(init_ref),
                None => true,
            },
            Err(_) => true,
        }
    }

    /// Forget the last-appended init segment so the next one re-appends
    /// (used when a cleared track restarts).
    pub fn forget_init(&self, content_type: ContentType) {
        if let Ok(track) = self.track(content_type) {
            track.state.lock().last_init = None;
        }
    }

    /// Abort all queued work and tear the tracks down.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracks: Vec<Arc<Track>> = self.tracks.write().drain().map(|(_, t)| t).collect();
        for track in tracks {
            track.queue.destroy().await;
        }
    }
}

fn full_mime_type(mime: &str, codecs: &str) -> String {
    if codecs.is_empty() {
        mime.to_string()
    } else {
        format!("{mime}; codecs=\"{codecs}\"")
    }
}

fn sink_error_to_streaming(e: SinkError, content_type: ContentType) -> StreamingError {
    match e {
        SinkError::QuotaExceeded => StreamingError::quota_exceeded(content_type),
        SinkError::Failed(msg) => StreamingError::new(
            Severity::Critical,
            crate::error::Category::Media,
            Code::MediaSourceOperationFailed,
            msg,
        )
        .with_content_type(content_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mime_type() {
        assert_eq!(
            full_mime_type("video/mp4", "avc1.42c01e"),
            "video/mp4; codecs=\"avc1.42c01e\""
        );
        assert_eq!(full_mime_type("text/vtt", ""), "text/vtt");
    }

    #[test]
    fn test_sink_error_mapping() {
        let e = sink_error_to_streaming(SinkError::QuotaExceeded, ContentType::Audio);
        assert_eq!(e.code, Code::QuotaExceeded);
        assert_eq!(e.content_type, Some(ContentType::Audio));
        assert_eq!(e.severity, Severity::Recoverable);

        let e = sink_error_to_streaming(SinkError::Failed("x".into()), ContentType::Video);
        assert_eq!(e.code, Code::MediaSourceOperationFailed);
        assert_eq!(e.severity, Severity::Critical);
    }
}
