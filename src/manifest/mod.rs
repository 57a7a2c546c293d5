//! Manifest data model
//!
//! The manifest is immutable at start: a timeline of periods, a set of
//! selectable variants (audio+video pairs) and text streams. Segment
//! lookup goes through each stream's lazily created [`SegmentIndex`].
//!
//! The engine consumes streams through the [`Stream`] trait so tests can
//! substitute mocks; [`ManifestStream`] is the concrete implementation a
//! manifest parser would build.

pub mod index;
pub mod segment;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::Result;

pub use index::SegmentIndex;
pub use segment::{
    AesKey, AesMethod, InitSegmentReference, SegmentIdentity, SegmentReference, SegmentStatus,
};

/// The content types a track can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Audio,
    Video,
    Text,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Audio => "audio",
            ContentType::Video => "video",
            ContentType::Text => "text",
        }
    }

    pub const ALL: [ContentType; 3] = [ContentType::Audio, ContentType::Video, ContentType::Text];
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Manifest flavor; decides a few container-level defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    Dash,
    Hls,
}

/// A selectable media stream.
///
/// The segment index is lazy and restartable: it is `None` until
/// `create_segment_index` resolves, and `close_segment_index` releases it
/// again (e.g. when a variant is abandoned).
#[async_trait]
pub trait Stream: Send + Sync {
    fn id(&self) -> u32;
    fn content_type(&self) -> ContentType;
    fn mime_type(&self) -> &str;
    fn codecs(&self) -> &str;
    fn language(&self) -> &str;
    fn bandwidth(&self) -> u64;

    /// Inband event schemes the application registered for this stream.
    fn emsg_scheme_id_uris(&self) -> &[String];

    /// Key material when the stream's segments are AES-encrypted.
    fn aes_key(&self) -> Option<AesKey> {
        None
    }

    /// Closed-caption channel id to extract (e.g. "CC1"), when any.
    fn closed_captions_id(&self) -> Option<String> {
        None
    }

    /// The audio for this stream rides inside the video segments.
    fn is_audio_muxed_in_video(&self) -> bool {
        false
    }

    /// Low-bitrate alternate used for trick play, when the variant has one.
    fn trick_mode_video(&self) -> Option<Arc<dyn Stream>> {
        None
    }

    /// Build the segment index. Idempotent; may hit the network.
    async fn create_segment_index(&self) -> Result<()>;

    /// Release the segment index.
    fn close_segment_index(&self);

    /// The current index, or `None` while not created.
    fn segment_index(&self) -> Option<Arc<SegmentIndex>>;
}

/// Whether two optional streams are the same stream.
pub fn same_stream(a: Option<&Arc<dyn Stream>>, b: Option<&Arc<dyn Stream>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.id() == b.id(),
        _ => false,
    }
}

/// Concrete stream backed by a pre-built reference list.
///
/// A manifest parser constructs one per representation/rendition; the
/// reference list may be replaced on live updates through the index.
pub struct ManifestStream {
    id: u32,
    content_type: ContentType,
    mime_type: String,
    codecs: String,
    language: String,
    bandwidth: u64,
    emsg_scheme_id_uris: Vec<String>,
    aes_key: Option<AesKey>,
    closed_captions_id: Option<String>,
    is_audio_muxed_in_video: bool,
    trick_mode_video: Mutex<Option<Arc<dyn Stream>>>,
    references: Mutex<Vec<SegmentReference>>,
    index: RwLock<Option<Arc<SegmentIndex>>>,
}

impl ManifestStream {
    pub fn new(id: u32, content_type: ContentType, mime_type: &str, codecs: &str) -> Self {
        Self {
            id,
            content_type,
            mime_type: mime_type.to_string(),
            codecs: codecs.to_string(),
            language: String::new(),
            bandwidth: 0,
            emsg_scheme_id_uris: Vec::new(),
            aes_key: None,
            closed_captions_id: None,
            is_audio_muxed_in_video: false,
            trick_mode_video: Mutex::new(None),
            references: Mutex::new(Vec::new()),
            index: RwLock::new(None),
        }
    }

    pub fn language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn emsg_schemes(mut self, schemes: Vec<String>) -> Self {
        self.emsg_scheme_id_uris = schemes;
        self
    }

    pub fn aes_key(mut self, key: AesKey) -> Self {
        self.aes_key = Some(key);
        self
    }

    pub fn closed_captions(mut self, id: &str) -> Self {
        self.closed_captions_id = Some(id.to_string());
        self
    }

    pub fn references(self, references: Vec<SegmentReference>) -> Self {
        *self.references.lock() = references;
        self
    }

    pub fn set_trick_mode_video(&self, stream: Arc<dyn Stream>) {
        *self.trick_mode_video.lock() = Some(stream);
    }
}

#[async_trait]
impl Stream for ManifestStream {
    fn id(&self) -> u32 {
        self.id
    }

    fn content_type(&self) -> ContentType {
        self.content_type
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn codecs(&self) -> &str {
        &self.codecs
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    fn emsg_scheme_id_uris(&self) -> &[String] {
        &self.emsg_scheme_id_uris
    }

    fn aes_key(&self) -> Option<AesKey> {
        self.aes_key.clone()
    }

    fn closed_captions_id(&self) -> Option<String> {
        self.closed_captions_id.clone()
    }

    fn is_audio_muxed_in_video(&self) -> bool {
        self.is_audio_muxed_in_video
    }

    fn trick_mode_video(&self) -> Option<Arc<dyn Stream>> {
        self.trick_mode_video.lock().clone()
    }

    async fn create_segment_index(&self) -> Result<()> {
        let mut index = self.index.write();
        if index.is_none() {
            *index = Some(Arc::new(SegmentIndex::new(self.references.lock().clone())));
        }
        Ok(())
    }

    fn close_segment_index(&self) {
        *self.index.write() = None;
    }

    fn segment_index(&self) -> Option<Arc<SegmentIndex>> {
        self.index.read().clone()
    }
}

/// A selectable combination of one audio and one video stream.
#[derive(Clone)]
pub struct Variant {
    pub id: u32,
    pub bandwidth: u64,
    pub audio: Option<Arc<dyn Stream>>,
    pub video: Option<Arc<dyn Stream>>,
    pub allowed_by_application: bool,
    pub allowed_by_key_system: bool,
    /// Wall-clock presentation time until which the variant is disabled
    /// after repeated failures. Zero means enabled.
    pub disabled_until_time: f64,
}

impl Variant {
    pub fn new(id: u32, bandwidth: u64) -> Self {
        Self {
            id,
            bandwidth,
            audio: None,
            video: None,
            allowed_by_application: true,
            allowed_by_key_system: true,
            disabled_until_time: 0.0,
        }
    }

    pub fn audio(mut self, stream: Arc<dyn Stream>) -> Self {
        self.audio = Some(stream);
        self
    }

    pub fn video(mut self, stream: Arc<dyn Stream>) -> Self {
        self.video = Some(stream);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed_by_application && self.allowed_by_key_system
    }
}

/// A contiguous piece of the presentation timeline.
#[derive(Debug, Clone)]
pub struct Period {
    pub id: u32,
    pub start_time: f64,
}

/// An immutable-at-start description of the presentation.
pub struct Manifest {
    pub manifest_type: ManifestType,
    pub is_live: bool,
    /// Segments are appended contiguously without timestamp mapping.
    pub sequence_mode: bool,
    /// In sequence mode, ignore container timestamps entirely.
    pub ignore_manifest_timestamps_in_segments_mode: bool,
    pub periods: Vec<Period>,
    pub variants: Vec<Arc<Variant>>,
    pub text_streams: Vec<Arc<dyn Stream>>,
    pub min_buffer_time: f64,
}

impl Manifest {
    /// The period containing `time`, or the last period before it.
    pub fn period_containing(&self, time: f64) -> Option<&Period> {
        self.periods
            .iter()
            .rev()
            .find(|p| time >= p.start_time)
            .or_else(|| self.periods.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: u32) -> Arc<dyn Stream> {
        Arc::new(ManifestStream::new(id, ContentType::Video, "video/mp4", "avc1.42c01e"))
    }

    #[test]
    fn test_same_stream() {
        let a = stream(1);
        let b = stream(1);
        let c = stream(2);
        assert!(same_stream(Some(&a), Some(&b)));
        assert!(!same_stream(Some(&a), Some(&c)));
        assert!(!same_stream(Some(&a), None));
        assert!(same_stream(None, None));
    }

    #[tokio::test]
    async fn test_segment_index_lazy() {
        let s = ManifestStream::new(1, ContentType::Video, "video/mp4", "avc1")
            .references(vec![SegmentReference::new(0.0, 4.0, vec!["s0".into()])]);
        assert!(s.segment_index().is_none());
        s.create_segment_index().await.unwrap();
        assert_eq!(s.segment_index().unwrap().len(), 1);
        s.close_segment_index();
        assert!(s.segment_index().is_none());
    }

    #[test]
    fn test_period_containing() {
        let manifest = Manifest {
            manifest_type: ManifestType::Dash,
            is_live: false,
            sequence_mode: false,
            ignore_manifest_timestamps_in_segments_mode: false,
            periods: vec![
                Period { id: 0, start_time: 0.0 },
                Period { id: 1, start_time: 20.0 },
            ],
            variants: Vec::new(),
            text_streams: Vec::new(),
            min_buffer_time: 0.0,
        };
        assert_eq!(manifest.period_containing(5.0).unwrap().id, 0);
        assert_eq!(manifest.period_containing(20.0).unwrap().id, 1);
        assert_eq!(manifest.period_containing(35.0).unwrap().id, 1);
    }

    #[test]
    fn test_variant_allowed() {
        let mut v = Variant::new(1, 1_000_000);
        assert!(v.is_allowed());
        v.allowed_by_key_system = false;
        assert!(!v.is_allowed());
    }
}
