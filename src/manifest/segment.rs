//! Segment references
//!
//! A [`SegmentReference`] locates one media segment: its presentation-time
//! interval, its URIs and byte range, the init segment it depends on, and
//! the timestamp mapping the sink must apply when it is appended.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;

/// Availability status of a segment reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentStatus {
    #[default]
    Available,
    /// The manifest promised the segment but the server does not have it.
    Missing,
}

/// Identity of an init segment: where its bytes come from.
///
/// Init references outlive the media references that point to them; an
/// init append is skipped when the next reference has the same identity.
#[derive(Debug, Clone)]
pub struct InitSegmentReference {
    uris: Vec<String>,
    pub start_byte: u64,
    pub end_byte: Option<u64>,
    /// Media timescale declared out of band, used for `prft` math when no
    /// `mdhd` has been parsed yet.
    pub timescale: Option<u32>,
}

impl InitSegmentReference {
    pub fn new(uris: Vec<String>, start_byte: u64, end_byte: Option<u64>) -> Self {
        Self {
            uris,
            start_byte,
            end_byte,
            timescale: None,
        }
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// Two init references with the same identity yield the same bytes,
    /// so appending the second is redundant.
    pub fn same_identity(&self, other: &InitSegmentReference) -> bool {
        self.uris == other.uris
            && self.start_byte == other.start_byte
            && self.end_byte == other.end_byte
    }
}

/// Block cipher mode for segment encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesMethod {
    Cbc,
    Ctr,
}

type FetchKeyFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;
type FetchKeyFn = Arc<dyn Fn() -> FetchKeyFuture + Send + Sync>;

/// Shared mutable key slot. One `KeyCell` is shared by every reference in
/// a playlist that uses the same key URI, so a single fetch serves all.
/// `fetch_gate` serializes concurrent first uses across tracks so the
/// fetch fires once.
struct KeyCell {
    crypto_key: Mutex<Option<Bytes>>,
    fetch_key: Option<FetchKeyFn>,
    fetch_gate: tokio::sync::Mutex<()>,
}

/// Key material for AES-encrypted segments.
///
/// `crypto_key` may be absent until `fetch_key` resolves; the fetch
/// happens at most once per cell.
#[derive(Clone)]
pub struct AesKey {
    pub method: AesMethod,
    /// Media sequence number of the first segment this key applies to.
    /// The default IV is derived from it.
    pub first_media_sequence_number: u64,
    /// Explicit IV from the manifest, when given.
    pub iv: Option<[u8; 16]>,
    cell: Arc<KeyCell>,
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKey")
            .field("method", &self.method)
            .field(
                "first_media_sequence_number",
                &self.first_media_sequence_number,
            )
            .field("iv", &self.iv.is_some())
            .field("key_present", &self.cell.crypto_key.lock().is_some())
            .finish()
    }
}

impl AesKey {
    /// A key whose bytes are already known.
    pub fn with_key(method: AesMethod, key: Bytes) -> Self {
        Self {
            method,
            first_media_sequence_number: 0,
            iv: None,
            cell: Arc::new(KeyCell {
                crypto_key: Mutex::new(Some(key)),
                fetch_key: None,
                fetch_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// A key that must be fetched on first use.
    pub fn with_fetcher<F, Fut>(method: AesMethod, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        Self {
            method,
            first_media_sequence_number: 0,
            iv: None,
            cell: Arc::new(KeyCell {
                crypto_key: Mutex::new(None),
                fetch_key: Some(Arc::new(move || Box::pin(fetch()))),
                fetch_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn first_media_sequence_number(mut self, n: u64) -> Self {
        self.first_media_sequence_number = n;
        self
    }

    pub fn iv(mut self, iv: [u8; 16]) -> Self {
        self.iv = Some(iv);
        self
    }

    /// The imported key bytes, if already present.
    pub fn crypto_key(&self) -> Option<Bytes> {
        self.cell.crypto_key.lock().clone()
    }

    /// Store key bytes after a fetch.
    pub fn set_crypto_key(&self, key: Bytes) {
        *self.cell.crypto_key.lock() = Some(key);
    }

    pub(crate) fn fetcher(&self) -> Option<FetchKeyFn> {
        self.cell.fetch_key.clone()
    }

    /// Gate serializing concurrent first-use key fetches.
    pub(crate) fn fetch_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.cell.fetch_gate
    }
}

/// A reference to one media segment.
#[derive(Debug, Clone)]
pub struct SegmentReference {
    /// Presentation time at which the segment starts.
    pub start_time: f64,
    /// Presentation time at which the segment ends (exclusive).
    pub end_time: f64,
    uris: Vec<String>,
    pub start_byte: u64,
    pub end_byte: Option<u64>,
    pub init_segment: Option<Arc<InitSegmentReference>>,
    /// Added to container-embedded timestamps to produce presentation time.
    pub timestamp_offset: f64,
    /// Samples earlier than this are clipped by the sink.
    pub append_window_start: f64,
    /// Samples later than this are clipped by the sink.
    pub append_window_end: f64,
    /// A partial (low-latency) segment that may still be growing.
    pub partial: bool,
    pub status: SegmentStatus,
    /// Key for AES-encrypted segments.
    pub aes_key: Option<AesKey>,
    /// HLS media sequence number; drives the default decryption IV.
    pub media_sequence: u64,
    /// Discontinuity sequence the segment belongs to.
    pub discontinuity_sequence: u64,
}

impl SegmentReference {
    pub fn new(start_time: f64, end_time: f64, uris: Vec<String>) -> Self {
        Self {
            start_time,
            end_time,
            uris,
            start_byte: 0,
            end_byte: None,
            init_segment: None,
            timestamp_offset: 0.0,
            append_window_start: 0.0,
            append_window_end: f64::INFINITY,
            partial: false,
            status: SegmentStatus::Available,
            aes_key: None,
            media_sequence: 0,
            discontinuity_sequence: 0,
        }
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// True when `time` falls inside `[start_time, end_time)`.
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && time < self.end_time
    }

    /// Identity key used by the prefetch cache.
    pub fn identity(&self) -> SegmentIdentity {
        SegmentIdentity {
            uri: self.uris.first().cloned().unwrap_or_default(),
            start_byte: self.start_byte,
            start_time_bits: self.start_time.to_bits(),
        }
    }

    /// Same-period properties: two references sharing these can be
    /// appended back to back without touching sink state.
    pub fn same_stream_properties(&self, other: &SegmentReference) -> bool {
        self.timestamp_offset == other.timestamp_offset
            && self.append_window_start == other.append_window_start
            && self.append_window_end == other.append_window_end
    }
}

/// Hashable identity of a segment reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentIdentity {
    pub uri: String,
    pub start_byte: u64,
    start_time_bits: u64,
}
