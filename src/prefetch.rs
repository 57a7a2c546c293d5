//! Segment prefetching
//!
//! A bounded per-stream look-ahead: up to `segment_prefetch_limit`
//! segments past the playhead are fetched before the pipeline needs
//! them. Entries are keyed by segment identity and evicted LRU; in-flight
//! fetches are aborted on disposal.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::RetryParameters;
use crate::manifest::{SegmentIdentity, SegmentReference, Stream};
use crate::net::{AbortableOperation, NetRequest, NetResponse, Networking};

/// Look-ahead fetch cache for one stream.
pub struct SegmentPrefetch {
    stream: Arc<dyn Stream>,
    net: Arc<dyn Networking>,
    retry: RetryParameters,
    limit: usize,
    entries: Mutex<LruCache<SegmentIdentity, AbortableOperation<NetResponse>>>,
}

impl SegmentPrefetch {
    pub fn new(
        stream: Arc<dyn Stream>,
        net: Arc<dyn Networking>,
        retry: RetryParameters,
        limit: usize,
    ) -> Self {
        let cap = NonZeroUsize::new(limit.max(1)).unwrap();
        Self {
            stream,
            net,
            retry,
            limit,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    /// Fill the look-ahead window starting just past `reference`.
    pub fn prefetch_after(&self, reference: &SegmentReference) {
        if self.limit == 0 {
            return;
        }
        let Some(index) = self.stream.segment_index() else {
            return;
        };
        let mut entries = self.entries.lock();
        let mut current = index.next_after(reference);
        let mut fetched = 0;
        while let Some(r) = current {
            if fetched >= self.limit {
                break;
            }
            let key = r.identity();
            if !entries.contains(&key) {
                tracing::debug!(
                    stream = self.stream.id(),
                    start = r.start_time,
                    "prefetching segment"
                );
                let mut request = NetRequest::segment(r.uris().to_vec(), self.retry.clone());
                request = request.byte_range(r.start_byte, r.end_byte);
                let op = self.net.request(request);
                if let Some((_, evicted)) = entries.push(key, op) {
                    evicted.abort();
                }
            }
            fetched += 1;
            current = index.next_after(&r);
        }
    }

    /// Take the prefetched fetch for `reference`, when present. The
    /// caller awaits the returned operation instead of issuing its own.
    pub fn take(&self, reference: &SegmentReference) -> Option<AbortableOperation<NetResponse>> {
        self.entries.lock().pop(&reference.identity())
    }

    /// Number of entries currently held (in flight or complete).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Abort and drop every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        while let Some((_, op)) = entries.pop_lru() {
            op.abort();
        }
    }
}

impl Drop for SegmentPrefetch {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::manifest::{ContentType, ManifestStream};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNet {
        requests: AtomicUsize,
    }

    impl Networking for CountingNet {
        fn request(&self, request: NetRequest) -> AbortableOperation<NetResponse> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            AbortableOperation::completed(Ok(NetResponse {
                data: Bytes::from_static(b"seg"),
                uri: request.uris[0].clone(),
                headers: HashMap::new(),
            }))
        }
    }

    async fn stream_with_segments(n: usize) -> Arc<dyn Stream> {
        let refs = (0..n)
            .map(|i| {
                SegmentReference::new(i as f64 * 10.0, (i + 1) as f64 * 10.0, vec![format!("s{i}")])
            })
            .collect();
        let s = Arc::new(
            ManifestStream::new(1, ContentType::Video, "video/mp4", "avc1").references(refs),
        );
        s.create_segment_index().await.unwrap();
        s
    }

    fn reference(i: usize) -> SegmentReference {
        SegmentReference::new(i as f64 * 10.0, (i + 1) as f64 * 10.0, vec![format!("s{i}")])
    }

    #[tokio::test]
    async fn test_prefetch_respects_limit() {
        let net = Arc::new(CountingNet {
            requests: AtomicUsize::new(0),
        });
        let stream = stream_with_segments(6).await;
        let p = SegmentPrefetch::new(stream, net.clone(), RetryParameters::default(), 2);
        p.prefetch_after(&reference(0));
        assert_eq!(net.requests.load(Ordering::SeqCst), 2);
        assert_eq!(p.len(), 2);
    }

    #[tokio::test]
    async fn test_take_consumes_entry() {
        let net = Arc::new(CountingNet {
            requests: AtomicUsize::new(0),
        });
        let stream = stream_with_segments(4).await;
        let p = SegmentPrefetch::new(stream, net.clone(), RetryParameters::default(), 2);
        p.prefetch_after(&reference(0));
        let op = p.take(&reference(1)).expect("segment 1 prefetched");
        let response = op.wait().await.unwrap();
        assert_eq!(response.uri, "s1");
        assert_eq!(p.len(), 1);
        // Re-fetching the window does not re-request held entries.
        p.prefetch_after(&reference(1));
        assert_eq!(net.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_limit_disables() {
        let net = Arc::new(CountingNet {
            requests: AtomicUsize::new(0),
        });
        let stream = stream_with_segments(4).await;
        let p = SegmentPrefetch::new(stream, net.clone(), RetryParameters::default(), 0);
        p.prefetch_after(&reference(0));
        assert_eq!(net.requests.load(Ordering::SeqCst), 0);
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let net = Arc::new(CountingNet {
            requests: AtomicUsize::new(0),
        });
        let stream = stream_with_segments(4).await;
        let p = SegmentPrefetch::new(stream, net, RetryParameters::default(), 3);
        p.prefetch_after(&reference(0));
        assert!(!p.is_empty());
        p.clear();
        assert!(p.is_empty());
    }
}
