//! Networking capability
//!
//! The engine never talks to a transport directly: it hands a request to
//! the [`Networking`] capability and gets back an [`AbortableOperation`].
//! Retry and backoff policy live in the networking implementation; the
//! engine only declares the budget through [`RetryParameters`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::RetryParameters;
use crate::error::{Result, StreamingError};

/// What a request is for. Lets the networking layer pick policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Manifest,
    Segment,
    Key,
    License,
}

/// A request the engine wants performed.
#[derive(Debug, Clone)]
pub struct NetRequest {
    pub request_type: RequestType,
    /// Primary URI plus fallbacks, in preference order.
    pub uris: Vec<String>,
    /// Inclusive start byte and optional inclusive end byte.
    pub byte_range: Option<(u64, Option<u64>)>,
    pub retry: RetryParameters,
}

impl NetRequest {
    pub fn segment(uris: Vec<String>, retry: RetryParameters) -> Self {
        Self {
            request_type: RequestType::Segment,
            uris,
            byte_range: None,
            retry,
        }
    }

    pub fn byte_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.byte_range = Some((start, end));
        self
    }
}

/// A completed response.
#[derive(Debug, Clone)]
pub struct NetResponse {
    pub data: Bytes,
    /// The URI that actually served the response.
    pub uri: String,
    pub headers: HashMap<String, String>,
}

/// Sentinel for "size unknown" in [`AbortHandle::bytes_remaining`].
const BYTES_UNKNOWN: u64 = u64::MAX;

/// Cheap handle onto an in-flight operation: abort it, or inspect how
/// much is left to transfer. `abort` is idempotent and safe to call
/// after completion.
#[derive(Clone)]
pub struct AbortHandle {
    token: CancellationToken,
    bytes_remaining: Arc<AtomicU64>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bytes left to transfer, when the producer reports progress.
    pub fn bytes_remaining(&self) -> Option<u64> {
        match self.bytes_remaining.load(Ordering::Relaxed) {
            BYTES_UNKNOWN => None,
            n => Some(n),
        }
    }

    /// Producer side: report transfer progress.
    pub fn set_bytes_remaining(&self, bytes: u64) {
        self.bytes_remaining.store(bytes, Ordering::Relaxed);
    }
}

/// An asynchronous operation that can be aborted from the outside.
///
/// Aborting resolves the awaiter with the distinguished
/// `OperationAborted` error; the producer's work is cancelled at its next
/// suspension point.
pub struct AbortableOperation<T> {
    handle: AbortHandle,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> AbortableOperation<T> {
    /// Wrap a future. The future runs on the current runtime and is
    /// dropped if the operation is aborted first.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let bytes_remaining = Arc::new(AtomicU64::new(BYTES_UNKNOWN));
        let (tx, rx) = oneshot::channel();
        let worker_token = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = worker_token.cancelled() => Err(StreamingError::aborted()),
                r = fut => r,
            };
            let _ = tx.send(result);
        });
        Self {
            handle: AbortHandle {
                token,
                bytes_remaining,
            },
            rx,
        }
    }

    /// An operation that is already complete.
    pub fn completed(value: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self {
            handle: AbortHandle {
                token: CancellationToken::new(),
                bytes_remaining: Arc::new(AtomicU64::new(BYTES_UNKNOWN)),
            },
            rx,
        }
    }

    pub fn handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Await the result. An aborted operation yields `OperationAborted`.
    pub async fn wait(self) -> Result<T> {
        if self.handle.is_aborted() {
            return Err(StreamingError::aborted());
        }
        match self.rx.await {
            Ok(r) => r,
            // Producer dropped without answering: treat as abort.
            Err(_) => Err(StreamingError::aborted()),
        }
    }
}

/// The networking capability the owner provides.
pub trait Networking: Send + Sync {
    /// Start a request. Returns immediately with an abortable operation.
    fn request(&self, request: NetRequest) -> AbortableOperation<NetResponse>;
}
