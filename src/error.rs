//! Error taxonomy for the streaming engine
//!
//! Every error carries a severity (can playback continue?), a category
//! (which subsystem produced it) and a code. Observers may mark an error
//! as handled to suppress the failure callback.

use thiserror::Error;

use crate::manifest::ContentType;

/// How bad an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Playback can continue; the engine will retry or route around it.
    Recoverable,
    /// Playback cannot continue without intervention.
    Critical,
}

/// Which subsystem produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Network,
    Media,
    Player,
    Manifest,
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// The server answered with a non-success HTTP status.
    BadHttpStatus,
    /// The request failed below the HTTP layer.
    HttpError,
    /// An attempt- or request-level timeout fired.
    Timeout,
    /// A segment the manifest promised is not available.
    SegmentMissing,
    /// The operation was aborted (destroy, switch, or explicit abort).
    OperationAborted,
    /// The sink rejected an append because its buffer is full.
    QuotaExceeded,
    /// A sink operation failed for a reason other than quota.
    MediaSourceOperationFailed,
    /// The engine could not be started.
    StreamingEngineStartupFailure,
    /// Decryption or transmuxing of a segment failed.
    ContentTransformationFailed,
    /// An inband event used a scheme the engine does not understand.
    UnsupportedScheme,
}

/// Main error type for the streaming engine.
#[derive(Error, Debug, Clone)]
#[error("{code:?} [{severity:?}/{category:?}]: {message}")]
pub struct StreamingError {
    pub severity: Severity,
    pub category: Category,
    pub code: Code,
    pub message: String,
    /// Content type the error applies to, when track-scoped
    /// (always set for `QuotaExceeded`).
    pub content_type: Option<ContentType>,
    /// Set by an observer to suppress the failure callback.
    pub handled: bool,
}

impl StreamingError {
    pub fn new(
        severity: Severity,
        category: Category,
        code: Code,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            code,
            message: message.into(),
            content_type: None,
            handled: false,
        }
    }

    /// A recoverable network error.
    pub fn network(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Recoverable, Category::Network, code, message)
    }

    /// A critical media error.
    pub fn media(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, Category::Media, code, message)
    }

    /// The distinguished abort error. Never surfaced to the owner.
    pub fn aborted() -> Self {
        Self::new(
            Severity::Recoverable,
            Category::Player,
            Code::OperationAborted,
            "operation aborted",
        )
    }

    /// Quota-exceeded for a given track. Recoverable; the caller decides
    /// whether to retry after eviction.
    pub fn quota_exceeded(content_type: ContentType) -> Self {
        let mut e = Self::new(
            Severity::Recoverable,
            Category::Media,
            Code::QuotaExceeded,
            format!("append-buffer quota exceeded for {content_type}"),
        );
        e.content_type = Some(content_type);
        e
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn into_critical(mut self) -> Self {
        self.severity = Severity::Critical;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.code == Code::OperationAborted
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, StreamingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_carries_content_type() {
        let e = StreamingError::quota_exceeded(ContentType::Video);
        assert_eq!(e.severity, Severity::Recoverable);
        assert_eq!(e.code, Code::QuotaExceeded);
        assert_eq!(e.content_type, Some(ContentType::Video));
    }

    #[test]
    fn test_aborted_is_distinguished() {
        let e = StreamingError::aborted();
        assert!(e.is_aborted());
        assert_eq!(e.severity, Severity::Recoverable);
    }

    #[test]
    fn test_into_critical() {
        let e = StreamingError::network(Code::HttpError, "boom").into_critical();
        assert_eq!(e.severity, Severity::Critical);
        assert_eq!(e.category, Category::Network);
    }

    #[test]
    fn test_display_includes_code() {
        let e = StreamingError::network(Code::Timeout, "request timed out");
        let s = e.to_string();
        assert!(s.contains("Timeout"));
        assert!(s.contains("request timed out"));
    }
}
