//! Engine configuration
//!
//! All tunables are value-typed structs: the owner passes a
//! [`StreamingConfig`] at construction and may hot-reload it through
//! `StreamingEngine::configure`.

use serde::{Deserialize, Serialize};

/// Retry parameters handed to the networking layer with every request.
///
/// The backoff policy itself lives in the networking implementation; the
/// engine only declares the budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryParameters {
    /// Maximum number of attempts per request, including the first.
    pub max_attempts: u32,

    /// Base delay between attempts in seconds.
    pub base_delay_secs: f64,

    /// Fuzz factor applied to the delay (0.5 means +/- 50%).
    pub fuzz_factor: f64,

    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,

    /// Request-level timeout in seconds. Zero disables it.
    pub timeout_secs: f64,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_secs: 1.0,
            fuzz_factor: 0.5,
            backoff_factor: 2.0,
            timeout_secs: 30.0,
        }
    }
}

/// What to do with buffered data when playback crosses a period boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrossBoundaryStrategy {
    /// Keep buffered data and continue appending.
    #[default]
    Keep,
    /// Clear the buffers and refill from the boundary.
    Reset,
}

/// Streaming engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// How far ahead of the playhead to buffer, in seconds.
    pub buffering_goal: f64,

    /// How much content must be buffered before leaving a rebuffering
    /// state, in seconds.
    pub rebuffering_goal: f64,

    /// How much content behind the playhead to retain, in seconds.
    pub buffer_behind: f64,

    /// How much extra content to evict past `buffer_behind` per eviction,
    /// in seconds.
    pub eviction_goal: f64,

    /// How long a failing stream stays disabled, in seconds. Zero turns
    /// stream disabling off.
    pub max_disabled_time: f64,

    /// Maximum number of look-ahead segments to prefetch per stream.
    /// Zero disables prefetching.
    pub segment_prefetch_limit: usize,

    /// Languages whose alternate audio streams keep a shadow prefetcher
    /// alive across switches.
    pub prefetch_audio_languages: Vec<String>,

    /// Suppress prefetching for video content.
    pub disable_video_prefetch: bool,

    /// When set, text stream failures are logged but never surfaced.
    pub ignore_text_stream_failures: bool,

    /// Favor latency over robustness (smaller lead caps, eager updates).
    pub low_latency_mode: bool,

    /// Always route segments through the transmuxer even when the sink
    /// could ingest them natively.
    pub force_transmux: bool,

    /// Keep streaming text even while the text track is hidden.
    pub always_stream_text: bool,

    /// Buffered-data policy at period boundaries.
    pub cross_boundary_strategy: CrossBoundaryStrategy,

    /// Parse `prft` boxes and report a program start date.
    pub parse_prft_box: bool,

    /// Seconds subtracted from the effective append window start so a
    /// near-boundary sample is not dropped by the sink.
    pub append_window_start_fudge: f64,

    /// Seconds added to the effective append window end.
    pub append_window_end_fudge: f64,

    /// Consecutive quota-exceeded failures tolerated on one reference
    /// before the error is surfaced.
    pub quota_exceeded_max_retries: u32,

    /// Scheduling tick for the per-track update loops, in seconds.
    pub update_interval_secs: f64,

    /// Retry budget declared to the networking layer.
    pub retry_parameters: RetryParameters,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffering_goal: 10.0,
            rebuffering_goal: 2.0,
            buffer_behind: 30.0,
            eviction_goal: 1.0,
            max_disabled_time: 30.0,
            segment_prefetch_limit: 0,
            prefetch_audio_languages: Vec::new(),
            disable_video_prefetch: false,
            ignore_text_stream_failures: false,
            low_latency_mode: false,
            force_transmux: false,
            always_stream_text: false,
            cross_boundary_strategy: CrossBoundaryStrategy::Keep,
            parse_prft_box: false,
            append_window_start_fudge: 0.1,
            append_window_end_fudge: 0.1,
            quota_exceeded_max_retries: 3,
            update_interval_secs: 0.5,
            retry_parameters: RetryParameters::default(),
        }
    }
}

impl StreamingConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: StreamingConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
