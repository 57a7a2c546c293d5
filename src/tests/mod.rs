//! Integration testing module
//!
//! End-to-end tests for the streaming engine core:
//! - Full VOD playback across period boundaries
//! - Seeking (buffered, unbuffered, cross-period)
//! - Trick-play engagement and disengagement
//! - Inband events and encrypted segments
//! - Stream switching with in-flight abort decisions
//! - Failure policy (quota, disabling, text forgiveness)

pub mod robustness;
pub mod switching;
