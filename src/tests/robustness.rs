//! Failure policy and live-window behavior
//!
//! Quota-exceeded recovery, stream disabling, timeout handling, text
//! forgiveness, the failure-callback/retry loop, live availability
//! windows and producer reference time.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::crypto::SoftwareCrypto;
use crate::error::Code;
use crate::events::EngineEvent;
use crate::manifest::{ContentType, SegmentStatus};
use crate::timeline::PresentationTimeline;

use super::fixtures::*;

/// A single quota failure recovers silently: evict, retry, move on.
#[tokio::test(start_paused = true)]
async fn test_quota_exceeded_single_recovery() {
    let h = harness(test_config());
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.sink.has_media(ContentType::Video, "video_0")).await);

    h.sink.fail_appends_with_quota(ContentType::Video, 1);
    assert!(
        eventually(60.0, || h.sink.has_media(ContentType::Video, "video_1")).await,
        "append did not recover from quota pressure"
    );
    assert!(h.owner.errors.lock().is_empty());
    assert!(h.owner.failures.lock().is_empty());
    h.engine.destroy().await;
}

/// Persistent quota failures surface a critical error after the retry
/// budget, and streaming halts until retried.
#[tokio::test(start_paused = true)]
async fn test_quota_exceeded_exhaustion_surfaces_critical() {
    let h = harness(test_config());
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.sink.has_media(ContentType::Video, "video_0")).await);

    h.sink.fail_appends_with_quota(ContentType::Video, 100);
    assert!(
        eventually(60.0, || h.engine.fatal_error().is_some()).await,
        "exhausted quota never surfaced"
    );
    let error = h.engine.fatal_error().unwrap();
    assert_eq!(error.code, Code::QuotaExceeded);
    assert_eq!(error.content_type, Some(ContentType::Video));

    // Lifting the pressure and retrying resumes playback.
    h.sink.fail_appends_with_quota(ContentType::Video, 0);
    assert!(h.engine.retry(0.1).await);
    assert!(
        eventually(180.0, || h.sink.eos_calls() >= 1).await,
        "playback did not resume after retry"
    );
    h.engine.destroy().await;
}

/// An HTTP failure on an eligible category asks the owner to disable
/// the stream; when the owner routes around it, no error surfaces.
#[tokio::test(start_paused = true)]
async fn test_stream_disable_handled_by_owner() {
    let h = harness(test_config());
    h.owner.disable_result.store(true, Ordering::SeqCst);
    h.net.fail_with("video_1", Code::BadHttpStatus);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(
        eventually(60.0, || !h.owner.disable_calls.lock().is_empty()).await,
        "owner was never asked to disable the stream"
    );
    assert!(h.owner.disable_calls.lock().contains(&2));
    assert!(h.engine.fatal_error().is_none());
    assert!(h.owner.failures.lock().is_empty());

    h.net.stop_failing("video_1");
    assert!(eventually(180.0, || h.sink.eos_calls() >= 1).await);
    h.engine.destroy().await;
}

/// With stream disabling off (`max_disabled_time == 0`), an HTTP error
/// goes straight to the failure callback and halts streaming.
#[tokio::test(start_paused = true)]
async fn test_http_error_without_disable_invokes_failure_callback() {
    let mut config = test_config();
    config.max_disabled_time = 0.0;
    let h = harness(config);
    h.net.fail_with("video_1", Code::HttpError);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(
        eventually(60.0, || !h.owner.failures.lock().is_empty()).await,
        "failure callback never invoked"
    );
    assert!(h.owner.disable_calls.lock().is_empty());
    assert!(h.engine.fatal_error().is_some());

    h.net.stop_failing("video_1");
    assert!(h.engine.retry(0.1).await);
    assert!(eventually(180.0, || h.sink.eos_calls() >= 1).await);
    h.engine.destroy().await;
}

/// A timeout is never recovered via stream disabling.
#[tokio::test(start_paused = true)]
async fn test_timeout_never_disables() {
    let h = harness(test_config());
    h.owner.disable_result.store(true, Ordering::SeqCst);
    h.net.fail_with("video_1", Code::Timeout);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(
        eventually(60.0, || !h.owner.failures.lock().is_empty()).await,
        "timeout never reached the failure callback"
    );
    assert!(h.owner.disable_calls.lock().is_empty());
    h.engine.destroy().await;
}

/// A missing segment is always eligible for disable recovery, even with
/// `max_disabled_time == 0`.
#[tokio::test(start_paused = true)]
async fn test_segment_missing_always_eligible_for_disable() {
    let mut config = test_config();
    config.max_disabled_time = 0.0;
    let fixture = build_fixture(None);
    // Mark the second video segment missing on the server.
    let mut refs = build_references("video", false, None);
    refs[1].status = SegmentStatus::Missing;
    let video = Arc::new(
        crate::manifest::ManifestStream::new(2, ContentType::Video, "video/mp4", "avc1.42c01e")
            .references(refs),
    );
    let variant = Arc::new(
        crate::manifest::Variant::new(100, 1_000_000)
            .audio(fixture.audio.clone())
            .video(video),
    );

    let h = harness_at(fixture, config, 0.0);
    h.owner.disable_result.store(true, Ordering::SeqCst);
    h.engine.start(variant, None).await.unwrap();

    assert!(
        eventually(60.0, || h.owner.disable_calls.lock().contains(&2)).await,
        "missing segment did not trigger disable recovery"
    );
    assert!(h.owner.failures.lock().is_empty());
    h.engine.destroy().await;
}

/// Text failures are swallowed when configured; audio/video reach end
/// of stream regardless.
#[tokio::test(start_paused = true)]
async fn test_text_failures_ignored() {
    let mut config = test_config();
    config.ignore_text_stream_failures = true;
    let h = harness(config);
    h.net.fail_with("text_1", Code::HttpError);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(
        eventually(180.0, || h.sink.eos_calls() >= 1).await,
        "audio/video did not finish despite ignored text failure"
    );
    assert!(h.owner.errors.lock().is_empty());
    assert!(h.owner.failures.lock().is_empty());
    assert!(!h.sink.has_media(ContentType::Text, "text_1"));
    h.engine.destroy().await;
}

fn live_timeline(availability_duration: f64) -> Arc<PresentationTimeline> {
    let base = tokio::time::Instant::now();
    let clock = Arc::new(move || 1_000.0 + base.elapsed().as_secs_f64());
    Arc::new(PresentationTimeline::live(1_000.0, availability_duration).with_clock(clock))
}

/// A segment past the live edge is not fetched until the availability
/// window reaches it.
#[tokio::test(start_paused = true)]
async fn test_live_waits_for_availability() {
    let h = harness_custom(
        build_fixture(None),
        test_config(),
        0.0,
        Arc::new(SoftwareCrypto),
        live_timeline(30.0),
    );
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(eventually(5.0, || h.sink.has_media(ContentType::Audio, "audio_0")).await);
    // audio_1 starts at t=10; the live edge is still behind it.
    assert!(eventually(8.5, || h.playhead.position() >= 8.0).await);
    assert!(!h.net.was_requested("audio_1"));

    assert!(
        eventually(10.0, || h.sink.has_media(ContentType::Audio, "audio_1")).await,
        "segment not fetched once the window reached it"
    );
    h.engine.destroy().await;
}

/// The availability window slides past a segment mid-fetch: the fetch
/// completes but the append is skipped.
#[tokio::test(start_paused = true)]
async fn test_live_window_slide_skips_stale_append() {
    let h = harness_custom(
        build_fixture(None),
        test_config(),
        0.0,
        Arc::new(SoftwareCrypto),
        live_timeline(15.0),
    );
    // audio_1 ([10, 20)) stays in flight until the window has slid
    // past its end: at t=40 the availability start is 25.
    h.net.set_delay("audio_1", 30.0);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(
        eventually(60.0, || h.net.was_completed("audio_1")).await,
        "delayed fetch never completed"
    );
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert!(
        !h.sink.ever_appended(ContentType::Audio, "audio_1"),
        "stale segment was appended after the window slid past it"
    );
    h.engine.destroy().await;
}

/// `prft` boxes, when enabled, surface exactly one program-date event
/// per session.
#[tokio::test(start_paused = true)]
async fn test_prft_reported_once() {
    let mut config = test_config();
    config.parse_prft_box = true;
    let h = harness(config);

    // The video init carries the mdhd timescale; both media segments
    // carry a prft box.
    h.net.set_body(
        "p0_video_init",
        Bytes::from(crate::boxes::test_support::init_segment_with_timescale(90_000)),
    );
    let ntp = (2_208_988_800u64 + 1_700_000_000) << 32;
    for label in ["video_0", "video_1"] {
        let mut payload = crate::boxes::test_support::prft_v0(1, ntp, 90_000);
        payload.extend_from_slice(label.as_bytes());
        h.net.set_body(label, Bytes::from(payload));
    }

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(180.0, || h.sink.eos_calls() >= 1).await);

    assert_eq!(
        h.bus.count(|e| matches!(e, EngineEvent::ProgramDate(_))),
        1,
        "program date must be reported exactly once"
    );
    let events = h.bus.events.lock();
    let program_date = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::ProgramDate(p) => Some(p.clone()),
            _ => None,
        })
        .unwrap();
    assert!(program_date.wall_clock_time_ms > 0.0);
    drop(events);
    h.engine.destroy().await;
}

/// Destroy mid-stream aborts quietly: no errors surface and the loops
/// stop.
#[tokio::test(start_paused = true)]
async fn test_destroy_mid_stream_is_silent() {
    let h = harness(test_config());
    h.net.set_delay("video_1", 30.0);
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.net.was_requested("video_1")).await);

    h.engine.destroy().await;
    assert!(h.owner.errors.lock().is_empty());
    assert!(h.owner.failures.lock().is_empty());
    // Destroy is idempotent.
    h.engine.destroy().await;
}
