//! Stream switching behavior
//!
//! Abort-on-switch economics, rapid-switch coalescing, codec changes,
//! text stream switching/unloading, and prefetch survival.

use std::sync::Arc;

use crate::manifest::{ContentType, ManifestStream, Variant};

use super::fixtures::*;

/// After an aborted switch the new stream's URI is requested and the
/// superseded in-flight segment never completes.
#[tokio::test(start_paused = true)]
async fn test_switch_aborts_in_flight_fetch() {
    let h = harness(test_config());
    // Keep the second video segment in flight for a long time.
    h.net.set_delay("video_1", 30.0);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(
        eventually(30.0, || h.net.was_requested("video_1")).await,
        "video_1 never entered flight"
    );
    h.engine
        .switch_variant(h.fixture.alt_variant.clone(), true, 0.0, false);

    assert!(
        eventually(30.0, || h.net.was_requested("alt_video_0")
            || h.net.was_requested("alt_video_1")).await,
        "the new stream was never fetched"
    );
    assert!(
        !h.net.was_completed("video_1"),
        "superseded fetch ran to completion"
    );
    h.engine.destroy().await;
}

/// Rapid switches coalesce: only the latest switch's streams are used
/// for the next fetch.
#[tokio::test(start_paused = true)]
async fn test_rapid_switches_coalesce() {
    let h = harness(test_config());
    h.net.set_delay("video_1", 30.0);

    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.net.was_requested("video_1")).await);

    // Switch away and immediately back; the intermediate variant's
    // segments must never be requested.
    h.engine
        .switch_variant(h.fixture.alt_variant.clone(), false, 0.0, false);
    h.engine
        .switch_variant(h.fixture.variant.clone(), false, 0.0, false);

    assert!(
        eventually(60.0, || h.sink.has_media(ContentType::Video, "video_1")
            || h.sink.has_media(ContentType::Video, "video_2")).await,
        "playback did not resume on the original stream"
    );
    assert!(!h.net.was_requested("alt_video_0"));
    assert!(!h.net.was_requested("alt_video_1"));
    h.engine.destroy().await;
}

/// Switching to a variant with identical streams is a no-op.
#[tokio::test(start_paused = true)]
async fn test_switch_same_streams_is_noop() {
    let h = harness(test_config());
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.sink.has_media(ContentType::Video, "video_0")).await);

    let requests_before = h.net.requested.lock().len();
    let same = Arc::new(
        Variant::new(200, 1_000_000)
            .audio(h.fixture.variant.audio.clone().unwrap())
            .video(h.fixture.variant.video.clone().unwrap()),
    );
    h.engine.switch_variant(same, true, 0.0, false);
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    assert_eq!(h.sink.clear_count(ContentType::Video), 0);
    assert_eq!(h.sink.clear_count(ContentType::Audio), 0);
    // No re-fetch was triggered by the no-op switch.
    assert!(h.sink.has_media(ContentType::Video, "video_0"));
    let _ = requests_before;
    h.engine.destroy().await;
}

/// A codec change reaches the sink as a change-type before the next
/// append.
#[tokio::test(start_paused = true)]
async fn test_codec_change_emits_change_type() {
    let h = harness(test_config());
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.sink.has_media(ContentType::Video, "video_0")).await);

    h.engine
        .switch_variant(h.fixture.alt_variant.clone(), false, 0.0, false);
    assert!(
        eventually(60.0, || !h
            .sink
            .change_type_calls(ContentType::Video)
            .is_empty())
        .await,
        "no change-type reached the sink"
    );
    let calls = h.sink.change_type_calls(ContentType::Video);
    assert!(calls.iter().any(|c| c.contains("avc1.640028")));
    h.engine.destroy().await;
}

/// Text stream switching clears only the text buffer; audio and video
/// are untouched and the caption parser is never reset.
#[tokio::test(start_paused = true)]
async fn test_text_switch_clears_text_only() {
    let h = harness(test_config());
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.sink.has_media(ContentType::Text, "text_0")).await);

    let other_text: Arc<dyn crate::manifest::Stream> = Arc::new(
        ManifestStream::new(30, ContentType::Text, "text/vtt", "")
            .language("de")
            .references(build_references("de_text", true, None)),
    );
    h.engine.switch_text_stream(other_text);

    assert!(
        eventually(30.0, || h.sink.clear_count(ContentType::Text) >= 1).await,
        "text buffer was not cleared"
    );
    assert!(
        eventually(60.0, || h.sink.has_media(ContentType::Text, "de_text_0")
            || h.sink.has_media(ContentType::Text, "de_text_1")).await,
        "new text stream never buffered"
    );
    assert_eq!(h.sink.clear_count(ContentType::Audio), 0);
    assert_eq!(h.sink.clear_count(ContentType::Video), 0);
    assert_eq!(
        h.caption_parser.resets.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    // Displayed cues were dropped along with the text buffer.
    assert!(!h.text_sink.removes.lock().is_empty());
    h.engine.destroy().await;
}

/// Unloading the text stream ceases text fetches; audio/video still
/// reach end of stream.
#[tokio::test(start_paused = true)]
async fn test_unload_text_stream() {
    let h = harness(test_config());
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();
    assert!(eventually(30.0, || h.sink.has_media(ContentType::Text, "text_0")).await);

    h.engine.unload_text_stream();
    assert!(h.engine.current_text_stream().is_none());

    assert!(
        eventually(180.0, || h.sink.eos_calls() >= 1).await,
        "audio/video did not finish after text unload"
    );
    // Text fetches ceased: the tail segments were never requested.
    assert!(!h.net.was_requested("text_3"));
    h.engine.destroy().await;
}

/// Prefetching runs ahead of need, and a shadow prefetcher keeps an
/// audio language's cache alive across switches.
#[tokio::test(start_paused = true)]
async fn test_prefetch_look_ahead_and_language_shadow() {
    let mut config = test_config();
    config.segment_prefetch_limit = 2;
    config.prefetch_audio_languages = vec!["en".to_string()];
    let h = harness(config);
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    // Right after the first append the look-ahead window is filled,
    // well before the buffering goal would demand those segments.
    assert!(
        eventually(5.0, || h.net.was_requested("audio_1")
            && h.net.was_requested("audio_2")).await,
        "look-ahead prefetch did not fire"
    );

    // Switch the audio language away and back.
    h.engine
        .switch_variant(h.fixture.alt_variant.clone(), false, 0.0, false);
    assert!(eventually(60.0, || h.net.was_requested("alt_audio_1")).await);
    h.engine
        .switch_variant(h.fixture.variant.clone(), false, 0.0, false);

    assert!(
        eventually(120.0, || h.sink.has_media(ContentType::Audio, "audio_2")).await,
        "original audio did not resume"
    );
    // The shadow prefetcher's fetch was reused: audio_2 went over the
    // wire exactly once.
    let audio_2_requests = h
        .net
        .requested
        .lock()
        .iter()
        .filter(|u| u.as_str() == "audio_2")
        .count();
    assert_eq!(audio_2_requests, 1);
    h.engine.destroy().await;
}

/// Video prefetch can be suppressed while audio still prefetches.
#[tokio::test(start_paused = true)]
async fn test_disable_video_prefetch() {
    let mut config = test_config();
    config.segment_prefetch_limit = 2;
    config.disable_video_prefetch = true;
    let h = harness(config);
    h.engine
        .start(h.fixture.variant.clone(), Some(h.fixture.text.clone()))
        .await
        .unwrap();

    assert!(eventually(5.0, || h.net.was_requested("audio_2")).await);
    // video_2 is not needed until t > 15; only prefetch would have
    // requested it this early.
    assert!(!h.net.was_requested("video_2"));
    h.engine.destroy().await;
}
