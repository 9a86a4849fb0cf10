//! Tests for track lifecycle and host-fed channel tracks

use livepipe_core::*;
use std::time::Duration;

#[tokio::test]
async fn test_lifecycle_transition_is_one_way() {
    let lifecycle = TrackLifecycle::new(MediaKind::Video);
    assert_eq!(lifecycle.state(), ReadyState::Live);
    assert!(lifecycle.end());
    assert!(!lifecycle.end());
    assert_eq!(lifecycle.state(), ReadyState::Ended);

    // Already ended: resolves immediately
    tokio::time::timeout(Duration::from_millis(100), lifecycle.ended())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lifecycle_ids_are_unique() {
    let a = TrackLifecycle::new(MediaKind::Audio);
    let b = TrackLifecycle::new(MediaKind::Audio);
    assert_ne!(a.id(), b.id());

    let named = TrackLifecycle::with_id("camera", MediaKind::Video);
    assert_eq!(named.id(), "camera");
    assert_eq!(named.kind(), MediaKind::Video);
}

#[tokio::test]
async fn test_channel_track_delivers_then_ends() {
    let (track, sender) = ChannelTrack::new(MediaKind::Video);
    let frame = Frame::video(1, 1, PixelFormat::Gray8, vec![9u8]);
    sender.send(frame.clone()).unwrap();
    drop(sender);

    assert_eq!(track.recv().await.unwrap(), Some(frame));
    assert_eq!(track.recv().await.unwrap(), None);
    assert_eq!(track.ready_state(), ReadyState::Ended);
}

#[tokio::test]
async fn test_channel_track_stop_rejects_further_sends() {
    let (track, sender) = ChannelTrack::new(MediaKind::Audio);
    track.stop();
    track.stop();
    assert_eq!(track.recv().await.unwrap(), None);

    drop(track);
    assert!(sender.is_closed());
    let err = sender
        .send(Frame::video(1, 1, PixelFormat::Gray8, vec![0u8]))
        .unwrap_err();
    assert_eq!(err.error_code(), "CLOSED");
}

#[test]
fn test_runtime_from_outside_async_context() {
    let runtime = MediaRuntime::with_options(RuntimeOptions {
        worker_threads: Some(2),
        ..Default::default()
    })
    .unwrap();
    assert!(runtime.is_owned());

    let (track, sender) = ChannelTrack::new(MediaKind::Video);
    let relay = MediaRelay::new(&runtime);
    let proxy = relay.subscribe(track);
    sender.send(Frame::video(1, 1, PixelFormat::Gray8, vec![1u8])).unwrap();

    let received = runtime.block_on(async { proxy.recv().await });
    assert!(received.unwrap().is_some());
}

#[test]
fn test_runtime_current_requires_runtime() {
    assert!(MediaRuntime::current().is_err());
}
