//! Session worker tests against an in-memory peer connection
//!
//! The worker's API is synchronous and called from host threads, so these are
//! plain tests that own a `LivePipe` and drive tracks through its runtime.

mod common;

use async_trait::async_trait;
use common::*;
use tokio_test::{assert_err, assert_ok};
use livepipe::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Inverts every byte
#[derive(Default)]
struct Invert {
    calls: AtomicUsize,
}

#[async_trait]
impl FrameProcessor for Invert {
    fn process(&self, frame: Frame) -> anyhow::Result<Frame> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let data: Vec<u8> = frame.data.iter().map(|b| !b).collect();
        Ok(frame.with_data(data))
    }
}

/// Never finishes a batch within the watchdog
struct Hanging;

#[async_trait]
impl FrameProcessor for Hanging {
    fn process(&self, frame: Frame) -> anyhow::Result<Frame> {
        Ok(frame)
    }

    async fn process_batch(&self, _frames: Vec<Frame>) -> anyhow::Result<Vec<Frame>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingSink {
    tracks: Mutex<Vec<String>>,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

#[async_trait]
impl MediaSink for RecordingSink {
    fn add_track(&self, track: SharedTrack) -> PipelineResult<()> {
        self.tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn start(&self) -> PipelineResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> PipelineResult<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn remote_video() -> (SharedTrack, FrameSender) {
    let (track, sender) = ChannelTrack::new(MediaKind::Video);
    (track as SharedTrack, sender)
}

/// Collect events until one matches `until` or two seconds pass
fn collect_events(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    until: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(event) => {
                let done = until(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    seen
}

// ============================================================================
// SEND/RECEIVE
// ============================================================================

#[test]
fn test_send_recv_passthrough() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![Arc::clone(&remote)]);
    let session = pipe.session(peer.clone()).build().unwrap();
    assert_eq!(session.state(), SessionState::Created);

    let answer = assert_ok!(session.process_offer(offer(), None));
    assert_eq!(answer.sdp_type, SdpType::Answer);
    assert_eq!(session.state(), SessionState::Live);

    let added = peer.added_tracks();
    assert_eq!(added.len(), 1);
    assert_eq!(session.input_video_track().unwrap().id(), remote.id());
    assert_eq!(session.output_video_track().unwrap().id(), remote.id());
    assert!(session.input_audio_track().is_none());

    for n in 0..3 {
        sender.send(video_frame(n)).unwrap();
    }
    for n in 0..3 {
        assert_eq!(recv(&pipe, &added[0]), Some(video_frame(n)));
    }

    session.stop(None);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(wait_for(Duration::from_secs(2), || peer.is_closed()));
}

#[test]
fn test_send_recv_inline_processor_keeps_timing() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer.clone())
        .async_processing(false)
        .video_processor_factory(Invert::default)
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    let added = peer.added_tracks();
    for n in 0..10 {
        sender.send(video_frame(n)).unwrap();
    }
    for n in 0..10u8 {
        let frame = recv(&pipe, &added[0]).unwrap();
        assert_eq!(frame.pts, n as i64 * 3000);
        assert_eq!(frame.data.as_ref(), &[!n; 4]);
    }

    let invert = session.video_processor_as::<Invert>().unwrap();
    assert_eq!(invert.calls.load(Ordering::SeqCst), 10);
    session.stop(None);
}

#[test]
fn test_send_recv_async_processor_catches_up() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer.clone())
        .video_processor_factory(Invert::default)
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    let added = peer.added_tracks();
    let mut saw_processed = false;
    for n in 1..=30u8 {
        sender.send(video_frame(n)).unwrap();
        let frame = recv(&pipe, &added[0]).unwrap();
        assert_eq!(frame.pts, n as i64 * 3000);
        if frame.data.iter().all(|b| *b > 127) {
            saw_processed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(saw_processed);
    session.stop(None);
}

#[test]
fn test_sendback_disabled_keeps_output_local() {
    let pipe = pipe();
    let (remote, _sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer.clone())
        .sendback_video(false)
        .video_processor_factory(Invert::default)
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    assert!(peer.added_tracks().is_empty());
    assert!(session.output_video_track().is_some());
    session.stop(None);
}

#[test]
fn test_send_recv_routes_through_mixer() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer.clone())
        .video_mixer(
            |frames: &[Option<Frame>]| -> anyhow::Result<Frame> {
                Ok(Frame::video(1, 1, PixelFormat::Gray8, vec![frames.len() as u8]))
            },
            MixTrackConfig::default(),
        )
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    let mix = session.video_mix_track().unwrap();
    assert_eq!(mix.input_count(), 1);
    assert_eq!(session.output_video_track().unwrap().id(), mix.id());

    sender.send(video_frame(1)).unwrap();
    let added = peer.added_tracks();
    let frame = recv(&pipe, &added[0]).unwrap();
    assert_eq!(frame.data.as_ref(), &[1]);

    session.stop(None);
    assert_eq!(mix.ready_state(), ReadyState::Ended);
    assert!(session.registry().is_empty());
}

#[test]
fn test_session_registry_is_released_with_session() {
    let pipe = pipe();
    let (remote, _sender) = remote_video();
    let session = pipe
        .session(FakePeer::new(vec![Arc::clone(&remote)]))
        .video_mixer(
            |_: &[Option<Frame>]| -> anyhow::Result<Frame> {
                Ok(Frame::video(1, 1, PixelFormat::Gray8, vec![0]))
            },
            MixTrackConfig::default(),
        )
        .build()
        .unwrap();

    // The builder's mixer is registered before negotiation.
    let registry = session.registry();
    assert_eq!(registry.len(), 1);
    let mix = session.video_mix_track().unwrap();
    assert!(Arc::ptr_eq(&registry.mix_track("video-mix").unwrap(), &mix));

    // Host stages registered on the session share its lifetime.
    let factory: ProcessorFactory = Arc::new(|| ProcessorHandle::new(Invert::default()));
    let process = registry.create_process_track(&remote, "invert", &factory);
    assert!(Arc::ptr_eq(
        &process,
        &registry.create_process_track(&remote, "invert", &factory)
    ));
    assert_eq!(registry.len(), 2);

    session.process_offer(offer(), None).unwrap();
    session.stop(None);
    assert!(session.registry().is_empty());
    assert_eq!(process.ready_state(), ReadyState::Ended);
    assert_eq!(mix.ready_state(), ReadyState::Ended);
}

#[test]
fn test_input_sink_records_until_track_ends() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let sink = Arc::new(RecordingSink::default());
    let factory_sink = Arc::clone(&sink);
    let session = pipe
        .session(peer.clone())
        .in_sink_factory(move || Arc::clone(&factory_sink) as Arc<dyn MediaSink>)
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    assert_eq!(sink.started.load(Ordering::SeqCst), 1);
    assert_eq!(sink.tracks.lock().unwrap().len(), 1);

    // Pulling the outgoing proxy starts the relay pump over the input.
    sender.send(video_frame(1)).unwrap();
    let added = peer.added_tracks();
    assert!(recv(&pipe, &added[0]).is_some());

    drop(sender);
    assert!(wait_for(Duration::from_secs(2), || {
        sink.stopped.load(Ordering::SeqCst) == 1
    }));
    session.stop(None);
}

// ============================================================================
// RECEIVE ONLY
// ============================================================================

#[test]
fn test_recv_only_feeds_receiver() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer.clone())
        .mode(SessionMode::RecvOnly)
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    assert!(peer.added_tracks().is_empty());
    let receiver = session.video_receiver().unwrap();
    assert!(receiver.is_started());
    assert!(session.audio_receiver().is_some());

    for n in 0..3 {
        sender.send(video_frame(n)).unwrap();
    }
    let mut frames = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while frames.len() < 3 && Instant::now() < deadline {
        frames.extend(receiver.get_frames(Some(Duration::from_millis(200))).unwrap_or_default());
    }
    let pts: Vec<i64> = frames.iter().map(|f| f.pts).collect();
    assert_eq!(pts, vec![0, 3000, 6000]);

    session.stop(None);
    let err = receiver.get_frame(Some(Duration::from_millis(10))).unwrap_err();
    assert_eq!(err.error_code(), "CLOSED");
}

#[test]
fn test_recv_only_receiver_stops_when_input_ends() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer)
        .config(SessionConfig::recv_only())
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    let receiver = session.video_receiver().unwrap();
    sender.send(video_frame(1)).unwrap();
    assert_eq!(receiver.get_frame(Some(Duration::from_secs(2))).unwrap().pts, 3000);

    drop(sender);
    assert!(wait_for(Duration::from_secs(2), || receiver.is_stopped()));
    session.stop(None);
}

// ============================================================================
// SEND ONLY
// ============================================================================

#[test]
fn test_send_only_streams_source_track() {
    let pipe = pipe();
    let source = Arc::new(SourceTrack::video(video_frame(9)).unwrap());
    let peer = FakePeer::receive_only(vec![MediaKind::Video]);
    let session = pipe
        .session(peer.clone())
        .mode(SessionMode::SendOnly)
        .source_video_track(source.clone())
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    let added = peer.added_tracks();
    assert_eq!(added.len(), 1);
    assert!(session.output_video_track().is_some());
    assert!(session.input_video_track().is_none());

    let frame = recv(&pipe, &added[0]).unwrap();
    assert_eq!(frame.data, video_frame(9).data);

    session.stop(None);
    // Only the session's proxy is released; the source keeps running.
    assert_eq!(source.ready_state(), ReadyState::Live);
}

#[test]
fn test_send_only_uses_mixer_as_source() {
    let pipe = pipe();
    let peer = FakePeer::receive_only(vec![MediaKind::Video, MediaKind::Audio]);
    let session = pipe
        .session(peer.clone())
        .mode(SessionMode::SendOnly)
        .video_mixer(
            |_: &[Option<Frame>]| -> anyhow::Result<Frame> {
                Ok(Frame::video(1, 1, PixelFormat::Gray8, vec![42]))
            },
            MixTrackConfig::default(),
        )
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    // No audio source is configured, so only video is attached.
    let added = peer.added_tracks();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].kind(), MediaKind::Video);

    let frame = recv(&pipe, &added[0]).unwrap();
    assert_eq!(frame.data.as_ref(), &[42]);
    session.stop(None);
}

#[test]
fn test_build_rejects_source_of_wrong_kind() {
    let pipe = pipe();
    let (audio, _sender) = ChannelTrack::new(MediaKind::Audio);
    let err = pipe
        .session(FakePeer::receive_only(vec![MediaKind::Video]))
        .source_video_track(audio)
        .build()
        .unwrap_err();
    assert_eq!(err.error_code(), "UNSUPPORTED_TRACK_KIND");
}

// ============================================================================
// NEGOTIATION
// ============================================================================

#[test]
fn test_process_offer_times_out() {
    let pipe = pipe();
    let peer = FakePeer::with_behaviour(OfferBehaviour::Hang);
    let session = pipe.session(peer).build().unwrap();

    let started = Instant::now();
    let err = session
        .process_offer(offer(), Some(Duration::from_millis(200)))
        .unwrap_err();
    assert_eq!(err.error_code(), "TIMEOUT");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_negotiation_error_is_reraised() {
    let pipe = pipe();
    let peer = FakePeer::with_behaviour(OfferBehaviour::Reject);
    let session = pipe.session(peer).build().unwrap();

    let err = session.process_offer(offer(), None).unwrap_err();
    assert_eq!(err.error_code(), "NEGOTIATION_FAILED");
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_second_offer_is_invalid_state() {
    let pipe = pipe();
    let (remote, _sender) = remote_video();
    let session = pipe.session(FakePeer::new(vec![remote])).build().unwrap();
    session.process_offer(offer(), None).unwrap();

    let err = assert_err!(session.process_offer(offer(), None));
    assert_eq!(err.error_code(), "INVALID_STATE");
    assert_eq!(session.state(), SessionState::Live);
    session.stop(None);
}

#[test]
fn test_session_with_factory_receives_rtc_configuration() {
    let pipe = pipe();
    let seen = Arc::new(Mutex::new(None));
    let seen_in_factory = Arc::clone(&seen);
    let session = pipe
        .session_with(move |rtc: &RtcConfiguration| {
            *seen_in_factory.lock().unwrap() = Some(rtc.clone());
            Ok(FakePeer::receive_only(vec![MediaKind::Video]) as Arc<dyn PeerConnection>)
        })
        .rtc_configuration(RtcConfiguration::host_only())
        .build()
        .unwrap();

    assert_eq!(
        seen.lock().unwrap().as_ref(),
        Some(&RtcConfiguration::host_only())
    );
    assert_eq!(session.state(), SessionState::Created);
}

#[test]
fn test_build_validates_config() {
    let pipe = pipe();
    let err = pipe
        .session(FakePeer::receive_only(vec![MediaKind::Video]))
        .rtc_configuration(RtcConfiguration {
            ice_servers: vec![IceServer::stun("turn:turn.example.org")],
        })
        .build()
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[test]
fn test_transport_failure_closes_session() {
    let pipe = pipe();
    let (remote, _sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe.session(peer.clone()).build().unwrap();
    let mut events = session.events();
    session.process_offer(offer(), None).unwrap();

    peer.emit_state(TransportState::Failed);
    assert!(wait_for(Duration::from_secs(2), || session.state().is_closed()));
    assert!(wait_for(Duration::from_secs(2), || peer.is_closed()));

    let closed = SessionEvent::StateChanged {
        from: SessionState::Live,
        to: SessionState::Closed,
    };
    let seen = collect_events(&mut events, |event| *event == closed);
    assert!(seen.iter().any(|event| matches!(
        event,
        SessionEvent::TransportStateChanged {
            state: TransportState::Failed
        }
    )));
    assert!(seen.iter().any(|event| matches!(
        event,
        SessionEvent::TrackAdded {
            role: TrackRole::Input,
            ..
        }
    )));
    assert!(seen.contains(&closed));
}

#[test]
fn test_stop_is_idempotent() {
    let pipe = pipe();
    let (remote, _sender) = remote_video();
    let session = pipe
        .session(FakePeer::new(vec![remote]))
        .video_processor_factory(Invert::default)
        .build()
        .unwrap();
    let mut state = session.subscribe_state();
    session.process_offer(offer(), None).unwrap();
    assert!(session.video_processor().is_some());

    session.stop(None);
    session.stop(Some(Duration::from_millis(10)));
    assert_eq!(*state.borrow_and_update(), SessionState::Closed);
    assert!(session.video_processor().is_none());
}

#[test]
fn test_stuck_processor_tears_session_down() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let config = SessionConfig {
        processor_watchdog: Duration::from_millis(100),
        ..Default::default()
    };
    let session = pipe
        .session(peer.clone())
        .config(config)
        .video_processor_factory(|| Hanging)
        .build()
        .unwrap();
    let mut events = session.events();
    session.process_offer(offer(), None).unwrap();

    sender.send(video_frame(1)).unwrap();
    let added = peer.added_tracks();
    // The first frame passes through while the worker hangs on it.
    assert!(recv(&pipe, &added[0]).is_some());

    assert!(wait_for(Duration::from_secs(3), || session.state().is_closed()));
    assert!(wait_for(Duration::from_secs(2), || peer.is_closed()));
    let seen = collect_events(&mut events, |event| {
        matches!(event, SessionEvent::ProcessorFailed { .. })
    });
    assert!(seen
        .iter()
        .any(|event| matches!(event, SessionEvent::ProcessorFailed { .. })));
}

#[test]
fn test_blocking_processor_tears_session_down() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let config = SessionConfig {
        processor_watchdog: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let session = pipe
        .session(peer.clone())
        .config(config)
        .video_frame_callback(|frame| {
            std::thread::sleep(Duration::from_secs(3));
            Ok(frame)
        })
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    sender.send(video_frame(1)).unwrap();
    let added = peer.added_tracks();
    assert!(recv(&pipe, &added[0]).is_some());
    let started = Instant::now();

    // Detected while the callback is still sleeping on the worker thread.
    assert!(wait_for(Duration::from_millis(1500), || session.state().is_closed()));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(wait_for(Duration::from_secs(2), || peer.is_closed()));
}

// ============================================================================
// CALLBACKS
// ============================================================================

#[test]
fn test_update_callbacks_swaps_frame_callback() {
    let pipe = pipe();
    let (remote, sender) = remote_video();
    let peer = FakePeer::new(vec![remote]);
    let session = pipe
        .session(peer.clone())
        .async_processing(false)
        .video_frame_callback(|frame| Ok(frame.with_data(vec![1; 4])))
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();
    let added = peer.added_tracks();

    sender.send(video_frame(0)).unwrap();
    assert_eq!(recv(&pipe, &added[0]).unwrap().data.as_ref(), &[1; 4]);

    session
        .update_video_callbacks(
            ProcessorCallbacks::default().with_frame(|frame| Ok(frame.with_data(vec![2; 4]))),
        )
        .unwrap();
    sender.send(video_frame(1)).unwrap();
    assert_eq!(recv(&pipe, &added[0]).unwrap().data.as_ref(), &[2; 4]);

    let err = session
        .update_audio_callbacks(ProcessorCallbacks::default())
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    session.stop(None);
}

#[test]
fn test_update_callbacks_rejects_custom_processor() {
    let pipe = pipe();
    let (remote, _sender) = remote_video();
    let session = pipe
        .session(FakePeer::new(vec![remote]))
        .video_processor_factory(Invert::default)
        .build()
        .unwrap();
    session.process_offer(offer(), None).unwrap();

    assert!(session.video_processor_as::<Invert>().is_some());
    assert!(session.video_processor_as::<CallbackProcessor>().is_none());
    assert!(session.audio_processor_as::<Invert>().is_none());
    let err = session
        .update_video_callbacks(ProcessorCallbacks::default())
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    session.stop(None);
}
