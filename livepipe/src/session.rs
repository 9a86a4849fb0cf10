//! Session worker: one peer connection and the media wired through it
//!
//! A [`SessionWorker`] accepts a remote offer, wires incoming tracks through
//! the relay into process tracks, mix tracks, receivers and sinks according
//! to its [`SessionMode`], produces the local answer and tears everything
//! down on `stop`, on a failed/closed transport or when a processor is stuck.
//!
//! Negotiation runs on the shared runtime but is driven from a dedicated
//! `process_offer_N` thread, so a slow exchange in one session never blocks
//! the caller for longer than the negotiation timeout.

use crate::config::{RtcConfiguration, SessionConfig, SessionMode};
use crate::event::{SessionEvent, SessionState, TrackRole};
use crate::registry::TrackRegistry;
use crate::transport::{PeerConnection, PeerConnectionFactory, SessionDescription, TransportState};
use crossbeam_channel::RecvTimeoutError;
use livepipe_core::{
    Frame, MediaKind, MediaRelay, MediaRuntime, MediaTrack, PipelineError, PipelineResult,
    RelayTrack, SharedTrack,
};
use livepipe_media::{
    AsyncProcessTrack, CallbackProcessor, FrameProcessor, FrameReceiver, MediaSink, MixTrack,
    MixTrackConfig, Mixer, ProcessTrack, ProcessTrackConfig, ProcessorCallbacks,
    ProcessorFactory, ProcessorHandle, SinkFactory,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Stop timeout used when `process_offer` abandons a negotiation
const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(1);

static NEGOTIATION_COUNTER: AtomicUsize = AtomicUsize::new(0);

const KINDS: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

/// Registry key of the session's own mix track for `kind`
fn mix_key(kind: MediaKind) -> String {
    format!("{}-mix", kind)
}

/// One value per media kind
#[derive(Default)]
struct ByKind<T> {
    video: T,
    audio: T,
}

impl<T> ByKind<T> {
    fn get(&self, kind: MediaKind) -> &T {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn get_mut(&mut self, kind: MediaKind) -> &mut T {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    fn into_values(self) -> impl Iterator<Item = T> {
        [self.video, self.audio].into_iter()
    }
}

/// Host-supplied media options for one kind
#[derive(Default)]
struct MediaOptions {
    processor_factory: Option<ProcessorFactory>,
    callbacks: ProcessorCallbacks,
    source: Option<SharedTrack>,
    mixer: Option<(Arc<dyn Mixer>, MixTrackConfig)>,
}

impl MediaOptions {
    /// Callbacks take precedence over a processor factory
    fn create_processor(&self) -> Option<ProcessorHandle> {
        if !self.callbacks.is_empty() {
            return Some(ProcessorHandle::new(CallbackProcessor::new(
                self.callbacks.clone(),
            )));
        }
        self.processor_factory.as_ref().map(|factory| factory())
    }
}

/// Media owned by a session; everything here is released on teardown
#[derive(Default)]
struct SessionMedia {
    processors: ByKind<Option<ProcessorHandle>>,
    receivers: ByKind<Option<Arc<FrameReceiver>>>,
    inputs: ByKind<Option<SharedTrack>>,
    outputs: ByKind<Option<SharedTrack>>,
    sources: ByKind<Option<Arc<RelayTrack>>>,
    process_tracks: Vec<SharedTrack>,
    watchers: Vec<JoinHandle<()>>,
    in_sink: Option<Arc<dyn MediaSink>>,
    out_sink: Option<Arc<dyn MediaSink>>,
}

struct NegotiationThread {
    name: String,
    thread: std::thread::JoinHandle<()>,
    exited: crossbeam_channel::Receiver<()>,
    cancel: Arc<Notify>,
}

impl NegotiationThread {
    fn join(self, timeout: Duration) {
        self.cancel.notify_one();
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    error!("Negotiation thread {} panicked", self.name);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Negotiation thread {} did not exit within {:?}; detaching it",
                    self.name, timeout
                );
            }
        }
    }
}

struct SessionInner {
    id: String,
    runtime: MediaRuntime,
    relay: MediaRelay,
    peer: Arc<dyn PeerConnection>,
    config: SessionConfig,
    options: ByKind<MediaOptions>,
    in_sink_factory: Option<SinkFactory>,
    out_sink_factory: Option<SinkFactory>,
    registry: TrackRegistry,
    media: Mutex<SessionMedia>,
    consumers_started: AtomicBool,
    tearing_down: AtomicBool,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    negotiation: Mutex<Option<NegotiationThread>>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = previous {
            info!("🔄 Session {} {} -> {}", self.id, from, next);
            self.emit(SessionEvent::StateChanged { from, to: next });
        }
        changed
    }

    fn mix_track(&self, kind: MediaKind) -> Option<Arc<MixTrack>> {
        self.registry.mix_track(&mix_key(kind))
    }

    fn processor(&self, kind: MediaKind) -> Option<ProcessorHandle> {
        self.media.lock().processors.get(kind).clone()
    }

    fn sendback(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.config.sendback_video,
            MediaKind::Audio => self.config.sendback_audio,
        }
    }

    fn receiver_capacity(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Video => self.config.video_receiver_size,
            MediaKind::Audio => self.config.audio_receiver_size,
        }
    }

    fn record_track(&self, role: TrackRole, track: SharedTrack) {
        let kind = track.kind();
        let track_id = track.id().to_string();
        {
            let mut media = self.media.lock();
            let slot = match role {
                TrackRole::Input => media.inputs.get_mut(kind),
                TrackRole::Output => media.outputs.get_mut(kind),
            };
            *slot = Some(track);
        }
        self.emit(SessionEvent::TrackAdded {
            role,
            kind,
            track_id,
        });
    }

    /// Create processors, receivers, relayed sources and sinks for a new negotiation
    fn prepare_media(&self) {
        let mut media = self.media.lock();
        for kind in KINDS {
            let options = self.options.get(kind);
            *media.processors.get_mut(kind) = options.create_processor();
            if let Some(source) = &options.source {
                *media.sources.get_mut(kind) = Some(self.relay.subscribe(Arc::clone(source)));
            }
            if self.config.mode == SessionMode::RecvOnly {
                *media.receivers.get_mut(kind) = Some(Arc::new(FrameReceiver::with_capacity(
                    &self.runtime,
                    self.receiver_capacity(kind),
                )));
            }
        }
        if self.config.mode.receives() {
            media.in_sink = self.in_sink_factory.as_ref().map(|factory| factory());
        }
        if self.config.mode == SessionMode::SendRecv {
            media.out_sink = self.out_sink_factory.as_ref().map(|factory| factory());
        }
    }

    async fn negotiate(
        self: Arc<Self>,
        offer: SessionDescription,
    ) -> PipelineResult<SessionDescription> {
        debug!("Negotiating session {}", self.id);

        let weak = Arc::downgrade(&self);
        self.peer.on_transport_state_change(Box::new(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_state(state);
            }
        }));

        if self.config.mode.receives() {
            let weak = Arc::downgrade(&self);
            self.peer.on_track(Box::new(move |track| {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.on_track(track) {
                        error!("Failed to wire track on session {}: {}", inner.id, e);
                    }
                }
            }));
        }

        self.peer.set_remote_description(offer).await?;

        if self.config.mode == SessionMode::SendOnly {
            self.attach_sources()?;
        }
        self.start_consumers().await?;

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer).await?;
        self.peer
            .local_description()
            .ok_or_else(|| PipelineError::Negotiation {
                reason: "Peer connection has no local description".to_string(),
            })
    }

    async fn start_consumers(&self) -> PipelineResult<()> {
        self.consumers_started.store(true, Ordering::SeqCst);
        let (receivers, sinks) = {
            let media = self.media.lock();
            (
                [media.receivers.video.clone(), media.receivers.audio.clone()],
                [media.in_sink.clone(), media.out_sink.clone()],
            )
        };
        for receiver in receivers.into_iter().flatten() {
            if receiver.has_track() {
                start_receiver(&receiver)?;
            }
        }
        for sink in sinks.into_iter().flatten() {
            sink.start().await?;
        }
        Ok(())
    }

    fn on_track(self: &Arc<Self>, input: SharedTrack) -> PipelineResult<()> {
        if self.state().is_closed() {
            debug!(
                "Ignoring track {} on closed session {}",
                input.id(),
                self.id
            );
            return Ok(());
        }
        let kind = input.kind();
        info!(
            "📥 Track {} ({}) received on session {}",
            input.id(),
            kind,
            self.id
        );
        self.record_track(TrackRole::Input, Arc::clone(&input));

        match self.config.mode {
            SessionMode::SendRecv => self.wire_send_recv(&input)?,
            SessionMode::RecvOnly => self.wire_recv_only(&input)?,
            SessionMode::SendOnly => {}
        }

        let in_sink = self.media.lock().in_sink.clone();
        if let Some(sink) = in_sink {
            sink.add_track(self.relay.subscribe(Arc::clone(&input)))?;
            debug!("Track {} added to the input sink", input.id());
        }

        self.watch_input_end(input);
        Ok(())
    }

    /// The processed form of an incoming track; the track itself when no
    /// processor is configured
    fn processed_input(self: &Arc<Self>, input: &SharedTrack) -> SharedTrack {
        let kind = input.kind();
        match self.processor(kind) {
            Some(processor) => {
                let upstream: SharedTrack = self.relay.subscribe(Arc::clone(input));
                self.spawn_process_track(kind, upstream, processor)
            }
            None => Arc::clone(input),
        }
    }

    fn wire_send_recv(self: &Arc<Self>, input: &SharedTrack) -> PipelineResult<()> {
        let kind = input.kind();
        let source = self.media.lock().sources.get(kind).clone();

        let output: SharedTrack = match source {
            Some(source) => {
                info!("Using source track {} as the {} output", source.id(), kind);
                source as SharedTrack
            }
            None => {
                let processed = self.processed_input(input);
                match self.mix_track(kind) {
                    Some(mix) => {
                        mix.add_input_track(processed);
                        mix as SharedTrack
                    }
                    None => processed,
                }
            }
        };

        if self.sendback(kind) {
            self.peer.add_track(self.relay.subscribe(Arc::clone(&output)))?;
            info!("📤 Sending {} track {} to the peer", kind, output.id());
        } else {
            info!("Blocking {} track {} from the peer", kind, output.id());
        }

        let out_sink = self.media.lock().out_sink.clone();
        if let Some(sink) = out_sink {
            sink.add_track(self.relay.subscribe(Arc::clone(&output)))?;
            debug!("Track {} added to the output sink", output.id());
        }

        self.record_track(TrackRole::Output, output);
        Ok(())
    }

    fn wire_recv_only(self: &Arc<Self>, input: &SharedTrack) -> PipelineResult<()> {
        let kind = input.kind();
        let receiver = self.media.lock().receivers.get(kind).clone();
        let Some(receiver) = receiver else {
            return Ok(());
        };

        let output = self.processed_input(input);
        receiver.add_track(self.relay.subscribe(Arc::clone(&output)))?;
        info!("Track {} feeds the {} receiver", output.id(), kind);
        self.record_track(TrackRole::Output, output);

        // Tracks arriving after negotiation start their receiver themselves.
        if self.consumers_started.load(Ordering::SeqCst) {
            start_receiver(&receiver)?;
        }
        Ok(())
    }

    /// Send-only mode: attach sources for every kind the remote offer carries
    fn attach_sources(self: &Arc<Self>) -> PipelineResult<()> {
        for kind in self.peer.transceiver_kinds() {
            let source: Option<SharedTrack> = {
                let media = self.media.lock();
                match media.sources.get(kind) {
                    Some(source) => Some(Arc::clone(source) as SharedTrack),
                    None => self
                        .mix_track(kind)
                        .map(|mix| self.relay.subscribe(mix as SharedTrack) as SharedTrack),
                }
            };
            let Some(source) = source else {
                debug!("No {} source for session {}", kind, self.id);
                continue;
            };

            let output = match self.processor(kind) {
                Some(processor) => self.spawn_process_track(kind, source, processor),
                None => source,
            };
            self.peer.add_track(self.relay.subscribe(Arc::clone(&output)))?;
            info!("📤 Sending {} source {} to the peer", kind, output.id());
            self.record_track(TrackRole::Output, output);
        }
        Ok(())
    }

    fn spawn_process_track(
        self: &Arc<Self>,
        kind: MediaKind,
        upstream: SharedTrack,
        processor: ProcessorHandle,
    ) -> SharedTrack {
        let track: SharedTrack = if self.config.async_processing {
            let track = AsyncProcessTrack::with_config(
                upstream,
                processor.processor(),
                ProcessTrackConfig {
                    watchdog: self.config.processor_watchdog,
                    stop_timeout: self.config.stop_timeout,
                },
            );
            let weak = Arc::downgrade(self);
            track.set_fatal_handler(Arc::new(move |error| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_processor_failed(kind, error);
                }
            }));
            Arc::new(track) as SharedTrack
        } else {
            Arc::new(ProcessTrack::new(upstream, processor.processor())) as SharedTrack
        };
        info!(
            "⚙️ Attached {} processor to session {} (track {})",
            kind,
            self.id,
            track.id()
        );
        self.media.lock().process_tracks.push(Arc::clone(&track));
        track
    }

    fn watch_input_end(self: &Arc<Self>, input: SharedTrack) {
        let weak = Arc::downgrade(self);
        let watcher = self.runtime.spawn(async move {
            input.lifecycle().ended().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_input_ended(&input).await;
            }
        });
        self.media.lock().watchers.push(watcher);
    }

    async fn on_input_ended(&self, input: &SharedTrack) {
        info!(
            "Track {} ({}) ended on session {}",
            input.id(),
            input.kind(),
            self.id
        );
        let (receivers, sinks) = {
            let mut media = self.media.lock();
            (
                [media.receivers.video.clone(), media.receivers.audio.clone()],
                [media.in_sink.take(), media.out_sink.take()],
            )
        };
        if self.config.mode == SessionMode::RecvOnly {
            for receiver in receivers.into_iter().flatten() {
                receiver.stop();
            }
        }
        for sink in sinks.into_iter().flatten() {
            if let Err(e) = sink.stop().await {
                warn!("Failed to stop sink on session {}: {}", self.id, e);
            }
        }
    }

    fn on_transport_state(self: &Arc<Self>, state: TransportState) {
        info!("🔗 Transport state of session {} is {}", self.id, state);
        self.emit(SessionEvent::TransportStateChanged { state });
        if state.is_terminal() {
            self.teardown(state == TransportState::Failed);
        }
    }

    fn on_processor_failed(self: &Arc<Self>, kind: MediaKind, error: PipelineError) {
        error!(
            "💥 {} processor of session {} failed: {}; tearing the session down",
            kind, self.id, error
        );
        self.emit(SessionEvent::ProcessorFailed {
            kind,
            reason: error.to_string(),
        });
        self.teardown(true);
    }

    /// Release media off the event loop, optionally close the peer, then
    /// report `Closed`. Runs once.
    fn teardown(self: &Arc<Self>, close_peer: bool) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        self.runtime.handle().spawn_blocking(move || {
            inner.release_media();
            if close_peer {
                inner.close_peer();
            }
            inner.transition(SessionState::Closed);
        });
    }

    /// Stop processors, receivers, relayed sources, mix tracks and sinks.
    /// Blocks for at most the stop timeout per async process track.
    fn release_media(&self) {
        let (receivers, sources, process_tracks, watchers, sinks) = {
            let mut media = self.media.lock();
            media.processors = ByKind::default();
            (
                std::mem::take(&mut media.receivers),
                std::mem::take(&mut media.sources),
                std::mem::take(&mut media.process_tracks),
                std::mem::take(&mut media.watchers),
                [media.in_sink.take(), media.out_sink.take()],
            )
        };

        for watcher in watchers {
            watcher.abort();
        }
        for receiver in receivers.into_values().flatten() {
            receiver.stop();
        }
        // Relay proxies do not forward transport teardown to their upstream,
        // so sources are stopped here. Only the proxies: the upstream may
        // still feed other sessions.
        for source in sources.into_values().flatten() {
            debug!("Stopping relayed source track {}", source.id());
            source.stop();
        }
        self.registry.clear();
        for track in process_tracks {
            track.stop();
        }
        for sink in sinks.into_iter().flatten() {
            let id = self.id.clone();
            self.runtime.spawn(async move {
                if let Err(e) = sink.stop().await {
                    warn!("Failed to stop sink on session {}: {}", id, e);
                }
            });
        }
        debug!("Released media of session {}", self.id);
    }

    fn close_peer(&self) {
        if self.peer.transport_state() == TransportState::Closed {
            return;
        }
        let peer = Arc::clone(&self.peer);
        let id = self.id.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peer.close().await {
                warn!("Failed to close peer connection of session {}: {}", id, e);
            }
        });
    }
}

fn start_receiver(receiver: &FrameReceiver) -> PipelineResult<()> {
    match receiver.start() {
        Ok(()) | Err(PipelineError::AlreadyStarted { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Handle to one negotiated peer session
///
/// All methods are synchronous and meant to be called from host threads, not
/// from inside the runtime: `process_offer` waits for the negotiation thread
/// and `stop` joins processor worker threads.
#[derive(Clone)]
pub struct SessionWorker {
    inner: Arc<SessionInner>,
}

impl SessionWorker {
    /// Session id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Media direction
    pub fn mode(&self) -> SessionMode {
        self.inner.config.mode
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The underlying peer connection
    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.inner.peer
    }

    /// Apply `offer`, wire media and return the local answer.
    ///
    /// Waits at most `timeout` (the configured negotiation timeout when
    /// `None`). On timeout the session is stopped and `Timeout` returned; any
    /// negotiation error is returned as is and also stops the session.
    pub fn process_offer(
        &self,
        offer: SessionDescription,
        timeout: Option<Duration>,
    ) -> PipelineResult<SessionDescription> {
        let inner = &self.inner;
        if !inner.transition(SessionState::Negotiating) {
            return Err(PipelineError::InvalidState {
                expected: SessionState::Created.to_string(),
                actual: inner.state().to_string(),
            });
        }
        inner.prepare_media();

        let timeout = timeout.unwrap_or(inner.config.negotiation_timeout);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let (exited_tx, exited) = crossbeam_channel::bounded::<()>(0);
        let cancel = Arc::new(Notify::new());
        let name = format!(
            "process_offer_{}",
            NEGOTIATION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let thread = {
            let inner = Arc::clone(inner);
            let cancel = Arc::clone(&cancel);
            let thread_name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let _exited = exited_tx;
                    let runtime = inner.runtime.clone();
                    let result = runtime.block_on(async move {
                        tokio::select! {
                            result = inner.negotiate(offer) => result,
                            _ = cancel.notified() => Err(PipelineError::closed("Session")),
                        }
                    });
                    if let Err(e) = &result {
                        warn!("An error occurred in {}: {}", thread_name, e);
                    }
                    let _ = result_tx.send(result);
                })
                .map_err(|e| PipelineError::Worker {
                    reason: format!("Failed to spawn {}: {}", name, e),
                })?
        };
        debug!("Started {} for session {}", name, inner.id);
        *inner.negotiation.lock() = Some(NegotiationThread {
            name,
            thread,
            exited,
            cancel,
        });

        let outcome = match result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Negotiation of session {} has not finished in {:?}; stopping it",
                    inner.id, timeout
                );
                self.stop(Some(FORCED_STOP_TIMEOUT));
                return Err(PipelineError::Timeout {
                    operation: "process_offer".to_string(),
                    duration: timeout,
                });
            }
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Worker {
                reason: "Negotiation thread exited without a result".to_string(),
            }),
        };

        match outcome {
            Ok(answer) => {
                if !inner.transition(SessionState::Live) {
                    return Err(PipelineError::InvalidState {
                        expected: SessionState::Negotiating.to_string(),
                        actual: inner.state().to_string(),
                    });
                }
                info!("✅ Session {} is live", inner.id);
                Ok(answer)
            }
            Err(e) => {
                self.stop(Some(FORCED_STOP_TIMEOUT));
                Err(e)
            }
        }
    }

    /// Release processors, receivers and sources, join the negotiation thread
    /// within `timeout` (the configured stop timeout when `None`) and close
    /// the peer connection. Idempotent.
    pub fn stop(&self, timeout: Option<Duration>) {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or(inner.config.stop_timeout);
        inner.tearing_down.store(true, Ordering::SeqCst);
        inner.release_media();

        let negotiation = inner.negotiation.lock().take();
        if let Some(negotiation) = negotiation {
            negotiation.join(timeout);
        }

        inner.close_peer();
        inner.transition(SessionState::Closed);
    }

    /// Video processor, while the session is not torn down
    pub fn video_processor(&self) -> Option<ProcessorHandle> {
        self.inner.processor(MediaKind::Video)
    }

    /// Audio processor, while the session is not torn down
    pub fn audio_processor(&self) -> Option<ProcessorHandle> {
        self.inner.processor(MediaKind::Audio)
    }

    /// Video processor as its concrete type
    pub fn video_processor_as<P: FrameProcessor>(&self) -> Option<Arc<P>> {
        self.video_processor()?.downcast::<P>()
    }

    /// Audio processor as its concrete type
    pub fn audio_processor_as<P: FrameProcessor>(&self) -> Option<Arc<P>> {
        self.audio_processor()?.downcast::<P>()
    }

    /// Video frame receiver (receive-only sessions)
    pub fn video_receiver(&self) -> Option<Arc<FrameReceiver>> {
        self.inner.media.lock().receivers.video.clone()
    }

    /// Audio frame receiver (receive-only sessions)
    pub fn audio_receiver(&self) -> Option<Arc<FrameReceiver>> {
        self.inner.media.lock().receivers.audio.clone()
    }

    /// Incoming video track
    pub fn input_video_track(&self) -> Option<SharedTrack> {
        self.inner.media.lock().inputs.video.clone()
    }

    /// Incoming audio track
    pub fn input_audio_track(&self) -> Option<SharedTrack> {
        self.inner.media.lock().inputs.audio.clone()
    }

    /// Video track sent to the peer or a receiver
    pub fn output_video_track(&self) -> Option<SharedTrack> {
        self.inner.media.lock().outputs.video.clone()
    }

    /// Audio track sent to the peer or a receiver
    pub fn output_audio_track(&self) -> Option<SharedTrack> {
        self.inner.media.lock().outputs.audio.clone()
    }

    /// Registry scoped to this session. Mix tracks configured on the builder
    /// live here; anything the host registers is stopped with the session.
    pub fn registry(&self) -> &TrackRegistry {
        &self.inner.registry
    }

    /// Session-owned video mix track
    pub fn video_mix_track(&self) -> Option<Arc<MixTrack>> {
        self.inner.mix_track(MediaKind::Video)
    }

    /// Session-owned audio mix track
    pub fn audio_mix_track(&self) -> Option<Arc<MixTrack>> {
        self.inner.mix_track(MediaKind::Audio)
    }

    /// Replace the callbacks of the video callback processor
    pub fn update_video_callbacks(&self, callbacks: ProcessorCallbacks) -> PipelineResult<()> {
        self.update_callbacks(MediaKind::Video, callbacks)
    }

    /// Replace the callbacks of the audio callback processor
    pub fn update_audio_callbacks(&self, callbacks: ProcessorCallbacks) -> PipelineResult<()> {
        self.update_callbacks(MediaKind::Audio, callbacks)
    }

    fn update_callbacks(&self, kind: MediaKind, callbacks: ProcessorCallbacks) -> PipelineResult<()> {
        let handle = self
            .inner
            .processor(kind)
            .ok_or_else(|| PipelineError::InvalidState {
                expected: format!("{} processor attached", kind),
                actual: "no processor".to_string(),
            })?;
        let processor =
            handle
                .downcast::<CallbackProcessor>()
                .ok_or_else(|| PipelineError::InvalidState {
                    expected: "callback processor".to_string(),
                    actual: "custom processor".to_string(),
                })?;
        processor.update_callbacks(callbacks);
        debug!("Updated {} callbacks on session {}", kind, self.inner.id);
        Ok(())
    }
}

impl fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionWorker")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.config.mode)
            .field("state", &self.inner.state())
            .finish()
    }
}

enum PeerSource {
    Connection(Arc<dyn PeerConnection>),
    Factory(PeerConnectionFactory),
}

/// Fluent builder for session workers
pub struct SessionWorkerBuilder {
    runtime: MediaRuntime,
    relay: MediaRelay,
    peer: PeerSource,
    config: SessionConfig,
    options: ByKind<MediaOptions>,
    in_sink_factory: Option<SinkFactory>,
    out_sink_factory: Option<SinkFactory>,
}

impl SessionWorkerBuilder {
    /// Builder for a session over an existing peer connection
    pub fn new(runtime: &MediaRuntime, relay: &MediaRelay, peer: Arc<dyn PeerConnection>) -> Self {
        Self::with_peer(runtime, relay, PeerSource::Connection(peer))
    }

    /// Builder creating its peer connection from the session's RTC configuration
    pub fn with_factory<F>(runtime: &MediaRuntime, relay: &MediaRelay, factory: F) -> Self
    where
        F: FnOnce(&RtcConfiguration) -> PipelineResult<Arc<dyn PeerConnection>> + Send + 'static,
    {
        Self::with_peer(runtime, relay, PeerSource::Factory(Box::new(factory)))
    }

    fn with_peer(runtime: &MediaRuntime, relay: &MediaRelay, peer: PeerSource) -> Self {
        Self {
            runtime: runtime.clone(),
            relay: relay.clone(),
            peer,
            config: SessionConfig::default(),
            options: ByKind::default(),
            in_sink_factory: None,
            out_sink_factory: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the media direction
    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Run processors on worker threads (default) or inline
    pub fn async_processing(mut self, enabled: bool) -> Self {
        self.config.async_processing = enabled;
        self
    }

    /// Send processed video back to the peer
    pub fn sendback_video(mut self, enabled: bool) -> Self {
        self.config.sendback_video = enabled;
        self
    }

    /// Send processed audio back to the peer
    pub fn sendback_audio(mut self, enabled: bool) -> Self {
        self.config.sendback_audio = enabled;
        self
    }

    /// Set the peer connection configuration
    pub fn rtc_configuration(mut self, rtc_configuration: RtcConfiguration) -> Self {
        self.config.rtc_configuration = rtc_configuration;
        self
    }

    /// Create a video processor per negotiation with `factory`
    pub fn video_processor_factory<P, F>(mut self, factory: F) -> Self
    where
        P: FrameProcessor,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let factory: ProcessorFactory = Arc::new(move || ProcessorHandle::new(factory()));
        self.options.video.processor_factory = Some(factory);
        self
    }

    /// Create an audio processor per negotiation with `factory`
    pub fn audio_processor_factory<P, F>(mut self, factory: F) -> Self
    where
        P: FrameProcessor,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let factory: ProcessorFactory = Arc::new(move || ProcessorHandle::new(factory()));
        self.options.audio.processor_factory = Some(factory);
        self
    }

    /// Process video with callbacks; takes precedence over a processor factory
    pub fn video_callbacks(mut self, callbacks: ProcessorCallbacks) -> Self {
        self.options.video.callbacks = callbacks;
        self
    }

    /// Process audio with callbacks; takes precedence over a processor factory
    pub fn audio_callbacks(mut self, callbacks: ProcessorCallbacks) -> Self {
        self.options.audio.callbacks = callbacks;
        self
    }

    /// Shorthand for a video frame callback
    pub fn video_frame_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Frame) -> anyhow::Result<Frame> + Send + Sync + 'static,
    {
        let callbacks = std::mem::take(&mut self.options.video.callbacks);
        self.options.video.callbacks = callbacks.with_frame(callback);
        self
    }

    /// Shorthand for an audio frame callback
    pub fn audio_frame_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Frame) -> anyhow::Result<Frame> + Send + Sync + 'static,
    {
        let callbacks = std::mem::take(&mut self.options.audio.callbacks);
        self.options.audio.callbacks = callbacks.with_frame(callback);
        self
    }

    /// Send `track` as the video output instead of processed input
    pub fn source_video_track(mut self, track: SharedTrack) -> Self {
        self.options.video.source = Some(track);
        self
    }

    /// Send `track` as the audio output instead of processed input
    pub fn source_audio_track(mut self, track: SharedTrack) -> Self {
        self.options.audio.source = Some(track);
        self
    }

    /// Mix video through a session-owned mix track
    pub fn video_mixer(mut self, mixer: impl Mixer, config: MixTrackConfig) -> Self {
        let mixer: Arc<dyn Mixer> = Arc::new(mixer);
        self.options.video.mixer = Some((mixer, config));
        self
    }

    /// Mix audio through a session-owned mix track
    pub fn audio_mixer(mut self, mixer: impl Mixer, config: MixTrackConfig) -> Self {
        let mixer: Arc<dyn Mixer> = Arc::new(mixer);
        self.options.audio.mixer = Some((mixer, config));
        self
    }

    /// Record incoming tracks with sinks from `factory`
    pub fn in_sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn MediaSink> + Send + Sync + 'static,
    {
        self.in_sink_factory = Some(Arc::new(factory));
        self
    }

    /// Record outgoing tracks with sinks from `factory`
    pub fn out_sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn MediaSink> + Send + Sync + 'static,
    {
        self.out_sink_factory = Some(Arc::new(factory));
        self
    }

    /// Validate the configuration and create the session
    pub fn build(self) -> PipelineResult<SessionWorker> {
        self.config.validate()?;

        let registry = TrackRegistry::new(&self.runtime, &self.relay).with_process_config(
            ProcessTrackConfig {
                watchdog: self.config.processor_watchdog,
                stop_timeout: self.config.stop_timeout,
            },
        );
        for kind in KINDS {
            let options = self.options.get(kind);
            if let Some(source) = &options.source {
                if source.kind() != kind {
                    return Err(PipelineError::UnsupportedTrackKind {
                        kind: format!("{} track used as {} source", source.kind(), kind),
                    });
                }
            }
            if let Some((mixer, config)) = &options.mixer {
                registry.create_mix_track(&mix_key(kind), kind, Arc::clone(mixer), *config)?;
            }
        }

        let peer = match self.peer {
            PeerSource::Connection(peer) => peer,
            PeerSource::Factory(factory) => factory(&self.config.rtc_configuration)?,
        };

        let (state, _) = watch::channel(SessionState::Created);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let id = uuid::Uuid::new_v4().to_string();
        info!(
            "🎬 Session {} created ({:?} mode, async processing: {})",
            id, self.config.mode, self.config.async_processing
        );

        Ok(SessionWorker {
            inner: Arc::new(SessionInner {
                id,
                runtime: self.runtime,
                relay: self.relay,
                peer,
                config: self.config,
                options: self.options,
                in_sink_factory: self.in_sink_factory,
                out_sink_factory: self.out_sink_factory,
                registry,
                media: Mutex::new(SessionMedia::default()),
                consumers_started: AtomicBool::new(false),
                tearing_down: AtomicBool::new(false),
                state,
                events,
                negotiation: Mutex::new(None),
            }),
        })
    }
}

impl fmt::Debug for SessionWorkerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionWorkerBuilder")
            .field("config", &self.config)
            .finish()
    }
}
