//! Multi-input mix track
//!
//! A [`MixTrack`] combines the most recent frame of each of its inputs into one
//! output frame on a fixed wall-clock cadence. Inputs are consumed through the
//! relay so the same upstream stays available to other consumers. Each input
//! has a pump that keeps a "latest frame" slot up to date; the mix loop takes a
//! point-in-time snapshot of every slot under the input-set lock, calls the
//! mixer once and stamps the result with a pts derived from elapsed time.

use crate::processor::Mixer;
use async_trait::async_trait;
use livepipe_core::{
    DropOldestQueue, Frame, MediaKind, MediaRelay, MediaRuntime, MediaTrack, PipelineError,
    PipelineResult, RecvResult, RelayTrack, SharedTrack, TrackLifecycle,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Mix track configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixTrackConfig {
    /// Period between two output frames
    pub output_interval: Duration,
    /// Number of mixed frames kept for a slow consumer before the oldest is dropped
    pub output_capacity: usize,
}

impl Default for MixTrackConfig {
    fn default() -> Self {
        Self {
            output_interval: Duration::from_nanos(1_000_000_000 / 30),
            output_capacity: 1,
        }
    }
}

impl MixTrackConfig {
    /// Configuration with the given output interval
    pub fn with_interval(output_interval: Duration) -> Self {
        Self {
            output_interval,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.output_interval.is_zero() {
            return Err(PipelineError::InvalidConfiguration {
                message: "Mixer output interval must be > 0".to_string(),
            });
        }
        if self.output_capacity == 0 {
            return Err(PipelineError::InvalidConfiguration {
                message: "Mixer output capacity must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

struct MixInput {
    upstream_id: String,
    proxy: Arc<RelayTrack>,
    latest: Option<Frame>,
    pump: Option<JoinHandle<()>>,
}

struct MixShared {
    lifecycle: TrackLifecycle,
    inputs: Mutex<Vec<MixInput>>,
    mixer: RwLock<Arc<dyn Mixer>>,
    output: DropOldestQueue<Frame>,
    skipped_ticks: AtomicU64,
}

impl MixShared {
    fn remove_input(&self, upstream_id: &str) -> bool {
        let removed = {
            let mut inputs = self.inputs.lock();
            match inputs.iter().position(|input| input.upstream_id == upstream_id) {
                Some(index) => inputs.remove(index),
                None => return false,
            }
        };
        if let Some(pump) = removed.pump {
            pump.abort();
        }
        removed.proxy.stop();
        info!(
            "➖ Removed input {} from mix track {}",
            upstream_id,
            self.lifecycle.id()
        );
        true
    }

    async fn run_input_pump(self: Arc<Self>, upstream_id: String, proxy: Arc<RelayTrack>) {
        loop {
            match proxy.recv().await {
                Ok(Some(frame)) => {
                    let mut inputs = self.inputs.lock();
                    match inputs.iter_mut().find(|input| input.upstream_id == upstream_id) {
                        Some(input) => input.latest = Some(frame),
                        None => return,
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Mix input {} failed: {}", upstream_id, e);
                    break;
                }
            }
        }
        debug!("Mix input {} ended", upstream_id);
        self.remove_input(&upstream_id);
    }

    fn snapshot(&self) -> Vec<Option<Frame>> {
        self.inputs
            .lock()
            .iter_mut()
            .map(|input| input.latest.take())
            .collect()
    }

    async fn run_mix_loop(self: Arc<Self>, output_interval: Duration) {
        let started = Instant::now();
        let time_base = self.lifecycle.kind().time_base();
        let mut ticker = tokio::time::interval_at(started + output_interval, output_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let slots = self.snapshot();
            let mixer = self.mixer.read().clone();
            match mixer.mix(&slots) {
                Ok(mut frame) => {
                    frame.pts = time_base.ticks(started.elapsed());
                    frame.time_base = time_base;
                    if self.output.push(frame).is_some() {
                        debug!(
                            "Mix track {} consumer is behind; dropped oldest output",
                            self.lifecycle.id()
                        );
                    }
                }
                Err(e) => {
                    let error = PipelineError::mixer(e);
                    self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Mixer failed on track {} with {} inputs; skipping tick: {} ({})",
                        self.lifecycle.id(),
                        slots.len(),
                        error,
                        error.error_code()
                    );
                }
            }
        }
    }
}

/// Track fanning in any number of inputs through a user mixer
pub struct MixTrack {
    shared: Arc<MixShared>,
    relay: MediaRelay,
    handle: Handle,
    config: MixTrackConfig,
    mix_loop: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MixTrack {
    /// Create a mix track producing frames of `kind`
    pub fn new(
        runtime: &MediaRuntime,
        relay: &MediaRelay,
        kind: MediaKind,
        mixer: Arc<dyn Mixer>,
        config: MixTrackConfig,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let lifecycle = TrackLifecycle::new(kind);
        info!(
            "🎛️ Creating {} mix track {} (interval: {:?})",
            kind,
            lifecycle.id(),
            config.output_interval
        );
        Ok(Self {
            shared: Arc::new(MixShared {
                lifecycle,
                inputs: Mutex::new(Vec::new()),
                mixer: RwLock::new(mixer),
                output: DropOldestQueue::new(config.output_capacity),
                skipped_ticks: AtomicU64::new(0),
            }),
            relay: relay.clone(),
            handle: runtime.handle().clone(),
            config,
            mix_loop: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &MixTrackConfig {
        &self.config
    }

    /// Subscribe to `track` through the relay and start feeding it to the mixer.
    /// Adding the same upstream twice is a no-op.
    pub fn add_input_track(&self, track: SharedTrack) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Ignoring input {} for stopped mix track", track.id());
            return;
        }
        let upstream_id = track.id().to_string();
        let mut inputs = self.shared.inputs.lock();
        if inputs.iter().any(|input| input.upstream_id == upstream_id) {
            return;
        }

        let proxy = self.relay.subscribe(track);
        let pump = self.handle.spawn(
            Arc::clone(&self.shared).run_input_pump(upstream_id.clone(), Arc::clone(&proxy)),
        );
        inputs.push(MixInput {
            upstream_id: upstream_id.clone(),
            proxy,
            latest: None,
            pump: Some(pump),
        });
        info!(
            "➕ Added input {} to mix track {} ({} inputs)",
            upstream_id,
            self.shared.lifecycle.id(),
            inputs.len()
        );
    }

    /// Stop feeding the given upstream to the mixer
    pub fn remove_input_track(&self, upstream_id: &str) -> bool {
        self.shared.remove_input(upstream_id)
    }

    /// Ids of the current inputs, in mixer slot order
    pub fn input_ids(&self) -> Vec<String> {
        self.shared
            .inputs
            .lock()
            .iter()
            .map(|input| input.upstream_id.clone())
            .collect()
    }

    /// Number of current inputs
    pub fn input_count(&self) -> usize {
        self.shared.inputs.lock().len()
    }

    /// Ticks that produced no output because the mixer failed
    pub fn skipped_ticks(&self) -> u64 {
        self.shared.skipped_ticks.load(Ordering::Relaxed)
    }

    /// Swap in a different mixer; takes effect on the next tick
    pub fn update_mixer(&self, mixer: Arc<dyn Mixer>) {
        *self.shared.mixer.write() = mixer;
    }

    /// Start the mix loop. `recv` starts it on first use.
    pub fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut mix_loop = self.mix_loop.lock();
        if mix_loop.is_none() {
            debug!("Starting mix loop for track {}", self.shared.lifecycle.id());
            *mix_loop = Some(
                self.handle
                    .spawn(Arc::clone(&self.shared).run_mix_loop(self.config.output_interval)),
            );
        }
    }
}

impl fmt::Debug for MixTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixTrack")
            .field("id", &self.shared.lifecycle.id())
            .field("kind", &self.shared.lifecycle.kind())
            .field("inputs", &self.input_count())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl MediaTrack for MixTrack {
    fn lifecycle(&self) -> &TrackLifecycle {
        &self.shared.lifecycle
    }

    async fn recv(&self) -> RecvResult {
        if !self.shared.lifecycle.is_live() {
            return Ok(None);
        }
        self.start();
        Ok(self.shared.output.pop().await)
    }

    /// Cancel the mix loop and every input pump and release the subscriptions.
    /// Idempotent.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mix_loop) = self.mix_loop.lock().take() {
            mix_loop.abort();
        }
        let ids: Vec<String> = self.input_ids();
        for id in ids {
            self.shared.remove_input(&id);
        }
        self.shared.output.close();
        self.shared.lifecycle.end();
        info!("🛑 Mix track {} stopped", self.shared.lifecycle.id());
    }
}

impl Drop for MixTrack {
    fn drop(&mut self) {
        MediaTrack::stop(self);
    }
}
