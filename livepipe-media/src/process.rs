//! Process tracks
//!
//! [`ProcessTrack`] applies a processor inline on the caller's schedule and is
//! only suitable for processors that finish well within one frame period.
//!
//! [`AsyncProcessTrack`] moves the processor onto a dedicated worker thread with
//! its own small event loop. The worker coalesces every queued input frame into
//! one batch, so the processor runs as often as it can finish rather than once
//! per input frame. `recv` never waits for the worker: it returns the oldest
//! unread result, or repeats the last delivered one until a newer result lands.
//! A companion watchdog thread fails the track when one invocation runs past
//! the configured ceiling, including processors that block their thread.

use crate::processor::FrameProcessor;
use async_trait::async_trait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use livepipe_core::{
    Frame, MediaTrack, PipelineError, PipelineResult, RecvResult, SharedTrack, TrackLifecycle,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Called from the worker thread when a processor invocation is stuck
pub type FatalHandler = Arc<dyn Fn(PipelineError) + Send + Sync>;

/// Async process track configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTrackConfig {
    /// Ceiling for a single processor invocation before the track fails stop
    pub watchdog: Duration,
    /// How long `stop` waits for the worker thread to exit
    pub stop_timeout: Duration,
}

impl Default for ProcessTrackConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

impl ProcessTrackConfig {
    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.watchdog.is_zero() {
            return Err(PipelineError::InvalidConfiguration {
                message: "Processor watchdog must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn finish_once(flag: &AtomicBool, processor: &Arc<dyn FrameProcessor>) {
    if !flag.swap(true, Ordering::SeqCst) {
        processor.on_ended();
    }
}

/// Process track that runs the processor inline in `recv`
///
/// A processor error is returned from `recv` and ends the track.
pub struct ProcessTrack {
    lifecycle: TrackLifecycle,
    upstream: SharedTrack,
    processor: Arc<dyn FrameProcessor>,
    ended_notified: AtomicBool,
}

impl ProcessTrack {
    /// Wrap `upstream` with `processor`
    pub fn new(upstream: SharedTrack, processor: Arc<dyn FrameProcessor>) -> Self {
        let lifecycle = TrackLifecycle::new(upstream.kind());
        debug!(
            "Creating process track {} over {}",
            lifecycle.id(),
            upstream.id()
        );
        Self {
            lifecycle,
            upstream,
            processor,
            ended_notified: AtomicBool::new(false),
        }
    }

    /// The attached processor
    pub fn processor(&self) -> Arc<dyn FrameProcessor> {
        Arc::clone(&self.processor)
    }

    fn finish(&self) {
        self.lifecycle.end();
        finish_once(&self.ended_notified, &self.processor);
    }
}

impl fmt::Debug for ProcessTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTrack")
            .field("id", &self.lifecycle.id())
            .field("upstream", &self.upstream.id())
            .finish()
    }
}

#[async_trait]
impl MediaTrack for ProcessTrack {
    fn lifecycle(&self) -> &TrackLifecycle {
        &self.lifecycle
    }

    async fn recv(&self) -> RecvResult {
        if !self.lifecycle.is_live() {
            return Ok(None);
        }
        let received = tokio::select! {
            received = self.upstream.recv() => received,
            _ = self.lifecycle.ended() => return Ok(None),
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.finish();
                return Ok(None);
            }
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };

        let (pts, time_base) = (frame.pts, frame.time_base);
        match self.processor.process(frame) {
            Ok(output) => Ok(Some(output.with_timing(pts, time_base))),
            Err(e) => {
                error!("Processor failed on track {}: {:#}", self.lifecycle.id(), e);
                self.finish();
                Err(PipelineError::processor(e))
            }
        }
    }

    fn stop(&self) {
        self.finish();
        self.upstream.stop();
    }
}

enum WorkerMessage {
    Frame(Frame),
    Stop,
}

#[derive(Default)]
struct OutputBuffer {
    pending: VecDeque<Frame>,
    last: Option<Frame>,
}

struct WorkerShared {
    lifecycle: TrackLifecycle,
    output: Mutex<OutputBuffer>,
    stuck_for: Mutex<Option<Duration>>,
    busy_since: Mutex<Option<Instant>>,
    fatal_handler: RwLock<Option<FatalHandler>>,
}

impl WorkerShared {
    fn push_results(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let mut output = self.output.lock();
        if output.pending.len() > 1 {
            warn!(
                "Track {}: {} processed frames were never consumed; \
                 processing and delivery are out of sync, discarding them",
                self.lifecycle.id(),
                output.pending.len()
            );
            output.pending.clear();
        }
        output.pending.extend(frames);
    }

    fn is_stuck(&self) -> bool {
        self.stuck_for.lock().is_some()
    }

    /// Runs once, from whichever of the worker or the watchdog notices first
    fn fail_stop(&self, elapsed: Duration) {
        {
            let mut stuck_for = self.stuck_for.lock();
            if stuck_for.is_some() {
                return;
            }
            *stuck_for = Some(elapsed);
        }
        error!(
            "Processor on track {} ran for {:?}; treating the pipeline as stuck",
            self.lifecycle.id(),
            elapsed
        );
        self.lifecycle.end();
        let handler = self.fatal_handler.read().clone();
        if let Some(handler) = handler {
            handler(PipelineError::ProcessorStuck { elapsed });
        }
    }
}

struct RunningWorker {
    input: Sender<WorkerMessage>,
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

enum WorkerState {
    Idle,
    Running(RunningWorker),
    Stopped,
}

fn run_worker(
    input: Receiver<WorkerMessage>,
    processor: Arc<dyn FrameProcessor>,
    shared: Arc<WorkerShared>,
    watchdog: Duration,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create processor event loop: {}", e);
            return;
        }
    };

    loop {
        let mut batch = match input.recv() {
            Ok(WorkerMessage::Frame(frame)) => vec![frame],
            Ok(WorkerMessage::Stop) | Err(_) => break,
        };
        let mut finished = false;
        while let Ok(message) = input.try_recv() {
            match message {
                WorkerMessage::Frame(frame) => batch.push(frame),
                WorkerMessage::Stop => {
                    finished = true;
                    break;
                }
            }
        }
        if finished {
            break;
        }

        *shared.busy_since.lock() = Some(Instant::now());
        // The timer must be created inside the runtime.
        let work = processor.process_batch(batch);
        let result = runtime.block_on(async move { tokio::time::timeout(watchdog, work).await });
        let elapsed = shared
            .busy_since
            .lock()
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        if shared.is_stuck() {
            break;
        }

        match result {
            Err(_) => {
                shared.fail_stop(elapsed);
                break;
            }
            Ok(_) if elapsed > watchdog => {
                shared.fail_stop(elapsed);
                break;
            }
            Ok(Ok(frames)) => shared.push_results(frames),
            Ok(Err(e)) => {
                error!(
                    "Processor failed on track {}, continuing with next batch: {:#}",
                    shared.lifecycle.id(),
                    e
                );
            }
        }
    }
    debug!("Processor worker for track {} exited", shared.lifecycle.id());
}

/// Watch the worker from outside: a processor blocking its thread cannot be
/// cancelled, only detected. Exits with the worker or after failing the track.
fn run_watchdog(exited: Receiver<()>, shared: Arc<WorkerShared>, watchdog: Duration) {
    let poll = (watchdog / 4).clamp(Duration::from_millis(1), Duration::from_millis(100));
    loop {
        match exited.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.is_stuck() {
            break;
        }
        let started = *shared.busy_since.lock();
        if let Some(started) = started {
            let elapsed = started.elapsed();
            if elapsed > watchdog {
                shared.fail_stop(elapsed);
                break;
            }
        }
    }
}

fn join_worker(worker: RunningWorker, timeout: Duration) {
    match worker.exited.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if worker.thread.join().is_err() {
                error!("Processor worker thread panicked");
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Processor worker did not exit within {:?}; detaching it",
                timeout
            );
        }
    }
}

/// Process track that runs the processor on a dedicated worker thread
pub struct AsyncProcessTrack {
    shared: Arc<WorkerShared>,
    upstream: SharedTrack,
    processor: Arc<dyn FrameProcessor>,
    config: ProcessTrackConfig,
    worker: Mutex<WorkerState>,
    ended_notified: Arc<AtomicBool>,
}

impl AsyncProcessTrack {
    /// Wrap `upstream` with `processor` using the default configuration
    pub fn new(upstream: SharedTrack, processor: Arc<dyn FrameProcessor>) -> Self {
        Self::with_config(upstream, processor, ProcessTrackConfig::default())
    }

    /// Wrap `upstream` with `processor`
    pub fn with_config(
        upstream: SharedTrack,
        processor: Arc<dyn FrameProcessor>,
        config: ProcessTrackConfig,
    ) -> Self {
        let lifecycle = TrackLifecycle::new(upstream.kind());
        debug!(
            "Creating async process track {} over {}",
            lifecycle.id(),
            upstream.id()
        );
        Self {
            shared: Arc::new(WorkerShared {
                lifecycle,
                output: Mutex::new(OutputBuffer::default()),
                stuck_for: Mutex::new(None),
                busy_since: Mutex::new(None),
                fatal_handler: RwLock::new(None),
            }),
            upstream,
            processor,
            config,
            worker: Mutex::new(WorkerState::Idle),
            ended_notified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The attached processor
    pub fn processor(&self) -> Arc<dyn FrameProcessor> {
        Arc::clone(&self.processor)
    }

    /// The upstream track
    pub fn upstream(&self) -> &SharedTrack {
        &self.upstream
    }

    /// Install the handler called when a processor invocation exceeds the watchdog
    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        *self.shared.fatal_handler.write() = Some(handler);
    }

    /// Whether the worker thread has been started and not yet stopped
    pub fn is_worker_running(&self) -> bool {
        matches!(*self.worker.lock(), WorkerState::Running(_))
    }

    fn enqueue(&self, frame: Frame) -> PipelineResult<()> {
        let mut state = self.worker.lock();
        if let WorkerState::Idle = *state {
            let (input, rx) = crossbeam_channel::unbounded();
            let (exited_tx, exited) = crossbeam_channel::bounded::<()>(0);
            let processor = Arc::clone(&self.processor);
            let shared = Arc::clone(&self.shared);
            let watchdog = self.config.watchdog;
            let name = format!(
                "async_media_processor_{}",
                WORKER_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let thread = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let _exited = exited_tx;
                    run_worker(rx, processor, shared, watchdog);
                })
                .map_err(|e| PipelineError::Worker {
                    reason: format!("Failed to spawn {}: {}", name, e),
                })?;
            let watched = exited.clone();
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("{}_watchdog", name))
                .spawn(move || run_watchdog(watched, shared, watchdog));
            if let Err(e) = spawned {
                error!("Failed to spawn watchdog for {}: {}", name, e);
            }
            info!(
                "⚙️ Started {} for track {}",
                name,
                self.shared.lifecycle.id()
            );
            *state = WorkerState::Running(RunningWorker {
                input,
                thread,
                exited,
            });
        }
        if let WorkerState::Running(worker) = &*state {
            // A send error means the worker already exited; results stop changing.
            let _ = worker.input.send(WorkerMessage::Frame(frame));
        }
        Ok(())
    }

    /// Stop accepting frames and signal the worker; returns it for joining
    fn shutdown(&self) -> Option<RunningWorker> {
        self.shared.lifecycle.end();
        let previous = std::mem::replace(&mut *self.worker.lock(), WorkerState::Stopped);
        match previous {
            WorkerState::Running(worker) => {
                let _ = worker.input.send(WorkerMessage::Stop);
                Some(worker)
            }
            WorkerState::Idle | WorkerState::Stopped => None,
        }
    }

    fn stuck_error(&self) -> Option<PipelineError> {
        let stuck_for = *self.shared.stuck_for.lock();
        stuck_for.map(|elapsed| PipelineError::ProcessorStuck { elapsed })
    }

    /// Upstream ended: stop without blocking the event loop
    fn stop_from_upstream(&self) {
        let worker = self.shutdown();
        let processor = Arc::clone(&self.processor);
        let notified = Arc::clone(&self.ended_notified);
        let timeout = self.config.stop_timeout;
        info!(
            "Upstream of track {} ended; stopping processor",
            self.shared.lifecycle.id()
        );
        tokio::task::spawn_blocking(move || {
            if let Some(worker) = worker {
                join_worker(worker, timeout);
            }
            finish_once(&notified, &processor);
        });
    }
}

impl fmt::Debug for AsyncProcessTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncProcessTrack")
            .field("id", &self.shared.lifecycle.id())
            .field("upstream", &self.upstream.id())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl MediaTrack for AsyncProcessTrack {
    fn lifecycle(&self) -> &TrackLifecycle {
        &self.shared.lifecycle
    }

    async fn recv(&self) -> RecvResult {
        if let Some(error) = self.stuck_error() {
            return Err(error);
        }
        if !self.shared.lifecycle.is_live() {
            return Ok(None);
        }

        let received = tokio::select! {
            received = self.upstream.recv() => received,
            _ = self.shared.lifecycle.ended() => {
                return match self.stuck_error() {
                    Some(error) => Err(error),
                    None => Ok(None),
                };
            }
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.stop_from_upstream();
                return Ok(None);
            }
            Err(e) => {
                self.stop_from_upstream();
                return Err(e);
            }
        };

        let (pts, time_base) = (frame.pts, frame.time_base);
        self.enqueue(frame.clone())?;

        let output = {
            let mut output = self.shared.output.lock();
            match output.pending.pop_front() {
                Some(next) => {
                    output.last = Some(next.clone());
                    Some(next)
                }
                None => output.last.clone(),
            }
        };
        // Until the first result lands the input passes through.
        let output = output.unwrap_or(frame);
        Ok(Some(output.with_timing(pts, time_base)))
    }

    /// Stop the worker and the upstream. Blocks the calling thread for at most
    /// the configured stop timeout while the worker exits.
    fn stop(&self) {
        if let Some(worker) = self.shutdown() {
            join_worker(worker, self.config.stop_timeout);
        }
        finish_once(&self.ended_notified, &self.processor);
        self.upstream.stop();
    }
}

impl Drop for AsyncProcessTrack {
    fn drop(&mut self) {
        // Unblock the worker so the thread does not outlive the track.
        let _ = self.shutdown();
    }
}
