//! Processor and mixer extension points
//!
//! A [`FrameProcessor`] transforms frames flowing through a process track. Only
//! [`FrameProcessor::process`] is required; batching and end-of-stream hooks
//! have defaults supplied by the pipeline. A [`Mixer`] combines the latest frame
//! of several inputs into one output frame per tick.

use async_trait::async_trait;
use futures::future::BoxFuture;
use livepipe_core::Frame;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// User-supplied frame transformation
///
/// Implementations take `&self` and are shared between the pipeline and the
/// host, which may tune parameters while frames flow. Any internal state needs
/// its own synchronisation.
#[async_trait]
pub trait FrameProcessor: Send + Sync + 'static {
    /// Transform one frame. Timing is copied from the input by the caller.
    fn process(&self, frame: Frame) -> anyhow::Result<Frame>;

    /// Transform every frame that arrived since the previous batch.
    ///
    /// The default processes only the newest frame and drops the rest.
    async fn process_batch(&self, frames: Vec<Frame>) -> anyhow::Result<Vec<Frame>> {
        if frames.len() > 1 {
            warn!(
                "Processor does not batch; dropping {} intermediate frames",
                frames.len() - 1
            );
        }
        match frames.into_iter().last() {
            Some(frame) => Ok(vec![self.process(frame)?]),
            None => Ok(Vec::new()),
        }
    }

    /// Called once when the input track ends or the process track is stopped
    fn on_ended(&self) {}
}

/// Zero-argument constructor for processors
pub type ProcessorFactory = Arc<dyn Fn() -> ProcessorHandle + Send + Sync>;

/// User-supplied function combining the latest frame of each input
pub trait Mixer: Send + Sync + 'static {
    /// Build one output frame. Slots are in input registration order; a slot is
    /// `None` when that input produced nothing since the previous tick.
    fn mix(&self, frames: &[Option<Frame>]) -> anyhow::Result<Frame>;
}

impl<F> Mixer for F
where
    F: Fn(&[Option<Frame>]) -> anyhow::Result<Frame> + Send + Sync + 'static,
{
    fn mix(&self, frames: &[Option<Frame>]) -> anyhow::Result<Frame> {
        self(frames)
    }
}

/// Per-frame callback
pub type FrameCallback = Arc<dyn Fn(Frame) -> anyhow::Result<Frame> + Send + Sync>;

/// Batch callback
pub type QueuedFramesCallback =
    Arc<dyn Fn(Vec<Frame>) -> BoxFuture<'static, anyhow::Result<Vec<Frame>>> + Send + Sync>;

/// End-of-stream callback
pub type EndedCallback = Arc<dyn Fn() + Send + Sync>;

/// Set of callbacks backing a [`CallbackProcessor`]
#[derive(Clone, Default)]
pub struct ProcessorCallbacks {
    /// Called for single frames
    pub frame: Option<FrameCallback>,
    /// Called with every frame queued since the previous batch
    pub queued_frames: Option<QueuedFramesCallback>,
    /// Called when the input ends
    pub on_ended: Option<EndedCallback>,
}

impl ProcessorCallbacks {
    /// Use a per-frame callback
    pub fn with_frame<F>(mut self, callback: F) -> Self
    where
        F: Fn(Frame) -> anyhow::Result<Frame> + Send + Sync + 'static,
    {
        self.frame = Some(Arc::new(callback));
        self
    }

    /// Use an async batch callback
    pub fn with_queued_frames<F>(mut self, callback: F) -> Self
    where
        F: Fn(Vec<Frame>) -> BoxFuture<'static, anyhow::Result<Vec<Frame>>> + Send + Sync + 'static,
    {
        self.queued_frames = Some(Arc::new(callback));
        self
    }

    /// Use an end-of-stream callback
    pub fn with_on_ended<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_ended = Some(Arc::new(callback));
        self
    }

    /// Whether no callback is set
    pub fn is_empty(&self) -> bool {
        self.frame.is_none() && self.queued_frames.is_none() && self.on_ended.is_none()
    }
}

impl fmt::Debug for ProcessorCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorCallbacks")
            .field("frame", &self.frame.is_some())
            .field("queued_frames", &self.queued_frames.is_some())
            .field("on_ended", &self.on_ended.is_some())
            .finish()
    }
}

/// Processor assembled from closures that can be swapped while running
///
/// Without a frame or batch callback frames pass through untouched.
#[derive(Debug, Default)]
pub struct CallbackProcessor {
    callbacks: RwLock<ProcessorCallbacks>,
}

impl CallbackProcessor {
    /// Create a processor from a callback set
    pub fn new(callbacks: ProcessorCallbacks) -> Self {
        Self {
            callbacks: RwLock::new(callbacks),
        }
    }

    /// Replace every callback
    pub fn update_callbacks(&self, callbacks: ProcessorCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    /// Current callback set
    pub fn callbacks(&self) -> ProcessorCallbacks {
        self.callbacks.read().clone()
    }
}

#[async_trait]
impl FrameProcessor for CallbackProcessor {
    fn process(&self, frame: Frame) -> anyhow::Result<Frame> {
        let callback = self.callbacks.read().frame.clone();
        match callback {
            Some(callback) => callback(frame),
            None => Ok(frame),
        }
    }

    async fn process_batch(&self, frames: Vec<Frame>) -> anyhow::Result<Vec<Frame>> {
        let (queued, single) = {
            let callbacks = self.callbacks.read();
            (callbacks.queued_frames.clone(), callbacks.frame.clone())
        };
        if let Some(queued) = queued {
            return queued(frames).await;
        }
        if frames.len() > 1 {
            warn!(
                "No queued-frames callback; dropping {} intermediate frames",
                frames.len() - 1
            );
        }
        let Some(frame) = frames.into_iter().last() else {
            return Ok(Vec::new());
        };
        match single {
            Some(callback) => Ok(vec![callback(frame)?]),
            None => Ok(vec![frame]),
        }
    }

    fn on_ended(&self) {
        let callback = self.callbacks.read().on_ended.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Processor handle that remembers its concrete type for host access
#[derive(Clone)]
pub struct ProcessorHandle {
    processor: Arc<dyn FrameProcessor>,
    concrete: Arc<dyn std::any::Any + Send + Sync>,
}

impl ProcessorHandle {
    /// Wrap a concrete processor
    pub fn new<P: FrameProcessor>(processor: P) -> Self {
        Self::from_arc(Arc::new(processor))
    }

    /// Wrap a shared concrete processor
    pub fn from_arc<P: FrameProcessor>(processor: Arc<P>) -> Self {
        Self {
            processor: processor.clone(),
            concrete: processor,
        }
    }

    /// The processor as a trait object
    pub fn processor(&self) -> Arc<dyn FrameProcessor> {
        Arc::clone(&self.processor)
    }

    /// The processor as its concrete type, if it is a `P`
    pub fn downcast<P: FrameProcessor>(&self) -> Option<Arc<P>> {
        Arc::clone(&self.concrete).downcast::<P>().ok()
    }
}

impl fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle").finish_non_exhaustive()
    }
}
