//! Shared asynchronous runtime
//!
//! One [`MediaRuntime`] is created at process start and handed to every
//! component that spawns pumps or loops. Synchronous callers cross into it only
//! through [`MediaRuntime::block_on`] or thread-safe primitives.

use crate::error::{PipelineError, PipelineResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Options for building an owned runtime
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Worker thread count; `None` uses tokio's default
    pub worker_threads: Option<usize>,
    /// Name given to runtime threads
    pub thread_name: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "livepipe-runtime".to_string(),
        }
    }
}

struct RuntimeInner {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Shutting down media runtime");
            runtime.shutdown_background();
        }
    }
}

/// Owned handle to the event loop shared by every pipeline component
#[derive(Clone)]
pub struct MediaRuntime {
    inner: Arc<RuntimeInner>,
}

impl MediaRuntime {
    /// Build a multi-threaded runtime with default options
    pub fn new() -> PipelineResult<Self> {
        Self::with_options(RuntimeOptions::default())
    }

    /// Build a multi-threaded runtime
    pub fn with_options(options: RuntimeOptions) -> PipelineResult<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(options.thread_name.clone());
        if let Some(threads) = options.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        let runtime = builder.build().map_err(|e| PipelineError::Runtime {
            reason: format!("Failed to create async runtime: {}", e),
        })?;
        info!(
            "🚀 Media runtime started (threads: {:?})",
            options.worker_threads
        );
        let handle = runtime.handle().clone();
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                runtime: Some(runtime),
                handle,
            }),
        })
    }

    /// Borrow an existing runtime without owning it
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                runtime: None,
                handle,
            }),
        }
    }

    /// Borrow the runtime the caller is currently running on
    pub fn current() -> PipelineResult<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| PipelineError::Runtime {
                reason: format!("No runtime on this thread: {}", e),
            })
    }

    /// Handle used to spawn onto the shared loop
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Spawn a task onto the shared loop
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Run a future to completion from a thread outside the runtime
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.handle.block_on(future)
    }

    /// Whether this value owns the underlying runtime
    pub fn is_owned(&self) -> bool {
        self.inner.runtime.is_some()
    }
}

impl fmt::Debug for MediaRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaRuntime")
            .field("owned", &self.is_owned())
            .finish()
    }
}
