//! Fan-out relay
//!
//! A raw track is single-consumer. [`MediaRelay::subscribe`] turns one upstream
//! track into any number of independent proxy tracks. The first `recv` on any
//! proxy starts a single pump per upstream that forwards every frame to every
//! subscribed proxy, in order. Each proxy owns its own mailbox, so a slow proxy
//! accumulates frames for its owner to deal with and never holds back another.
//!
//! Subscribers are kept in an arena keyed by a stable integer id; stopping or
//! dropping a proxy removes its entry. When the last proxy of an upstream goes
//! away, or the upstream ends, the pump is released.

use crate::frame::Frame;
use crate::runtime::MediaRuntime;
use crate::track::{MediaTrack, RecvResult, SharedTrack, TrackLifecycle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Subscribers {
    mailboxes: HashMap<u64, mpsc::UnboundedSender<Frame>>,
}

struct RelaySource {
    upstream: SharedTrack,
    subscribers: Mutex<Subscribers>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RelaySource {
    fn abort_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

struct RelayInner {
    handle: Handle,
    sources: Mutex<HashMap<String, Arc<RelaySource>>>,
    next_subscriber_id: AtomicU64,
    stopped: AtomicBool,
}

impl RelayInner {
    fn ensure_pump(self: &Arc<Self>, upstream_id: &str) {
        let source = match self.sources.lock().get(upstream_id) {
            Some(source) => Arc::clone(source),
            None => return,
        };
        let mut pump = source.pump.lock();
        if pump.is_none() {
            debug!("Starting relay pump for track {}", upstream_id);
            let inner = Arc::clone(self);
            let upstream_id = upstream_id.to_string();
            let task_source = Arc::clone(&source);
            *pump = Some(
                self.handle
                    .spawn(async move { inner.run_pump(upstream_id, task_source).await }),
            );
        }
    }

    async fn run_pump(self: Arc<Self>, upstream_id: String, source: Arc<RelaySource>) {
        loop {
            match source.upstream.recv().await {
                Ok(Some(frame)) => {
                    let mut subscribers = source.subscribers.lock();
                    subscribers
                        .mailboxes
                        .retain(|_, mailbox| mailbox.send(frame.clone()).is_ok());
                }
                Ok(None) => {
                    debug!("Relay upstream {} ended", upstream_id);
                    break;
                }
                Err(e) => {
                    warn!("Relay upstream {} failed, ending proxies: {}", upstream_id, e);
                    break;
                }
            }
        }
        self.release(&upstream_id, &source);
    }

    /// Remove the source entry if it is still the one given; dropping it closes
    /// every mailbox so the proxies observe end-of-stream.
    fn release(&self, upstream_id: &str, source: &Arc<RelaySource>) {
        let mut sources = self.sources.lock();
        if let Some(current) = sources.get(upstream_id) {
            if Arc::ptr_eq(current, source) {
                sources.remove(upstream_id);
            }
        }
        drop(sources);
        source.subscribers.lock().mailboxes.clear();
    }

    /// Subscribers are added and removed under the `sources` lock, so a
    /// source is only dropped while it really has no subscriber left.
    fn unsubscribe(&self, upstream_id: &str, subscriber_id: u64) {
        let mut sources = self.sources.lock();
        let source = match sources.get(upstream_id) {
            Some(source) => Arc::clone(source),
            None => return,
        };
        let remaining = {
            let mut subscribers = source.subscribers.lock();
            subscribers.mailboxes.remove(&subscriber_id);
            subscribers.mailboxes.len()
        };
        debug!(
            "Proxy {} unsubscribed from track {} ({} remaining)",
            subscriber_id, upstream_id, remaining
        );
        if remaining == 0 {
            sources.remove(upstream_id);
            drop(sources);
            source.abort_pump();
        }
    }
}

/// Fan-out registry turning one upstream track into many proxies
#[derive(Clone)]
pub struct MediaRelay {
    inner: Arc<RelayInner>,
}

impl MediaRelay {
    /// Create a relay whose pumps run on the given runtime
    pub fn new(runtime: &MediaRuntime) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                handle: runtime.handle().clone(),
                sources: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Create a new proxy of `track`
    pub fn subscribe(&self, track: SharedTrack) -> Arc<RelayTrack> {
        let lifecycle = TrackLifecycle::new(track.kind());
        let upstream_id = track.id().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        if self.inner.stopped.load(Ordering::SeqCst) {
            warn!("Subscribing to track {} on a stopped relay", upstream_id);
            lifecycle.end();
            return Arc::new(RelayTrack {
                lifecycle,
                relay: Arc::clone(&self.inner),
                upstream_id,
                subscriber_id: 0,
                subscribed: AtomicBool::new(false),
                mailbox: tokio::sync::Mutex::new(rx),
            });
        }

        let subscriber_id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sources = self.inner.sources.lock();
            let source = sources.entry(upstream_id.clone()).or_insert_with(|| {
                Arc::new(RelaySource {
                    upstream: track,
                    subscribers: Mutex::new(Subscribers {
                        mailboxes: HashMap::new(),
                    }),
                    pump: Mutex::new(None),
                })
            });
            source.subscribers.lock().mailboxes.insert(subscriber_id, tx);
        }
        debug!(
            "Proxy {} ({}) subscribed to track {}",
            subscriber_id,
            lifecycle.id(),
            upstream_id
        );

        Arc::new(RelayTrack {
            lifecycle,
            relay: Arc::clone(&self.inner),
            upstream_id,
            subscriber_id,
            subscribed: AtomicBool::new(true),
            mailbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Number of live proxies of the given upstream track
    pub fn subscriber_count(&self, upstream_id: &str) -> usize {
        self.inner
            .sources
            .lock()
            .get(upstream_id)
            .map(|source| source.subscribers.lock().mailboxes.len())
            .unwrap_or(0)
    }

    /// Number of upstream tracks currently relayed
    pub fn source_count(&self) -> usize {
        self.inner.sources.lock().len()
    }

    /// Cancel every pump and end every proxy. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let sources: Vec<_> = self.inner.sources.lock().drain().collect();
        info!("🛑 Stopping relay ({} upstream tracks)", sources.len());
        for (_, source) in sources {
            source.abort_pump();
            source.subscribers.lock().mailboxes.clear();
        }
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MediaRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaRelay")
            .field("sources", &self.source_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Proxy track produced by [`MediaRelay::subscribe`]
///
/// Stopping a proxy only unsubscribes it; the upstream track keeps running.
pub struct RelayTrack {
    lifecycle: TrackLifecycle,
    relay: Arc<RelayInner>,
    upstream_id: String,
    subscriber_id: u64,
    subscribed: AtomicBool,
    mailbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl RelayTrack {
    /// Id of the upstream track this proxy observes
    pub fn upstream_id(&self) -> &str {
        &self.upstream_id
    }

    fn unsubscribe(&self) {
        if self.subscribed.swap(false, Ordering::SeqCst) {
            self.relay.unsubscribe(&self.upstream_id, self.subscriber_id);
        }
    }
}

impl fmt::Debug for RelayTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTrack")
            .field("id", &self.lifecycle.id())
            .field("upstream_id", &self.upstream_id)
            .field("subscriber_id", &self.subscriber_id)
            .finish()
    }
}

#[async_trait]
impl MediaTrack for RelayTrack {
    fn lifecycle(&self) -> &TrackLifecycle {
        &self.lifecycle
    }

    async fn recv(&self) -> RecvResult {
        if !self.lifecycle.is_live() {
            return Ok(None);
        }
        self.relay.ensure_pump(&self.upstream_id);

        let mut mailbox = self.mailbox.lock().await;
        tokio::select! {
            frame = mailbox.recv() => match frame {
                Some(frame) => Ok(Some(frame)),
                None => {
                    self.lifecycle.end();
                    Ok(None)
                }
            },
            _ = self.lifecycle.ended() => Ok(None),
        }
    }

    fn stop(&self) {
        self.lifecycle.end();
        self.unsubscribe();
    }
}

impl Drop for RelayTrack {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
