//! Create-or-fetch factories for shared pipeline stages
//!
//! Hosts that fan one input into several consumers want a single process
//! track per `(input, processor key)` and a single mix track per key. A
//! [`TrackRegistry`] keeps those stages alive and hands out the existing one
//! on repeated requests. Every session owns one, holding the mix tracks it
//! was built with; [`crate::LivePipe::registry`] gives hosts a free-standing
//! one for stages shared across sessions.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use livepipe_core::{MediaKind, MediaRelay, MediaRuntime, MediaTrack, PipelineResult, SharedTrack};
use livepipe_media::{
    AsyncProcessTrack, MixTrack, MixTrackConfig, Mixer, ProcessTrackConfig, ProcessorFactory,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

type ProcessKey = (String, String);

/// Shared process and mix tracks keyed by host-chosen names
pub struct TrackRegistry {
    runtime: MediaRuntime,
    relay: MediaRelay,
    process_config: ProcessTrackConfig,
    process_tracks: DashMap<ProcessKey, Arc<AsyncProcessTrack>>,
    mix_tracks: DashMap<String, Arc<MixTrack>>,
}

impl TrackRegistry {
    /// Empty registry
    pub fn new(runtime: &MediaRuntime, relay: &MediaRelay) -> Self {
        Self {
            runtime: runtime.clone(),
            relay: relay.clone(),
            process_config: ProcessTrackConfig::default(),
            process_tracks: DashMap::new(),
            mix_tracks: DashMap::new(),
        }
    }

    /// Use `config` for process tracks created from now on
    pub fn with_process_config(mut self, config: ProcessTrackConfig) -> Self {
        self.process_config = config;
        self
    }

    /// The async process track for `(input, key)`, created over a relay proxy
    /// of `input` on first request
    pub fn create_process_track(
        &self,
        input: &SharedTrack,
        key: &str,
        factory: &ProcessorFactory,
    ) -> Arc<AsyncProcessTrack> {
        let map_key = (input.id().to_string(), key.to_string());
        match self.process_tracks.entry(map_key) {
            Entry::Occupied(entry) => {
                debug!("Reusing process track {} for {}/{}", entry.get().id(), input.id(), key);
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                let upstream: SharedTrack = self.relay.subscribe(Arc::clone(input));
                let track = Arc::new(AsyncProcessTrack::with_config(
                    upstream,
                    factory().processor(),
                    self.process_config,
                ));
                info!(
                    "⚙️ Registered process track {} for {}/{}",
                    track.id(),
                    input.id(),
                    key
                );
                Arc::clone(&entry.insert(track))
            }
        }
    }

    /// The mix track for `key`; an existing track gets `mixer` swapped in
    pub fn create_mix_track(
        &self,
        key: &str,
        kind: MediaKind,
        mixer: Arc<dyn Mixer>,
        config: MixTrackConfig,
    ) -> PipelineResult<Arc<MixTrack>> {
        match self.mix_tracks.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Updating mixer of registered mix track {}", key);
                entry.get().update_mixer(mixer);
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let track = Arc::new(MixTrack::new(
                    &self.runtime,
                    &self.relay,
                    kind,
                    mixer,
                    config,
                )?);
                info!("🎛️ Registered {} mix track {} as {}", kind, track.id(), key);
                Ok(Arc::clone(&entry.insert(track)))
            }
        }
    }

    /// Registered process track for `(input_id, key)`
    pub fn process_track(&self, input_id: &str, key: &str) -> Option<Arc<AsyncProcessTrack>> {
        self.process_tracks
            .get(&(input_id.to_string(), key.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registered mix track for `key`
    pub fn mix_track(&self, key: &str) -> Option<Arc<MixTrack>> {
        self.mix_tracks.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Stop and forget the process track for `(input_id, key)`
    pub fn remove_process_track(&self, input_id: &str, key: &str) -> bool {
        match self
            .process_tracks
            .remove(&(input_id.to_string(), key.to_string()))
        {
            Some((_, track)) => {
                track.stop();
                true
            }
            None => false,
        }
    }

    /// Stop and forget the mix track for `key`
    pub fn remove_mix_track(&self, key: &str) -> bool {
        match self.mix_tracks.remove(key) {
            Some((_, track)) => {
                track.stop();
                true
            }
            None => false,
        }
    }

    /// Number of registered tracks
    pub fn len(&self) -> usize {
        self.process_tracks.len() + self.mix_tracks.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and forget every registered track
    pub fn clear(&self) {
        let process_keys: Vec<ProcessKey> =
            self.process_tracks.iter().map(|entry| entry.key().clone()).collect();
        for key in process_keys {
            if let Some((_, track)) = self.process_tracks.remove(&key) {
                track.stop();
            }
        }
        let mix_keys: Vec<String> = self.mix_tracks.iter().map(|entry| entry.key().clone()).collect();
        for key in mix_keys {
            if let Some((_, track)) = self.mix_tracks.remove(&key) {
                track.stop();
            }
        }
        debug!("Cleared track registry");
    }
}

impl fmt::Debug for TrackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackRegistry")
            .field("process_tracks", &self.process_tracks.len())
            .field("mix_tracks", &self.mix_tracks.len())
            .finish()
    }
}
