//! Browse/play surface: the catalog cache, queue and playback coordinator
//! composed behind one owner.
//!
//! Nothing here is global: the host builds a [`CatalogCache`] and an engine,
//! hands them in, and drives the service from a single task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::address::{self, MediaAddress, EMPTY_ROOT, ROOT};
use crate::catalog::{BrowseNode, CatalogCache, CatalogView, SearchQuery, Track};
use crate::engine::{EngineEvent, PlaybackEngine};
use crate::error::CatalogError;
use crate::playback::{PlaybackCoordinator, PlaybackSnapshot};
use crate::protocol::HostEvent;
use crate::queue::{QueueCoordinator, QueueEntry};

pub struct MediaService<E> {
    catalog: CatalogCache,
    queue: QueueCoordinator<CatalogCache>,
    playback: PlaybackCoordinator<E, CatalogCache>,
}

impl<E: PlaybackEngine> MediaService<E> {
    pub fn new(catalog: CatalogCache, engine: E, events: broadcast::Sender<HostEvent>) -> Self {
        Self {
            queue: QueueCoordinator::new(catalog.clone()),
            playback: PlaybackCoordinator::new(engine, catalog.clone(), events),
            catalog,
        }
    }

    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.playback = self.playback.with_prepare_timeout(timeout);
        self
    }

    pub fn catalog(&self) -> &CatalogCache {
        &self.catalog
    }

    pub fn queue(&self) -> &QueueCoordinator<CatalogCache> {
        &self.queue
    }

    pub fn playback(&self) -> &PlaybackCoordinator<E, CatalogCache> {
        &self.playback
    }

    pub fn engine(&self) -> &E {
        self.playback.engine()
    }

    /// For (re)attaching the engine's backend.  Playback state is untouched.
    pub fn engine_mut(&mut self) -> &mut E {
        self.playback.engine_mut()
    }

    // ── browse ───────────────────────────────────────────────────────────────

    pub fn resolve_root(&self) -> MediaAddress {
        address::decode(ROOT)
    }

    /// Children of `address`, loading the catalog first if needed.
    pub async fn browse(&self, address: &str) -> Result<Vec<BrowseNode>, CatalogError> {
        if address == EMPTY_ROOT {
            return Ok(Vec::new());
        }
        if !self.catalog.is_ready() {
            debug!("service: browse({}) waiting for catalog", address);
            self.catalog.load().await?;
        }
        Ok(self.catalog.get_children(address))
    }

    /// Children of `address` from whatever is loaded right now.
    pub fn children(&self, address: &str) -> Vec<BrowseNode> {
        self.catalog.get_children(address)
    }

    pub fn search(&self, query: &SearchQuery) -> Vec<Arc<Track>> {
        self.catalog.search(query)
    }

    pub fn set_favorite(&self, track_id: &str, favorite: bool) -> bool {
        self.catalog.set_favorite(track_id, favorite)
    }

    // ── play ─────────────────────────────────────────────────────────────────

    pub fn select_address(&mut self, address: &str) -> Option<QueueEntry> {
        self.queue.select_address(address)
    }

    /// Select `address` and start playing the resulting entry.
    pub fn play_from_address(&mut self, address: &str) -> Option<QueueEntry> {
        let entry = self.queue.select_address(address);
        self.play_entry(entry, address)
    }

    pub fn play_from_search(&mut self, query: &str) -> Option<QueueEntry> {
        let entry = self.queue.select_search(query);
        self.play_entry(entry, query)
    }

    fn play_entry(&mut self, entry: Option<QueueEntry>, requested: &str) -> Option<QueueEntry> {
        match &entry {
            Some(e) => self.playback.play(e),
            None => info!("service: nothing to play for {}", requested),
        }
        entry
    }

    pub fn pause(&mut self) {
        self.playback.pause();
    }

    /// Resume the prepared track, or start the queue's current entry when
    /// nothing is prepared.
    pub fn resume(&mut self) {
        if !self.playback.resume() {
            if let Some(entry) = self.queue.current_entry().cloned() {
                self.playback.play(&entry);
            }
        }
    }

    pub fn toggle(&mut self) {
        if !self.playback.toggle() {
            self.resume();
        }
    }

    pub fn stop(&mut self) {
        self.playback.stop();
    }

    pub fn seek(&mut self, position_ms: i64) {
        self.playback.seek(position_ms);
    }

    pub fn next(&mut self) -> Option<QueueEntry> {
        let entry = self.queue.skip(1);
        self.play_entry(entry, "next")
    }

    pub fn previous(&mut self) -> Option<QueueEntry> {
        let entry = self.queue.skip(-1);
        self.play_entry(entry, "previous")
    }

    // ── engine / housekeeping ────────────────────────────────────────────────

    /// Feed an engine event in.  A finished track advances the queue; the end
    /// of the queue stops playback.
    pub fn on_engine_event(&mut self, event: EngineEvent) {
        let ended = event == EngineEvent::Ended;
        if !self.playback.on_engine_event(event) || !ended {
            return;
        }
        match self.queue.advance() {
            Some(entry) => {
                info!("service: advancing to {}", entry.track_id);
                self.playback.play(&entry);
            }
            None => {
                info!("service: end of queue");
                self.playback.stop();
            }
        }
    }

    pub fn check_timeout(&mut self) {
        self.playback.check_timeout();
    }

    pub fn snapshot(&mut self) -> PlaybackSnapshot {
        self.playback.snapshot()
    }
}
