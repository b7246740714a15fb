//! In-memory fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mediaq_core::catalog::{BrowseNode, CatalogCache, CatalogView, Track};
use mediaq_core::engine::PlaybackEngine;
use mediaq_core::error::EngineError;
use mediaq_core::source::{CatalogSource, TrackStream};

pub fn track(id: &str, genre: &str, artist: &str) -> Track {
    Track {
        id: id.into(),
        genre: genre.into(),
        artist: artist.into(),
        album: format!("{} album", artist),
        title: format!("Song {}", id),
        duration_ms: 180_000,
        source_uri: format!("https://cdn.example.org/{}.mp3", id),
        extras: BTreeMap::new(),
    }
}

/// `a`, `b` in Rock and `c` in Jazz.
pub fn rock_rock_jazz() -> Vec<Track> {
    vec![
        track("a", "Rock", "Alpha"),
        track("b", "Rock", "Beta"),
        track("c", "Jazz", "Alpha"),
    ]
}

/// Source that counts how often it is opened and how many records it yields.
pub struct CountingSource {
    tracks: Vec<Track>,
    delay: Duration,
    failures_left: AtomicUsize,
    pub opens: Arc<AtomicUsize>,
    pub yielded: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            delay: Duration::ZERO,
            failures_left: AtomicUsize::new(0),
            opens: Arc::new(AtomicUsize::new(0)),
            yielded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep this long inside `open`, keeping the cache in LOADING.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` attempts mid-stream.
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }
}

impl CatalogSource for CountingSource {
    fn open(&self) -> anyhow::Result<TrackStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let yielded = Arc::clone(&self.yielded);
        let mut items: Vec<anyhow::Result<Track>> = self.tracks.iter().cloned().map(Ok).collect();
        if fail {
            items.push(Err(anyhow::anyhow!("connection reset")));
        }
        Ok(Box::new(items.into_iter().inspect(move |_| {
            yielded.fetch_add(1, Ordering::SeqCst);
        })))
    }
}

/// Cache over `tracks`, loaded and ready.
pub async fn ready_cache(tracks: Vec<Track>) -> CatalogCache {
    let cache = CatalogCache::new(CountingSource::new(tracks));
    cache.load().await.expect("catalog load");
    cache
}

/// Wraps a view and counts `get_children` calls.
pub struct CountingView {
    pub inner: CatalogCache,
    pub children_calls: AtomicUsize,
}

impl CountingView {
    pub fn new(inner: CatalogCache) -> Arc<Self> {
        Arc::new(Self {
            inner,
            children_calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.children_calls.load(Ordering::SeqCst)
    }
}

impl CatalogView for CountingView {
    fn get_children(&self, address: &str) -> Vec<BrowseNode> {
        self.children_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_children(address)
    }

    fn get_track(&self, id: &str) -> Option<Arc<Track>> {
        self.inner.get_track(id)
    }
}

/// Engine that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub prepares: Vec<String>,
    pub releases: usize,
    pub playing: bool,
    pub seeks: Vec<i64>,
    pub position_ms: i64,
}

impl PlaybackEngine for RecordingEngine {
    fn prepare(&mut self, uri: &str) -> Result<(), EngineError> {
        self.prepares.push(uri.to_string());
        self.position_ms = 0;
        Ok(())
    }

    fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    fn seek(&mut self, position_ms: i64) {
        self.seeks.push(position_ms);
        self.position_ms = position_ms;
    }

    fn current_position_ms(&self) -> i64 {
        self.position_ms
    }

    fn release(&mut self) {
        self.releases += 1;
    }
}
