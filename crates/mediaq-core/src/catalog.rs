//! Catalog cache: the indexed track catalog behind a load state machine.
//!
//! ```text
//!   Uninitialized ──ensure_loaded──▶ Loading ──ok──▶ Ready
//!         ▲                            │
//!         └───────────── err ──────────┘
//! ```
//!
//! One mutex guards the state, the queued waiters and the published catalog.
//! The catalog itself is built off-lock on a blocking worker and swapped in
//! as a single `Arc`, so readers see either no catalog or a complete one.
//! Only the caller that moves the state out of `Uninitialized` starts a load;
//! everyone arriving while `Loading` queues a waiter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::address::{self, Dimension, MediaNode, BY_SEARCH};
use crate::error::CatalogError;
use crate::source::{CatalogSource, TrackStream};

pub type LoadResult = Result<(), CatalogError>;

type Waiter = Box<dyn FnOnce(LoadResult) + Send + 'static>;

// ── data model ────────────────────────────────────────────────────────────────

/// One catalog entry.  Never mutated once published; a changed entry is a new
/// `Track` with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub genre: String,
    pub artist: String,
    pub album: String,
    pub title: String,
    pub duration_ms: u64,
    pub source_uri: String,
    /// Presentation-only fields (artwork, track number, ...).
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl Track {
    fn key(&self, dim: Dimension) -> &str {
        match dim {
            Dimension::Genre => &self.genre,
            Dimension::Artist => &self.artist,
        }
    }
}

/// Tracks grouped under one dimension.  Keys keep first-appearance order,
/// groups keep catalog order.
#[derive(Debug, Default)]
struct Grouping {
    keys: Vec<String>,
    groups: HashMap<String, Vec<Arc<Track>>>,
}

impl Grouping {
    fn build(tracks: &[Arc<Track>], dim: Dimension) -> Self {
        let mut grouping = Grouping::default();
        for track in tracks {
            let key = track.key(dim);
            match grouping.groups.get_mut(key) {
                Some(list) => list.push(Arc::clone(track)),
                None => {
                    grouping.keys.push(key.to_string());
                    grouping
                        .groups
                        .insert(key.to_string(), vec![Arc::clone(track)]);
                }
            }
        }
        grouping
    }
}

/// Immutable, fully indexed snapshot of the catalog.
#[derive(Debug, Default)]
pub struct Catalog {
    tracks: Vec<Arc<Track>>,
    by_id: HashMap<String, Arc<Track>>,
    by_genre: Grouping,
    by_artist: Grouping,
}

impl Catalog {
    /// Drain `stream` and build every index in one pass.  A later entry with
    /// an already-seen id replaces the earlier one in place.
    pub fn build(stream: TrackStream) -> anyhow::Result<Self> {
        let mut tracks: Vec<Arc<Track>> = Vec::new();
        let mut position: HashMap<String, usize> = HashMap::new();

        for item in stream {
            let track = Arc::new(item?);
            match position.get(&track.id) {
                Some(&idx) => {
                    debug!("catalog: duplicate id {} replaces earlier entry", track.id);
                    tracks[idx] = track;
                }
                None => {
                    position.insert(track.id.clone(), tracks.len());
                    tracks.push(track);
                }
            }
        }

        let by_id = tracks
            .iter()
            .map(|t| (t.id.clone(), Arc::clone(t)))
            .collect();
        let by_genre = Grouping::build(&tracks, Dimension::Genre);
        let by_artist = Grouping::build(&tracks, Dimension::Artist);

        Ok(Self {
            tracks,
            by_id,
            by_genre,
            by_artist,
        })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// All tracks in catalog order.
    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Track>> {
        self.by_id.get(id)
    }

    /// Distinct keys of `dim`, in first-appearance order.
    pub fn keys(&self, dim: Dimension) -> &[String] {
        &self.grouping(dim).keys
    }

    /// Tracks under `key`, in catalog order.  Empty for an unknown key.
    pub fn tracks_by(&self, dim: Dimension, key: &str) -> &[Arc<Track>] {
        self.grouping(dim)
            .groups
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn grouping(&self, dim: Dimension) -> &Grouping {
        match dim {
            Dimension::Genre => &self.by_genre,
            Dimension::Artist => &self.by_artist,
        }
    }

    pub fn search(&self, query: &SearchQuery) -> Vec<Arc<Track>> {
        self.tracks
            .iter()
            .filter(|t| query.matches(t))
            .cloned()
            .collect()
    }
}

/// Public view of the load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Uninitialized,
    Loading,
    Ready,
}

enum CacheState {
    Uninitialized,
    Loading(Vec<Waiter>),
    Ready(Arc<Catalog>),
}

impl CacheState {
    fn load_state(&self) -> LoadState {
        match self {
            CacheState::Uninitialized => LoadState::Uninitialized,
            CacheState::Loading(_) => LoadState::Loading,
            CacheState::Ready(_) => LoadState::Ready,
        }
    }
}

/// One child of a browse address.  Exactly one of `playable`/`browsable` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseNode {
    pub address: String,
    pub title: String,
    pub subtitle: String,
    pub playable: bool,
    pub browsable: bool,
}

impl BrowseNode {
    pub fn browsable(address: String, title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        Self {
            address,
            title: title.into(),
            subtitle: subtitle.into(),
            playable: false,
            browsable: true,
        }
    }

    pub fn playable(address: String, track: &Track) -> Self {
        Self {
            address,
            title: track.title.clone(),
            subtitle: track.artist.clone(),
            playable: true,
            browsable: false,
        }
    }
}

/// Case-insensitive catalog query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "text")]
pub enum SearchQuery {
    /// Matches genre, artist, album or title.  Empty text matches everything.
    Any(String),
    Genre(String),
    Artist(String),
    Album(String),
    Title(String),
}

impl SearchQuery {
    pub fn matches(&self, track: &Track) -> bool {
        fn has(haystack: &str, needle: &str) -> bool {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
        match self {
            SearchQuery::Any(q) => {
                q.is_empty()
                    || has(&track.genre, q)
                    || has(&track.artist, q)
                    || has(&track.album, q)
                    || has(&track.title, q)
            }
            SearchQuery::Genre(q) => has(&track.genre, q),
            SearchQuery::Artist(q) => has(&track.artist, q),
            SearchQuery::Album(q) => has(&track.album, q),
            SearchQuery::Title(q) => has(&track.title, q),
        }
    }
}

// ── read seam ─────────────────────────────────────────────────────────────────

/// The read-only catalog surface the queue and playback coordinators use.
pub trait CatalogView: Send + Sync {
    fn get_children(&self, address: &str) -> Vec<BrowseNode>;
    fn get_track(&self, id: &str) -> Option<Arc<Track>>;
}

impl<T: CatalogView + ?Sized> CatalogView for Arc<T> {
    fn get_children(&self, address: &str) -> Vec<BrowseNode> {
        (**self).get_children(address)
    }

    fn get_track(&self, id: &str) -> Option<Arc<Track>> {
        (**self).get_track(id)
    }
}

// ── cache ─────────────────────────────────────────────────────────────────────

struct Inner {
    source: Arc<dyn CatalogSource>,
    state: Mutex<CacheState>,
    favorites: RwLock<HashSet<String>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the outcome of the in-flight load and release every waiter.
    fn finish(&self, outcome: anyhow::Result<Catalog>) {
        let (waiters, result) = {
            let mut state = self.lock_state();
            let waiters = match std::mem::replace(&mut *state, CacheState::Uninitialized) {
                CacheState::Loading(waiters) => waiters,
                other => {
                    warn!("catalog: load finished while not loading, ignoring outcome");
                    *state = other;
                    return;
                }
            };
            let result = match outcome {
                Ok(catalog) => {
                    info!(
                        "catalog: LOADING → READY ({} tracks, {} genres, {} artists)",
                        catalog.len(),
                        catalog.keys(Dimension::Genre).len(),
                        catalog.keys(Dimension::Artist).len()
                    );
                    *state = CacheState::Ready(Arc::new(catalog));
                    Ok(())
                }
                Err(e) => {
                    warn!("catalog: LOADING → UNINITIALIZED: {:#}", e);
                    Err(CatalogError::LoadFailure(format!("{:#}", e)))
                }
            };
            (waiters, result)
        };

        debug!("catalog: releasing {} waiter(s)", waiters.len());
        for waiter in waiters {
            waiter(result.clone());
        }
    }
}

/// Cheaply cloneable handle to one catalog cache instance.
#[derive(Clone)]
pub struct CatalogCache {
    inner: Arc<Inner>,
}

impl CatalogCache {
    pub fn new(source: impl CatalogSource) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                state: Mutex::new(CacheState::Uninitialized),
                favorites: RwLock::new(HashSet::new()),
            }),
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.inner.lock_state().load_state()
    }

    pub fn is_ready(&self) -> bool {
        self.load_state() == LoadState::Ready
    }

    /// The published catalog, if any.
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        match &*self.inner.lock_state() {
            CacheState::Ready(catalog) => Some(Arc::clone(catalog)),
            _ => None,
        }
    }

    /// Make sure the catalog is (being) loaded and call `callback` with the
    /// outcome.  Never blocks: when already ready the callback runs inline,
    /// otherwise it runs on the load worker once the in-flight attempt ends.
    pub fn ensure_loaded<F>(&self, callback: F)
    where
        F: FnOnce(LoadResult) + Send + 'static,
    {
        let waiter: Waiter = Box::new(callback);
        let mut state = self.inner.lock_state();

        if let CacheState::Loading(waiters) = &mut *state {
            debug!("catalog: load in flight, queueing waiter");
            waiters.push(waiter);
            return;
        }

        if matches!(*state, CacheState::Ready(_)) {
            drop(state);
            waiter(Ok(()));
            return;
        }

        info!("catalog: UNINITIALIZED → LOADING");
        *state = CacheState::Loading(vec![waiter]);
        drop(state);
        self.spawn_load();
    }

    /// Async form of [`ensure_loaded`](Self::ensure_loaded).
    pub async fn load(&self) -> LoadResult {
        let (tx, rx) = oneshot::channel();
        self.ensure_loaded(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(CatalogError::Closed))
    }

    fn spawn_load(&self) {
        let inner = Arc::clone(&self.inner);
        let job = move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                inner.source.open().and_then(Catalog::build)
            }))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("catalog source panicked")));
            inner.finish(outcome);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }

    pub fn search(&self, query: &SearchQuery) -> Vec<Arc<Track>> {
        self.catalog()
            .map(|c| c.search(query))
            .unwrap_or_default()
    }

    /// Mark or unmark a favourite.  Returns false when the id isn't in the catalog.
    pub fn set_favorite(&self, id: &str, favorite: bool) -> bool {
        if self.get_track(id).is_none() {
            return false;
        }
        let mut favorites = self
            .inner
            .favorites
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if favorite {
            favorites.insert(id.to_string());
        } else {
            favorites.remove(id);
        }
        true
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        self.inner
            .favorites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn children_of(catalog: &Catalog, node: MediaNode) -> Vec<BrowseNode> {
        match node {
            MediaNode::Root => vec![
                BrowseNode::browsable(address::BY_GENRE.to_string(), "Genres", "Songs by genre"),
                BrowseNode::browsable(address::BY_ARTIST.to_string(), "Artists", "Songs by artist"),
            ],
            MediaNode::EmptyRoot | MediaNode::Unknown => Vec::new(),
            MediaNode::VirtualCategory(dim) => catalog
                .keys(dim)
                .iter()
                .filter_map(|key| {
                    let addr = encode_or_skip(&[dim.root_category(), key.as_str()], None)?;
                    let count = catalog.tracks_by(dim, key).len();
                    Some(BrowseNode::browsable(addr, key.clone(), format!("{} tracks", count)))
                })
                .collect(),
            MediaNode::Listing(dim, key) => catalog
                .tracks_by(dim, &key)
                .iter()
                .filter_map(|t| {
                    let addr = encode_or_skip(&[dim.root_category(), key.as_str()], Some(t.id.as_str()))?;
                    Some(BrowseNode::playable(addr, t))
                })
                .collect(),
            MediaNode::Search(query) => catalog
                .search(&SearchQuery::Any(query.clone()))
                .iter()
                .filter_map(|t| {
                    let addr = encode_or_skip(&[BY_SEARCH, query.as_str()], Some(t.id.as_str()))?;
                    Some(BrowseNode::playable(addr, t))
                })
                .collect(),
        }
    }
}

/// Keys containing a separator can't be addressed; they are left out of
/// browse results.
fn encode_or_skip(categories: &[&str], track_id: Option<&str>) -> Option<String> {
    match address::encode(categories, track_id) {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("catalog: skipping unaddressable node: {}", e);
            None
        }
    }
}

impl CatalogView for CatalogCache {
    /// Children of `address`.  Empty while not ready or when the address is
    /// unknown.  Never triggers a load.
    fn get_children(&self, address: &str) -> Vec<BrowseNode> {
        match self.catalog() {
            Some(catalog) => Self::children_of(&catalog, MediaNode::parse(address)),
            None => {
                debug!("catalog: get_children({}) before ready", address);
                Vec::new()
            }
        }
    }

    fn get_track(&self, id: &str) -> Option<Arc<Track>> {
        self.catalog()?.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn track(id: &str, genre: &str, artist: &str) -> Track {
        Track {
            id: id.into(),
            genre: genre.into(),
            artist: artist.into(),
            album: "Album".into(),
            title: format!("Title {}", id),
            duration_ms: 1000,
            source_uri: format!("https://cdn.example.org/{}.mp3", id),
            extras: BTreeMap::new(),
        }
    }

    fn stream(tracks: Vec<Track>) -> TrackStream {
        Box::new(tracks.into_iter().map(Ok))
    }

    #[test]
    fn test_build_indexes_in_source_order() {
        let catalog = Catalog::build(stream(vec![
            track("a", "Rock", "X"),
            track("b", "Jazz", "Y"),
            track("c", "Rock", "Y"),
        ]))
        .unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.keys(Dimension::Genre), ["Rock", "Jazz"]);
        let rock: Vec<_> = catalog
            .tracks_by(Dimension::Genre, "Rock")
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(rock, ["a", "c"]);
        assert!(catalog.tracks_by(Dimension::Genre, "Pop").is_empty());
    }

    #[test]
    fn test_build_shares_track_instances_across_indexes() {
        let catalog = Catalog::build(stream(vec![track("a", "Rock", "X")])).unwrap();
        let by_id = catalog.get("a").unwrap();
        let by_genre = &catalog.tracks_by(Dimension::Genre, "Rock")[0];
        let by_artist = &catalog.tracks_by(Dimension::Artist, "X")[0];
        assert!(Arc::ptr_eq(by_id, by_genre));
        assert!(Arc::ptr_eq(by_id, by_artist));
    }

    #[test]
    fn test_duplicate_id_replaces_in_place() {
        let mut newer = track("a", "Jazz", "X");
        newer.title = "Remaster".into();
        let catalog = Catalog::build(stream(vec![
            track("a", "Rock", "X"),
            track("b", "Rock", "X"),
            newer,
        ]))
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.tracks()[0].title, "Remaster");
        assert_eq!(catalog.keys(Dimension::Genre), ["Jazz", "Rock"]);
        assert!(Arc::ptr_eq(
            catalog.get("a").unwrap(),
            &catalog.tracks_by(Dimension::Genre, "Jazz")[0]
        ));
    }

    #[test]
    fn test_build_propagates_stream_error() {
        let bad: TrackStream = Box::new(
            vec![Ok(track("a", "Rock", "X")), Err(anyhow::anyhow!("truncated"))].into_iter(),
        );
        assert!(Catalog::build(bad).is_err());
    }

    #[test]
    fn test_search_query() {
        let t = track("a", "Jazz & Blues", "Nina");
        assert!(SearchQuery::Any("blues".into()).matches(&t));
        assert!(SearchQuery::Any(String::new()).matches(&t));
        assert!(SearchQuery::Artist("NINA".into()).matches(&t));
        assert!(!SearchQuery::Title("nina".into()).matches(&t));
    }

    #[test]
    fn test_unaddressable_keys_are_skipped() {
        let source = || -> anyhow::Result<TrackStream> {
            Ok(stream(vec![track("a", "Rock", "AC/DC"), track("b", "Rock", "Queen")]))
        };
        let cache = CatalogCache::new(source);
        let catalog = Catalog::build(cache.inner.source.open().unwrap()).unwrap();
        let nodes = CatalogCache::children_of(&catalog, MediaNode::VirtualCategory(Dimension::Artist));
        let titles: Vec<_> = nodes.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, ["Queen"]);
    }

    #[test]
    fn test_finish_outside_loading_is_ignored() {
        let cache = CatalogCache::new(|| -> anyhow::Result<TrackStream> {
            Ok(stream(vec![track("a", "Rock", "X")]))
        });
        assert!(!cache.set_favorite("a", true));

        cache
            .inner
            .finish(Ok(Catalog::build(stream(vec![track("a", "Rock", "X")])).unwrap()));
        assert_eq!(cache.load_state(), LoadState::Uninitialized);
        assert!(cache.get_children(address::ROOT).is_empty());
    }

    #[test]
    fn test_ensure_loaded_without_runtime() {
        let cache = CatalogCache::new(|| -> anyhow::Result<TrackStream> {
            Ok(stream(vec![track("a", "Rock", "X")]))
        });
        let (tx, rx) = std::sync::mpsc::channel();
        cache.ensure_loaded(move |r| {
            let _ = tx.send(r);
        });
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert!(cache.is_ready());
        assert!(cache.set_favorite("a", true));
        assert!(cache.is_favorite("a"));
        assert!(cache.set_favorite("a", false));
        assert!(!cache.is_favorite("a"));
        assert!(!cache.set_favorite("zzz", true));
    }
}
