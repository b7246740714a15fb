//! Catalog sources.
//!
//! A source hands the cache a fresh, one-shot stream of tracks per load
//! attempt.  `open` and the iteration both run on a blocking worker, so
//! implementations are free to do synchronous I/O.
//!
//! The JSON document shape:
//!
//! ```json
//! { "music": [
//!     { "title": "Intro", "album": "Demo", "artist": "Band", "genre": "Rock",
//!       "source": "intro.mp3", "image": "demo.jpg", "trackNumber": 1,
//!       "totalTrackCount": 9, "duration": 103, "site": "https://..." }
//! ] }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::catalog::Track;

pub type TrackStream = Box<dyn Iterator<Item = anyhow::Result<Track>> + Send>;

/// Produces the raw track list for one load attempt.
pub trait CatalogSource: Send + Sync + 'static {
    fn open(&self) -> anyhow::Result<TrackStream>;
}

/// Any closure returning a stream is a source.  Handy for tests and for
/// wiring in-memory catalogs.
impl<F> CatalogSource for F
where
    F: Fn() -> anyhow::Result<TrackStream> + Send + Sync + 'static,
{
    fn open(&self) -> anyhow::Result<TrackStream> {
        self()
    }
}

// ── JSON document ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    music: Vec<JsonTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonTrack {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    album: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    genre: String,
    source: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    track_number: Option<u32>,
    #[serde(default)]
    total_track_count: Option<u32>,
    /// Seconds.
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    site: Option<String>,
}

impl JsonTrack {
    fn into_track(self, base_url: Option<&str>) -> Track {
        let source_uri = resolve_source(&self.source, base_url);
        let id = self.id.unwrap_or_else(|| derive_track_id(&self.source));

        let mut extras = BTreeMap::new();
        if let Some(image) = self.image {
            extras.insert("image".to_string(), resolve_source(&image, base_url));
        }
        if let Some(n) = self.track_number {
            extras.insert("trackNumber".to_string(), n.to_string());
        }
        if let Some(n) = self.total_track_count {
            extras.insert("totalTrackCount".to_string(), n.to_string());
        }
        if let Some(site) = self.site {
            extras.insert("site".to_string(), site);
        }

        Track {
            id,
            genre: self.genre,
            artist: self.artist,
            album: self.album,
            title: self.title,
            duration_ms: self.duration.saturating_mul(1000),
            source_uri,
            extras,
        }
    }
}

fn resolve_source(source: &str, base_url: Option<&str>) -> String {
    let source = source.replace(' ', "%20");
    match base_url {
        Some(base) if !source.contains("://") => {
            format!("{}/{}", base.trim_end_matches('/'), source.trim_start_matches('/'))
        }
        _ => source,
    }
}

/// Id for entries that don't carry one: the first 8 bytes of the SHA-256 of
/// the source path, so it survives rebuilds and restarts.
fn derive_track_id(source: &str) -> String {
    Sha256::digest(source.as_bytes())[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Parse a catalog document into a one-shot track stream.
pub fn parse_catalog_str(content: &str, base_url: Option<&str>) -> anyhow::Result<TrackStream> {
    let doc: CatalogDocument = serde_json::from_str(content)?;
    let base = base_url.map(str::to_string);
    debug!("catalog document: {} entries", doc.music.len());
    Ok(Box::new(
        doc.music
            .into_iter()
            .map(move |t| Ok(t.into_track(base.as_deref()))),
    ))
}

// ── concrete sources ──────────────────────────────────────────────────────────

/// Catalog document already held in memory.
pub struct JsonCatalogSource {
    content: String,
    base_url: Option<String>,
}

impl JsonCatalogSource {
    pub fn new(content: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            content: content.into(),
            base_url,
        }
    }
}

impl CatalogSource for JsonCatalogSource {
    fn open(&self) -> anyhow::Result<TrackStream> {
        parse_catalog_str(&self.content, self.base_url.as_deref())
    }
}

/// Catalog document on local disk, re-read on every attempt.
pub struct FileCatalogSource {
    path: PathBuf,
    base_url: Option<String>,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            path: path.into(),
            base_url,
        }
    }
}

impl CatalogSource for FileCatalogSource {
    fn open(&self) -> anyhow::Result<TrackStream> {
        info!("Reading catalog from {}", self.path.display());
        let content = std::fs::read_to_string(&self.path)?;
        parse_catalog_str(&content, self.base_url.as_deref())
    }
}

/// Remote catalog document.  Must be opened from a blocking worker spawned on
/// a tokio runtime: the request is driven on that runtime's handle.
pub struct HttpCatalogSource {
    url: String,
    base_url: Option<String>,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            url: url.into(),
            base_url,
        }
    }

    async fn fetch(url: &str) -> anyhow::Result<String> {
        let response = reqwest::get(url).await?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }
        Ok(response.text().await?)
    }
}

impl CatalogSource for HttpCatalogSource {
    fn open(&self) -> anyhow::Result<TrackStream> {
        info!("Fetching catalog from {}", self.url);
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("no tokio runtime for catalog fetch: {}", e))?;
        let body = handle.block_on(Self::fetch(&self.url))?;
        // Relative sources resolve against the document's own directory by default.
        let base = self.base_url.clone().or_else(|| {
            self.url
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
        });
        parse_catalog_str(&body, base.as_deref())
    }
}

/// Pick a source for a configured location: `http(s)://` → HTTP, else a file path.
pub fn source_for(location: &str, base_url: Option<String>) -> Box<dyn CatalogSource> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Box::new(HttpCatalogSource::new(location, base_url))
    } else {
        Box::new(FileCatalogSource::new(location, base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "music": [
            { "title": "Jazz in Paris", "album": "Jazz & Blues", "artist": "Media Right Productions",
              "genre": "Jazz & Blues", "source": "Jazz_In_Paris.mp3", "image": "album_art.jpg",
              "trackNumber": 1, "totalTrackCount": 6, "duration": 103, "site": "https://example.org" },
            { "id": "fixed", "title": "The Messenger", "album": "Cinematic", "artist": "Silent Partner",
              "genre": "Cinematic", "source": "https://cdn.example.org/The Messenger.mp3", "duration": 132 }
        ]
    }"#;

    #[test]
    fn test_parse_catalog_document() {
        let tracks: Vec<Track> = parse_catalog_str(DOC, Some("https://cdn.example.org/music/"))
            .unwrap()
            .collect::<anyhow::Result<_>>()
            .unwrap();
        assert_eq!(tracks.len(), 2);

        let first = &tracks[0];
        assert_eq!(first.title, "Jazz in Paris");
        assert_eq!(first.duration_ms, 103_000);
        assert_eq!(first.source_uri, "https://cdn.example.org/music/Jazz_In_Paris.mp3");
        assert_eq!(first.extras.get("trackNumber").map(String::as_str), Some("1"));
        assert_eq!(
            first.extras.get("image").map(String::as_str),
            Some("https://cdn.example.org/music/album_art.jpg")
        );
        assert_eq!(first.id, derive_track_id("Jazz_In_Paris.mp3"));

        let second = &tracks[1];
        assert_eq!(second.id, "fixed");
        assert_eq!(second.source_uri, "https://cdn.example.org/The%20Messenger.mp3");
    }

    #[test]
    fn test_derived_id_is_fixed_digest() {
        assert_eq!(derive_track_id("abc"), "ba7816bf8f01cfea");
        assert_eq!(derive_track_id("a.mp3").len(), 16);
        assert_ne!(derive_track_id("a.mp3"), derive_track_id("b.mp3"));
    }

    #[test]
    fn test_parse_rejects_malformed_document() {
        assert!(parse_catalog_str("{ \"tracks\": [] }", None).is_err());
        assert!(parse_catalog_str("not json", None).is_err());
    }

    #[test]
    fn test_file_source_rereads_each_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{"music": []}"#).unwrap();

        let source = FileCatalogSource::new(&path, None);
        assert_eq!(source.open().unwrap().count(), 0);

        std::fs::write(&path, DOC).unwrap();
        assert_eq!(source.open().unwrap().count(), 2);
    }

    #[test]
    fn test_file_source_missing_file() {
        let source = FileCatalogSource::new("/nonexistent/catalog.json", None);
        assert!(source.open().is_err());
    }
}
