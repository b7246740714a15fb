//! Playback coordinator: the one state machine between queue selection and
//! the playback engine.
//!
//! ```text
//!   None ──play──▶ Loading ──Ready──▶ Playing ⇄ Paused
//!                     ▲                  │
//!                     └──── Buffering ───┘
//!   any ──stop──▶ Stopped          any ──engine error──▶ Error
//! ```
//!
//! Every transition bumps `rev` and publishes a fresh [`PlaybackSnapshot`] as
//! [`HostEvent::StateUpdated`].

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::catalog::CatalogView;
use crate::engine::{EngineEvent, PlaybackEngine};
use crate::protocol::HostEvent;
use crate::queue::QueueEntry;

pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackState {
    #[default]
    None,
    Loading,
    Playing,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PlayPause,
    Seek,
    SkipToNext,
    SkipToPrevious,
    PlayFromAddress,
    PlayFromSearch,
    Play,
    Pause,
}

impl Action {
    /// Actions offered in `state`.  Derived, never stored.
    pub fn available(state: PlaybackState) -> BTreeSet<Action> {
        let mut actions: BTreeSet<Action> = [
            Action::PlayPause,
            Action::Seek,
            Action::SkipToNext,
            Action::SkipToPrevious,
            Action::PlayFromAddress,
            Action::PlayFromSearch,
        ]
        .into_iter()
        .collect();
        actions.insert(if state == PlaybackState::Playing {
            Action::Pause
        } else {
            Action::Play
        });
        actions
    }
}

/// Point-in-time playback description.  Observers extrapolate the current
/// position as `position_ms + (now - last_update_monotonic_ms) * speed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlaybackSnapshot {
    /// Incremented on every published transition.
    pub rev: u64,
    pub state: PlaybackState,
    pub position_ms: i64,
    pub last_update_monotonic_ms: u64,
    pub speed: f32,
    pub available_actions: BTreeSet<Action>,
    pub track_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct PlaybackCoordinator<E, C> {
    engine: E,
    catalog: C,
    events: broadcast::Sender<HostEvent>,
    state: PlaybackState,
    rev: u64,
    /// Track the engine currently holds.
    prepared: Option<String>,
    /// Track the snapshot reports (survives stop/error for display).
    track_id: Option<String>,
    /// Engine holds resources that `release` must free.
    allocated: bool,
    play_when_ready: bool,
    position_ms: i64,
    last_update: Instant,
    epoch: Instant,
    error: Option<String>,
    loading_since: Option<Instant>,
    prepare_timeout: Duration,
}

impl<E: PlaybackEngine, C: CatalogView> PlaybackCoordinator<E, C> {
    pub fn new(engine: E, catalog: C, events: broadcast::Sender<HostEvent>) -> Self {
        let now = Instant::now();
        Self {
            engine,
            catalog,
            events,
            state: PlaybackState::None,
            rev: 0,
            prepared: None,
            track_id: None,
            allocated: false,
            play_when_ready: false,
            position_ms: 0,
            last_update: now,
            epoch: now,
            error: None,
            loading_since: None,
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
        }
    }

    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn prepared_track(&self) -> Option<&str> {
        self.prepared.as_deref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    // ── commands ─────────────────────────────────────────────────────────────

    /// Play `entry`.  A track the engine already holds is resumed without
    /// being prepared again.
    pub fn play(&mut self, entry: &QueueEntry) {
        if self.prepared.as_deref() == Some(entry.track_id.as_str()) {
            debug!("playback: {} already prepared, resuming", entry.track_id);
            self.play_when_ready = true;
            self.engine.set_playing(true);
            let _ = self.events.send(HostEvent::PlaybackStarted);
            if self.state != PlaybackState::Loading {
                self.transition(PlaybackState::Playing);
            }
            return;
        }

        let Some(track) = self.catalog.get_track(&entry.track_id) else {
            self.fail(format!("unknown track {}", entry.track_id));
            return;
        };

        info!("playback: preparing {} ({})", track.id, track.source_uri);
        self.track_id = Some(track.id.clone());
        self.error = None;
        self.allocated = true;
        if let Err(e) = self.engine.prepare(&track.source_uri) {
            self.fail(e.to_string());
            return;
        }
        self.prepared = Some(track.id.clone());
        self.play_when_ready = true;
        self.engine.set_playing(true);
        self.position_ms = 0;
        self.loading_since = Some(Instant::now());
        let _ = self.events.send(HostEvent::PlaybackStarted);
        self.transition(PlaybackState::Loading);
    }

    /// Suspend.  Only meaningful while playing.
    pub fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            debug!("playback: pause ignored in {:?}", self.state);
            return;
        }
        self.play_when_ready = false;
        self.engine.set_playing(false);
        self.transition(PlaybackState::Paused);
    }

    /// Resume the prepared track.  Returns false when nothing is prepared.
    pub fn resume(&mut self) -> bool {
        if self.prepared.is_none() {
            return false;
        }
        self.play_when_ready = true;
        self.engine.set_playing(true);
        let _ = self.events.send(HostEvent::PlaybackStarted);
        if self.state != PlaybackState::Loading {
            self.transition(PlaybackState::Playing);
        }
        true
    }

    /// Pause when playing, resume otherwise.
    pub fn toggle(&mut self) -> bool {
        if self.state == PlaybackState::Playing {
            self.pause();
            true
        } else {
            self.resume()
        }
    }

    /// Release the engine and end playback.  Safe to call in any state; the
    /// engine is released at most once per prepare.
    pub fn stop(&mut self) {
        self.refresh_position();
        if self.allocated {
            info!("playback: releasing engine");
            self.engine.release();
            self.allocated = false;
        }
        self.prepared = None;
        self.play_when_ready = false;
        self.loading_since = None;

        if self.state != PlaybackState::Stopped {
            self.transition(PlaybackState::Stopped);
            let _ = self.events.send(HostEvent::PlaybackStopped);
        }
    }

    pub fn seek(&mut self, position_ms: i64) {
        let position_ms = position_ms.max(0);
        if !self.allocated {
            debug!("playback: seek ignored, nothing prepared");
            return;
        }
        self.engine.seek(position_ms);
        self.position_ms = position_ms;
        self.last_update = Instant::now();
        self.publish();
    }

    // ── engine events ────────────────────────────────────────────────────────

    /// Translate an engine event into a transition.  Returns `false` when the
    /// event was stale and ignored.
    ///
    /// `Ended` is only honoured while a prepared track is PLAYING or PAUSED; it
    /// forgets that track and parks in PAUSED.  What plays next is the
    /// caller's decision.
    pub fn on_engine_event(&mut self, event: EngineEvent) -> bool {
        debug!("playback: engine event {:?} in {:?}", event, self.state);
        match event {
            EngineEvent::Ready => {
                if self.prepared.is_none() {
                    return false;
                }
                self.loading_since = None;
                if matches!(self.state, PlaybackState::Loading | PlaybackState::None) {
                    self.transition(if self.play_when_ready {
                        PlaybackState::Playing
                    } else {
                        PlaybackState::Paused
                    });
                }
            }
            EngineEvent::Buffering => {
                if self.state == PlaybackState::Playing {
                    self.transition(PlaybackState::Loading);
                }
            }
            EngineEvent::PlayingChanged(playing) => {
                if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
                    return false;
                }
                self.play_when_ready = playing;
                let target = if playing {
                    PlaybackState::Playing
                } else {
                    PlaybackState::Paused
                };
                if target != self.state {
                    self.transition(target);
                }
            }
            EngineEvent::Ended => {
                let active = matches!(self.state, PlaybackState::Playing | PlaybackState::Paused);
                if self.prepared.is_none() || !active {
                    debug!("playback: stale end-of-track ignored");
                    return false;
                }
                self.prepared = None;
                self.play_when_ready = false;
                self.transition(PlaybackState::Paused);
            }
            EngineEvent::Error(message) => {
                if self.prepared.is_none() && !self.allocated {
                    return false;
                }
                self.fail(message);
            }
        }
        true
    }

    /// Fail a prepare that has not become ready within the timeout.
    pub fn check_timeout(&mut self) {
        if let Some(since) = self.loading_since {
            if since.elapsed() >= self.prepare_timeout {
                self.fail(format!(
                    "timed out after {}s waiting for engine",
                    self.prepare_timeout.as_secs()
                ));
            }
        }
    }

    // ── snapshot ─────────────────────────────────────────────────────────────

    /// Current snapshot with a freshly sampled position.
    pub fn snapshot(&mut self) -> PlaybackSnapshot {
        self.refresh_position();
        self.build_snapshot()
    }

    fn build_snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            rev: self.rev,
            state: self.state,
            position_ms: self.position_ms,
            last_update_monotonic_ms: self.monotonic_ms(self.last_update),
            speed: if self.state == PlaybackState::Playing {
                1.0
            } else {
                0.0
            },
            available_actions: Action::available(self.state),
            track_id: self.track_id.clone(),
            error: self.error.clone(),
        }
    }

    fn monotonic_ms(&self, at: Instant) -> u64 {
        u64::try_from(at.duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    fn refresh_position(&mut self) {
        if self.allocated {
            self.position_ms = self.engine.current_position_ms();
        }
        self.last_update = Instant::now();
    }

    fn fail(&mut self, message: String) {
        warn!("playback: error: {}", message);
        self.prepared = None;
        self.play_when_ready = false;
        self.loading_since = None;
        self.error = Some(message);
        self.transition(PlaybackState::Error);
    }

    fn transition(&mut self, next: PlaybackState) {
        if self.state != next {
            info!("playback: {:?} → {:?}", self.state, next);
        }
        self.state = next;
        if next != PlaybackState::Error {
            self.error = None;
        }
        self.refresh_position();
        self.publish();
    }

    fn publish(&mut self) {
        self.rev += 1;
        let snapshot = self.build_snapshot();
        let _ = self.events.send(HostEvent::StateUpdated(snapshot));
        if matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            let _ = self.events.send(HostEvent::NotificationRequired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BrowseNode, Track};
    use crate::error::EngineError;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeEngine {
        prepared: Vec<String>,
        playing: bool,
        releases: usize,
        fail_prepare: bool,
    }

    impl PlaybackEngine for FakeEngine {
        fn prepare(&mut self, uri: &str) -> Result<(), EngineError> {
            if self.fail_prepare {
                return Err(EngineError::Unavailable("no output".into()));
            }
            self.prepared.push(uri.to_string());
            Ok(())
        }
        fn set_playing(&mut self, playing: bool) {
            self.playing = playing;
        }
        fn seek(&mut self, _position_ms: i64) {}
        fn current_position_ms(&self) -> i64 {
            1234
        }
        fn release(&mut self) {
            self.releases += 1;
        }
    }

    struct OneTrack;

    impl CatalogView for OneTrack {
        fn get_children(&self, _address: &str) -> Vec<BrowseNode> {
            Vec::new()
        }
        fn get_track(&self, id: &str) -> Option<Arc<Track>> {
            (id == "t1").then(|| {
                Arc::new(Track {
                    id: "t1".into(),
                    genre: "Rock".into(),
                    artist: "A".into(),
                    album: "B".into(),
                    title: "C".into(),
                    duration_ms: 5000,
                    source_uri: "file:///t1.mp3".into(),
                    extras: BTreeMap::new(),
                })
            })
        }
    }

    fn entry(id: &str) -> QueueEntry {
        QueueEntry {
            position: 0,
            track_id: id.into(),
            address: format!("__BY_GENRE__/Rock|{}", id),
        }
    }

    fn coordinator() -> PlaybackCoordinator<FakeEngine, OneTrack> {
        let (tx, _) = broadcast::channel(64);
        PlaybackCoordinator::new(FakeEngine::default(), OneTrack, tx)
    }

    #[test]
    fn test_play_goes_through_loading() {
        let mut pb = coordinator();
        let mut rx = pb.subscribe();
        pb.play(&entry("t1"));
        assert_eq!(pb.state(), PlaybackState::Loading);
        assert!(pb.engine().playing);
        assert!(matches!(rx.try_recv(), Ok(HostEvent::PlaybackStarted)));

        pb.on_engine_event(EngineEvent::Ready);
        assert_eq!(pb.state(), PlaybackState::Playing);
        let snap = pb.snapshot();
        assert_eq!(snap.speed, 1.0);
        assert_eq!(snap.position_ms, 1234);
        assert!(snap.available_actions.contains(&Action::Pause));
        assert!(!snap.available_actions.contains(&Action::Play));
    }

    #[test]
    fn test_pause_only_from_playing() {
        let mut pb = coordinator();
        pb.pause();
        assert_eq!(pb.state(), PlaybackState::None);

        pb.play(&entry("t1"));
        pb.pause();
        assert_eq!(pb.state(), PlaybackState::Loading);

        pb.on_engine_event(EngineEvent::Ready);
        pb.pause();
        assert_eq!(pb.state(), PlaybackState::Paused);
        assert!(!pb.engine().playing);
        assert!(pb.snapshot().available_actions.contains(&Action::Play));
    }

    #[test]
    fn test_unknown_track_is_error() {
        let mut pb = coordinator();
        pb.play(&entry("nope"));
        let snap = pb.snapshot();
        assert_eq!(snap.state, PlaybackState::Error);
        assert_eq!(snap.error.as_deref(), Some("unknown track nope"));
    }

    #[test]
    fn test_ended_publishes_and_parks() {
        let mut pb = coordinator();
        assert!(!pb.on_engine_event(EngineEvent::Ended));

        pb.play(&entry("t1"));
        assert!(!pb.on_engine_event(EngineEvent::Ended));
        assert_eq!(pb.state(), PlaybackState::Loading);

        pb.on_engine_event(EngineEvent::Ready);
        let mut rx = pb.subscribe();
        assert!(pb.on_engine_event(EngineEvent::Ended));
        assert_eq!(pb.state(), PlaybackState::Paused);
        assert_eq!(pb.prepared_track(), None);

        let published: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                HostEvent::StateUpdated(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].state, PlaybackState::Paused);
        assert_eq!(published[0].speed, 0.0);

        // A second end for the same source is stale.
        assert!(!pb.on_engine_event(EngineEvent::Ended));
    }

    #[test]
    fn test_engine_error_reported_verbatim_and_replay_prepares_again() {
        let mut pb = coordinator();
        pb.play(&entry("t1"));
        pb.on_engine_event(EngineEvent::Error("decoder exploded".into()));
        let snap = pb.snapshot();
        assert_eq!(snap.state, PlaybackState::Error);
        assert_eq!(snap.error.as_deref(), Some("decoder exploded"));

        pb.play(&entry("t1"));
        assert_eq!(pb.engine().prepared.len(), 2);
        assert_eq!(pb.state(), PlaybackState::Loading);
        assert!(pb.snapshot().error.is_none());
    }

    #[test]
    fn test_prepare_failure() {
        let (tx, _) = broadcast::channel(8);
        let engine = FakeEngine {
            fail_prepare: true,
            ..Default::default()
        };
        let mut pb = PlaybackCoordinator::new(engine, OneTrack, tx);
        pb.play(&entry("t1"));
        assert_eq!(pb.state(), PlaybackState::Error);
        pb.stop();
        assert_eq!(pb.engine().releases, 1);
    }

    #[test]
    fn test_rev_increments_per_transition() {
        let mut pb = coordinator();
        let r0 = pb.snapshot().rev;
        pb.play(&entry("t1"));
        pb.on_engine_event(EngineEvent::Ready);
        assert_eq!(pb.snapshot().rev, r0 + 2);
    }

    #[test]
    fn test_buffering_round_trip() {
        let mut pb = coordinator();
        pb.play(&entry("t1"));
        pb.on_engine_event(EngineEvent::Ready);
        pb.on_engine_event(EngineEvent::Buffering);
        assert_eq!(pb.state(), PlaybackState::Loading);
        pb.on_engine_event(EngineEvent::Ready);
        assert_eq!(pb.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_external_pause_is_observed() {
        let mut pb = coordinator();
        pb.play(&entry("t1"));
        pb.on_engine_event(EngineEvent::Ready);
        pb.on_engine_event(EngineEvent::PlayingChanged(false));
        assert_eq!(pb.state(), PlaybackState::Paused);
        assert!(pb.toggle());
        assert_eq!(pb.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_prepare_timeout() {
        let mut pb = coordinator().with_prepare_timeout(Duration::ZERO);
        pb.play(&entry("t1"));
        pb.check_timeout();
        assert_eq!(pb.state(), PlaybackState::Error);
    }

    #[test]
    fn test_stop_emits_stopped_once() {
        let mut pb = coordinator();
        let mut rx = pb.subscribe();
        pb.play(&entry("t1"));
        pb.stop();
        pb.stop();
        let stopped = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, HostEvent::PlaybackStopped))
            .count();
        assert_eq!(stopped, 1);
        assert_eq!(pb.engine().releases, 1);
    }
}
