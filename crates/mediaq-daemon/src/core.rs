/// DaemonCore: single-owner event loop around the media service.
///
/// Every input (client commands, translated mpv events, catalog completion,
/// heartbeat) arrives as a `DaemonEvent`.  DaemonCore owns the
/// `MediaService` and the mpv process; nothing else touches them.  Host
/// events raised by the playback coordinator are drained after each input
/// and fanned out to clients as `Broadcast`s.
///
/// Commands that need the catalog are parked on `CatalogCache::ensure_loaded`
/// and re-dispatched from `CatalogLoaded` once the load attempt finishes.
/// Completions travel on their own unbounded channel so a busy command queue
/// can never swallow them.
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use mediaq_core::address::EMPTY_ROOT;
use mediaq_core::catalog::CatalogCache;
use mediaq_core::config::Config;
use mediaq_core::engine::EngineEvent;
use mediaq_core::error::CatalogError;
use mediaq_core::playback::PlaybackSnapshot;
use mediaq_core::protocol::{Broadcast, Command, HostEvent};
use mediaq_core::service::MediaService;
use mediaq_core::source;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::mpv::{EventTranslator, MpvDriver, MpvEngine, MpvEvent};

const HEARTBEAT: Duration = Duration::from_secs(10);

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    ClientCommand(Command),
    /// mpv event, already translated.
    Engine(EngineEvent),
    /// A catalog load attempt finished; `deferred` was waiting on it.
    CatalogLoaded {
        result: Result<(), CatalogError>,
        deferred: Option<Command>,
    },
    HeartbeatTick,
    Shutdown,
}

/// What a freshly connected client needs for its Hello.
#[derive(Clone)]
pub struct StatusView {
    pub snapshot: Arc<RwLock<PlaybackSnapshot>>,
    pub catalog: CatalogCache,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    service: MediaService<MpvEngine>,
    mpv_driver: MpvDriver,
    position_ms: Arc<AtomicI64>,
    host_rx: broadcast::Receiver<HostEvent>,
    event_tx: mpsc::Sender<DaemonEvent>,
    catalog_tx: mpsc::UnboundedSender<DaemonEvent>,
    catalog_rx: mpsc::UnboundedReceiver<DaemonEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
    status: StatusView,
}

impl DaemonCore {
    pub fn new(
        config: &Config,
        broadcast_tx: broadcast::Sender<Broadcast>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let catalog = CatalogCache::from_arc(
            source::source_for(&config.catalog.url, config.catalog.base_url.clone()).into(),
        );

        let position_ms = Arc::new(AtomicI64::new(0));
        let engine = MpvEngine::new(config.playback.default_volume, position_ms.clone());
        let (host_tx, host_rx) = broadcast::channel(64);
        let mut service = MediaService::new(catalog.clone(), engine, host_tx)
            .with_prepare_timeout(Duration::from_secs(config.playback.prepare_timeout_secs));

        let status = StatusView {
            snapshot: Arc::new(RwLock::new(service.snapshot())),
            catalog,
        };

        let (catalog_tx, catalog_rx) = mpsc::unbounded_channel();

        Self {
            service,
            mpv_driver: MpvDriver::new(config.playback.default_volume),
            position_ms,
            host_rx,
            event_tx,
            catalog_tx,
            catalog_rx,
            broadcast_tx,
            status,
        }
    }

    pub fn status_view(&self) -> StatusView {
        self.status.clone()
    }

    /// Run until `Shutdown` or until every event sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        // Warm the catalog so the first browse doesn't wait.
        self.defer_until_loaded(None);
        self.connect_mpv().await;

        loop {
            let evt = tokio::select! {
                evt = event_rx.recv() => match evt {
                    Some(evt) => evt,
                    None => break,
                },
                Some(evt) = self.catalog_rx.recv() => evt,
            };
            match evt {
                DaemonEvent::Shutdown => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                DaemonEvent::ClientCommand(cmd) => {
                    info!("DaemonCore: command {:?}", cmd);
                    self.handle_command(cmd).await;
                }
                DaemonEvent::Engine(evt) => {
                    self.service.on_engine_event(evt);
                }
                DaemonEvent::CatalogLoaded { result, deferred } => match result {
                    Ok(()) => {
                        if let Some(cmd) = deferred {
                            debug!("DaemonCore: catalog ready, replaying {:?}", cmd);
                            self.handle_command(cmd).await;
                        }
                    }
                    Err(e) => {
                        warn!("DaemonCore: {}", e);
                        self.send(Broadcast::Error {
                            message: e.to_string(),
                        });
                    }
                },
                DaemonEvent::HeartbeatTick => {
                    self.heartbeat().await;
                }
            }
            self.drain_host_events().await;
        }

        self.cleanup().await;
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        let needs_catalog = match &cmd {
            Command::Browse { address } => address != EMPTY_ROOT,
            Command::Play { .. } | Command::Search { .. } | Command::SetFavorite { .. } => true,
            _ => false,
        };
        if needs_catalog && !self.service.catalog().is_ready() {
            self.defer_until_loaded(Some(cmd));
            return;
        }

        match cmd {
            Command::Browse { address } => {
                let nodes = self.service.children(&address);
                self.send(Broadcast::Children { address, nodes });
            }
            Command::Play { address } => {
                self.ensure_engine().await;
                if self.service.play_from_address(&address).is_none() {
                    self.send(Broadcast::Error {
                        message: format!("nothing to play at {}", address),
                    });
                }
                self.send_queue();
            }
            Command::Search { query } => {
                self.ensure_engine().await;
                if self.service.play_from_search(&query).is_none() {
                    self.send(Broadcast::Error {
                        message: format!("no results for {:?}", query),
                    });
                }
                self.send_queue();
            }
            Command::Pause => self.service.pause(),
            Command::Resume => {
                self.ensure_engine().await;
                self.service.resume();
            }
            Command::TogglePause => {
                self.ensure_engine().await;
                self.service.toggle();
            }
            Command::Stop => self.service.stop(),
            Command::Seek { ms } => self.service.seek(ms),
            Command::Next => {
                self.ensure_engine().await;
                self.service.next();
                self.send_queue();
            }
            Command::Previous => {
                self.ensure_engine().await;
                self.service.previous();
                self.send_queue();
            }
            Command::SetFavorite {
                track_id,
                favorite,
            } => {
                if !self.service.set_favorite(&track_id, favorite) {
                    self.send(Broadcast::Error {
                        message: format!("unknown track {}", track_id),
                    });
                }
            }
            Command::GetState => {
                let snapshot = self.service.snapshot();
                self.send(Broadcast::State { snapshot });
                self.send_queue();
            }
        }
    }

    /// Park `deferred` until the catalog has finished loading.  The callback
    /// may run on the load worker or inline; the unbounded send never blocks
    /// and only fails once the loop has exited.
    fn defer_until_loaded(&self, deferred: Option<Command>) {
        let tx = self.catalog_tx.clone();
        self.service.catalog().ensure_loaded(move |result| {
            if tx.send(DaemonEvent::CatalogLoaded { result, deferred }).is_err() {
                debug!("DaemonCore: loop gone, catalog completion dropped");
            }
        });
    }

    // ── mpv lifecycle ─────────────────────────────────────────────────────────

    async fn ensure_engine(&mut self) {
        if !self.service.engine().is_attached() || !self.mpv_driver.process_alive() {
            self.connect_mpv().await;
        }
    }

    async fn connect_mpv(&mut self) {
        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(256);
        let handle = match self.mpv_driver.spawn_and_connect(mpv_tx).await {
            Ok(h) => h,
            Err(e) => {
                error!("DaemonCore: mpv unavailable: {}", e);
                self.service.engine_mut().detach();
                return;
            }
        };
        handle.observe_properties().await;

        let mut translator = EventTranslator::new(self.position_ms.clone());
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = mpv_rx.recv().await {
                debug!("mpv event: {}", evt.raw);
                if let Some(engine_evt) = translator.translate(&evt) {
                    if event_tx.send(DaemonEvent::Engine(engine_evt)).await.is_err() {
                        break;
                    }
                }
            }
            debug!("mpv event forwarder exiting");
        });

        self.service.engine_mut().attach(handle);
    }

    async fn heartbeat(&mut self) {
        if self.service.engine().is_attached() && !self.mpv_driver.process_alive() {
            warn!("DaemonCore: heartbeat: mpv process died");
            self.service.engine_mut().detach();
            self.service
                .on_engine_event(EngineEvent::Error("mpv process exited".into()));
        }
        self.service.check_timeout();
    }

    // ── output ────────────────────────────────────────────────────────────────

    async fn drain_host_events(&mut self) {
        loop {
            match self.host_rx.try_recv() {
                Ok(HostEvent::StateUpdated(snapshot)) => {
                    *self.status.snapshot.write().await = snapshot.clone();
                    self.send(Broadcast::State { snapshot });
                }
                Ok(HostEvent::PlaybackStarted) => debug!("DaemonCore: playback active"),
                Ok(HostEvent::PlaybackStopped) => debug!("DaemonCore: playback ended"),
                Ok(HostEvent::NotificationRequired) => {}
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("DaemonCore: missed {} host events, resyncing", n);
                    let snapshot = self.service.snapshot();
                    *self.status.snapshot.write().await = snapshot.clone();
                    self.send(Broadcast::State { snapshot });
                }
                Err(_) => break,
            }
        }
    }

    fn send_queue(&self) {
        let queue = self.service.queue();
        self.send(Broadcast::Queue {
            entries: queue.entries().to_vec(),
            current: queue.current_index(),
        });
    }

    fn send(&self, msg: Broadcast) {
        // No receivers is fine.
        let _ = self.broadcast_tx.send(msg);
    }

    async fn cleanup(&mut self) {
        info!("DaemonCore: cleaning up");
        self.service.stop();
        self.drain_host_events().await;
        self.mpv_driver.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with(event_tx: mpsc::Sender<DaemonEvent>) -> DaemonCore {
        let mut config = Config::default();
        config.catalog.url = "/nonexistent/mediaq/catalog.json".into();
        let (broadcast_tx, _) = broadcast::channel(16);
        DaemonCore::new(&config, broadcast_tx, event_tx)
    }

    #[tokio::test]
    async fn test_catalog_completion_survives_full_event_queue() {
        let (event_tx, _event_rx) = mpsc::channel(1);
        event_tx
            .try_send(DaemonEvent::HeartbeatTick)
            .expect("queue has room for one");
        let mut core = core_with(event_tx);

        core.defer_until_loaded(Some(Command::GetState));

        let evt = tokio::time::timeout(Duration::from_secs(5), core.catalog_rx.recv())
            .await
            .expect("completion in time")
            .expect("channel open");
        assert!(matches!(
            evt,
            DaemonEvent::CatalogLoaded {
                result: Err(CatalogError::LoadFailure(_)),
                deferred: Some(Command::GetState),
            }
        ));
    }
}
