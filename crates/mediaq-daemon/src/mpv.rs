/// mpv IPC driver and the mpv-backed playback engine.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → MpvEvent channel
///
///   MpvEngine (PlaybackEngine) ── command queue ──▶ forward_commands ──▶ MpvHandle
///   MpvEvent ──▶ EventTranslator ──▶ EngineEvent
/// ```
///
/// Engine commands go through one ordered queue and are never awaited by the
/// caller; mpv's answer arrives later as an observed property or event.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use mediaq_core::engine::{EngineEvent, PlaybackEngine};
use mediaq_core::error::EngineError;
use mediaq_core::platform;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;
pub const OBS_PAUSED_FOR_CACHE: u64 = 3;

const OBSERVED: [(u64, &str); 3] = [
    (OBS_PAUSE, "pause"),
    (OBS_TIME_POS, "time-pos"),
    (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
];

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// `Some((obs_id, data))` for a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Register observe_property for everything the translator reads.
    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        for (id, name) in &OBSERVED {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process {
            Some(ref mut child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process().await?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                match val.get("request_id").and_then(Value::as_u64) {
                    Some(req_id) => {
                        let Some(tx) = pending.lock().await.remove(&req_id) else {
                            debug!("mpv reader: response for unknown req={}", req_id);
                            continue;
                        };
                        let result = match val["error"].as_str() {
                            Some("success") => Ok(val),
                            other => Err(anyhow::anyhow!(
                                "mpv error: {}",
                                other.unwrap_or("unknown error")
                            )),
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                            debug!("mpv reader: event receiver gone");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: PendingMap,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── engine ────────────────────────────────────────────────────────────────────

/// `PlaybackEngine` over an mpv connection.  Unattached until
/// [`attach`](Self::attach) is given a live handle.
pub struct MpvEngine {
    commands: Option<mpsc::UnboundedSender<Value>>,
    position_ms: Arc<AtomicI64>,
    volume: f32,
}

impl MpvEngine {
    /// `position_ms` is shared with the [`EventTranslator`] that feeds it.
    pub fn new(volume: f32, position_ms: Arc<AtomicI64>) -> Self {
        Self {
            commands: None,
            position_ms,
            volume,
        }
    }

    /// Must be called from within the tokio runtime.
    pub fn attach(&mut self, handle: MpvHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_commands(handle, rx));
        self.commands = Some(tx);
    }

    pub fn detach(&mut self) {
        self.commands = None;
    }

    pub fn is_attached(&self) -> bool {
        self.commands.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn issue(&self, command: Value) -> Result<(), EngineError> {
        let tx = self
            .commands
            .as_ref()
            .ok_or_else(|| EngineError::Unavailable("mpv is not connected".into()))?;
        tx.send(command)
            .map_err(|_| EngineError::Unavailable("mpv command queue closed".into()))
    }
}

impl PlaybackEngine for MpvEngine {
    fn prepare(&mut self, uri: &str) -> Result<(), EngineError> {
        self.position_ms.store(0, Ordering::Relaxed);
        self.issue(json!(["loadfile", uri, "replace"]))?;
        let vol_pct = (self.volume * 100.0).clamp(0.0, 100.0);
        self.issue(json!(["set_property", "volume", vol_pct]))
    }

    fn set_playing(&mut self, playing: bool) {
        if let Err(e) = self.issue(json!(["set_property", "pause", !playing])) {
            debug!("mpv engine: set_playing({}) dropped: {}", playing, e);
        }
    }

    fn seek(&mut self, position_ms: i64) {
        let secs = position_ms as f64 / 1000.0;
        if let Err(e) = self.issue(json!(["set_property", "time-pos", secs])) {
            debug!("mpv engine: seek dropped: {}", e);
        }
        self.position_ms.store(position_ms, Ordering::Relaxed);
    }

    fn current_position_ms(&self) -> i64 {
        self.position_ms.load(Ordering::Relaxed)
    }

    fn release(&mut self) {
        if let Err(e) = self.issue(json!(["stop"])) {
            debug!("mpv engine: stop dropped: {}", e);
        }
    }
}

async fn forward_commands(handle: MpvHandle, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(command) = rx.recv().await {
        if let Err(e) = handle.send(command.clone()).await {
            warn!("mpv: command {} failed: {}", command, e);
        }
    }
    debug!("mpv: command forwarder exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// Turns raw mpv events into engine events and keeps the shared position
/// up to date.
pub struct EventTranslator {
    position_ms: Arc<AtomicI64>,
    stalled: bool,
}

impl EventTranslator {
    pub fn new(position_ms: Arc<AtomicI64>) -> Self {
        Self {
            position_ms,
            stalled: false,
        }
    }

    pub fn translate(&mut self, evt: &MpvEvent) -> Option<EngineEvent> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            return match obs_id {
                OBS_PAUSE => data.as_bool().map(|paused| EngineEvent::PlayingChanged(!paused)),
                OBS_TIME_POS => {
                    if let Some(secs) = data.as_f64() {
                        self.position_ms
                            .store((secs * 1000.0).round() as i64, Ordering::Relaxed);
                    }
                    None
                }
                OBS_PAUSED_FOR_CACHE => match data.as_bool() {
                    Some(true) if !self.stalled => {
                        self.stalled = true;
                        Some(EngineEvent::Buffering)
                    }
                    Some(false) if self.stalled => {
                        self.stalled = false;
                        Some(EngineEvent::Ready)
                    }
                    _ => None,
                },
                _ => None,
            };
        }

        match evt.event_name()? {
            "file-loaded" => {
                self.stalled = false;
                Some(EngineEvent::Ready)
            }
            "end-file" => match evt.raw.get("reason").and_then(Value::as_str) {
                Some("eof") => Some(EngineEvent::Ended),
                Some("error") => Some(EngineEvent::Error(
                    evt.raw
                        .get("file_error")
                        .and_then(Value::as_str)
                        .unwrap_or("playback error")
                        .to_string(),
                )),
                // stop / quit / redirect: we asked for it
                _ => None,
            },
            _ => None,
        }
    }
}
