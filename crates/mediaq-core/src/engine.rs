//! Playback engine seam.
//!
//! Commands are fire-and-forget: an engine returns as soon as the request is
//! handed off, and reports progress later as [`EngineEvent`]s delivered to
//! the playback coordinator by whoever owns the engine's event stream.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub trait PlaybackEngine: Send {
    /// Start loading `uri`.  An `Err` means the request could not even be
    /// issued; load failures after that arrive as [`EngineEvent::Error`].
    fn prepare(&mut self, uri: &str) -> Result<(), EngineError>;

    fn set_playing(&mut self, playing: bool);

    fn seek(&mut self, position_ms: i64);

    /// Last position known to the engine.
    fn current_position_ms(&self) -> i64;

    /// Drop whatever the engine holds for the current source.
    fn release(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// The prepared source can play.
    Ready,
    /// Playback stalled waiting for data.
    Buffering,
    PlayingChanged(bool),
    /// The source played to its end.
    Ended,
    Error(String),
}
