use serde::{Deserialize, Serialize};

use crate::catalog::BrowseNode;
use crate::playback::PlaybackSnapshot;
use crate::queue::QueueEntry;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Notifications from the core to whatever hosts it.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Playback became active; keep the process alive.
    PlaybackStarted,
    /// Playback ended; foreground resources can go.
    PlaybackStopped,
    StateUpdated(PlaybackSnapshot),
    /// Host should (re)render its now-playing notification.
    NotificationRequired,
}

/// Messages sent from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Browse { address: String },
    Play { address: String },
    Pause,
    Resume,
    TogglePause,
    Stop,
    Seek { ms: i64 },
    Next,
    Previous,
    Search { query: String },
    SetFavorite { track_id: String, favorite: bool },
    GetState,
}

/// Messages sent from daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + current snapshot.
    Hello {
        protocol_version: u32,
        catalog_ready: bool,
        snapshot: PlaybackSnapshot,
    },
    Children {
        address: String,
        nodes: Vec<BrowseNode>,
    },
    State {
        snapshot: PlaybackSnapshot,
    },
    Queue {
        entries: Vec<QueueEntry>,
        current: Option<usize>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = u32::try_from(json.len())?;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackState;

    #[test]
    fn test_command_frame() {
        let msg = Message::Command(Command::Play {
            address: "__BY_GENRE__/Rock|a".into(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Play { address }) => assert_eq!(address, "__BY_GENRE__/Rock|a"),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_frame() {
        let snapshot = PlaybackSnapshot {
            rev: 42,
            state: PlaybackState::Paused,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            catalog_ready: true,
            snapshot,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                snapshot,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(snapshot.rev, 42);
                assert_eq!(snapshot.state, PlaybackState::Paused);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let encoded = Message::Command(Command::GetState).encode().unwrap();
        assert!(Message::decode(&encoded[..3]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_string(&Command::Seek { ms: 9000 }).unwrap();
        assert_eq!(json, r#"{"cmd":"Seek","ms":9000}"#);
    }
}
