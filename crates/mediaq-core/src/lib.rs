pub mod address;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod platform;
pub mod playback;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod source;

pub use address::{MediaAddress, MediaNode};
pub use catalog::{BrowseNode, Catalog, CatalogCache, CatalogView, LoadState, SearchQuery, Track};
pub use config::Config;
pub use engine::{EngineEvent, PlaybackEngine};
pub use error::{AddressError, CatalogError, EngineError};
pub use playback::{Action, PlaybackCoordinator, PlaybackSnapshot, PlaybackState};
pub use protocol::{Broadcast, Command, HostEvent, Message, PROTOCOL_VERSION};
pub use queue::{QueueCoordinator, QueueEntry};
pub use service::MediaService;
pub use source::{CatalogSource, TrackStream};
