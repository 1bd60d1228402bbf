mod config;
mod election;
mod heartbeat;
mod index;
mod locator;
mod peer;
mod store;
mod watchdog;

pub mod directory;
pub mod rpc;

pub use config::{PeerConfig, DEFAULT_DIRECTORY_PORT};
pub use peer::{Peer, PeerError, PeerHandle, PeerStatus, RoleKind};
pub use store::{FileStore, StoreError};
pub use wire::{Epoch, PeerId};

// Name-directory namespaces. A peer lives at `peer.<id>` for its whole
// lifetime; a Tracker tenure lives at `Tracker_Epoca_<epoch>`.
pub const PEER_PREFIX: &str = "peer.";
pub const TRACKER_PREFIX: &str = "Tracker_Epoca_";
