use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use crate::PeerId;

pub const DEFAULT_DIRECTORY_PORT: u16 = 9090;

#[derive(Debug, Clone)]
pub struct PeerConfig {

    // Unique positive id, fixed for the peer's lifetime.
    pub peer_id: PeerId,

    // Directory holding this peer's file bodies, one file per name.
    pub files_dir: PathBuf,

    // Address to serve RPCs on. Port 0 picks an ephemeral port.
    pub listen_address: SocketAddr,

    // Endpoint of the bootstrap name directory.
    pub directory_address: SocketAddr,

    // Pause between registering with the directory and looking for a
    // Tracker, so peers launched together can see each other.
    pub startup_grace: Duration,

    // Default cap on outbound data and vote RPCs.
    pub rpc_timeout: Duration,

    // Bound on concurrently served inbound RPC connections.
    pub max_inflight_rpcs: usize,

}

impl PeerConfig {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            files_dir: PathBuf::from("files").join(format!("peer_{}", peer_id)),
            listen_address: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
            directory_address: SocketAddr::new(
                Ipv4Addr::LOCALHOST.into(),
                DEFAULT_DIRECTORY_PORT,
            ),
            startup_grace: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(5),
            max_inflight_rpcs: 16,
        }
    }
}
