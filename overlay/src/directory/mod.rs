use std::{net::SocketAddr, sync::Arc, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::Mutex, time};
use tokio_util::codec::Framed;
use wire::{DirectoryClientCodec, DirectoryRequest, DirectoryResponse};
use crate::{Epoch, PeerId, PEER_PREFIX, TRACKER_PREFIX};

pub mod server;

pub use server::DirectoryHandle;

// Matches the directory's own comm timeout on the serving side.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("directory call timed out")]
    Timeout,

    #[error("directory closed the connection")]
    ConnectionClosed,

    #[error("unexpected response from directory")]
    UnexpectedResponse,

}

pub type Result<T> = std::result::Result<T, DirectoryError>;

type DirectoryConn = Framed<TcpStream, DirectoryClientCodec>;

// Thin adapter over the bootstrap registry. Keeps one connection alive
// and reconnects on the next call after a failure.
#[derive(Clone)]
pub struct DirectoryClient {

    address: SocketAddr,

    conn: Arc<Mutex<Option<DirectoryConn>>>,

}

impl DirectoryClient {

    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    // Binds `name` to `endpoint`, replacing any previous binding.
    pub async fn register(&self, name: &str, endpoint: SocketAddr) -> Result<()> {
        let req = DirectoryRequest::Register {
            name: name.to_owned(),
            endpoint: endpoint.to_string(),
        };
        match self.call(req).await? {
            DirectoryResponse::Done { .. } => Ok(()),
            _ => Err(DirectoryError::UnexpectedResponse),
        }
    }

    // Ok(false) if the name wasn't bound.
    pub async fn unregister(&self, name: &str) -> Result<bool> {
        let req = DirectoryRequest::Unregister { name: name.to_owned() };
        match self.call(req).await? {
            DirectoryResponse::Done { ok } => Ok(ok),
            _ => Err(DirectoryError::UnexpectedResponse),
        }
    }

    pub async fn lookup(&self, name: &str) -> Result<Option<SocketAddr>> {
        let req = DirectoryRequest::Lookup { name: name.to_owned() };
        match self.call(req).await? {
            DirectoryResponse::Endpoint { endpoint } => {
                Ok(endpoint.and_then(|raw| parse_endpoint(name, &raw)))
            },
            _ => Err(DirectoryError::UnexpectedResponse),
        }
    }

    // All bindings whose name starts with `prefix`. Entries with an
    // unparseable endpoint are dropped.
    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, SocketAddr)>> {
        let req = DirectoryRequest::List { prefix: prefix.to_owned() };
        match self.call(req).await? {
            DirectoryResponse::Listing { entries } => Ok(entries
                .into_iter()
                .filter_map(|(name, raw)| {
                    parse_endpoint(&name, &raw).map(|addr| (name, addr))
                })
                .collect()),
            _ => Err(DirectoryError::UnexpectedResponse),
        }
    }

    async fn call(&self, req: DirectoryRequest) -> Result<DirectoryResponse> {
        let mut conn = self.conn.lock().await;
        match time::timeout(CALL_TIMEOUT, exchange(&mut conn, self.address, req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                *conn = None;
                Err(e)
            },
            Err(_) => {
                *conn = None;
                Err(DirectoryError::Timeout)
            },
        }
    }
}

async fn exchange(
    conn: &mut Option<DirectoryConn>,
    address: SocketAddr,
    req: DirectoryRequest,
) -> Result<DirectoryResponse> {

    if conn.is_none() {
        let stream = TcpStream::connect(address).await?;
        *conn = Some(Framed::new(stream, DirectoryClientCodec));
    }
    let framed = match conn.as_mut() {
        Some(framed) => framed,
        None => return Err(DirectoryError::ConnectionClosed),
    };

    framed.send(req).await?;
    match framed.next().await {
        Some(Ok(resp)) => Ok(resp),
        Some(Err(e)) => Err(e.into()),
        None => Err(DirectoryError::ConnectionClosed),
    }
}

fn parse_endpoint(name: &str, raw: &str) -> Option<SocketAddr> {
    match raw.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            tracing::warn!("unparseable endpoint {:?} registered for {:?}", raw, name);
            None
        },
    }
}

// Well-known name scheme helpers.

pub fn peer_name(id: PeerId) -> String {
    format!("{}{}", PEER_PREFIX, id)
}

pub fn tracker_name(epoch: Epoch) -> String {
    format!("{}{}", TRACKER_PREFIX, epoch)
}

pub fn parse_peer_id(name: &str) -> Option<PeerId> {
    name.strip_prefix(PEER_PREFIX)?.parse().ok()
}

pub fn parse_tracker_epoch(name: &str) -> Option<Epoch> {
    name.strip_prefix(TRACKER_PREFIX)?.parse().ok()
}
