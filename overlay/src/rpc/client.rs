use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::Mutex, time};
use tokio_util::codec::Framed;
use wire::{Epoch, PeerId, Request, Response, RpcClientCodec};
use super::{Result, RpcError};

type RpcConn = Framed<TcpStream, RpcClientCodec>;

// Outbound call plumbing: one pooled connection per endpoint, one call in
// flight per connection. A timeout or transport error closes the pooled
// connection, so a late reply can never be read by the next call.
pub struct RpcClient {
    pool: Mutex<HashMap<SocketAddr, Arc<Mutex<Option<RpcConn>>>>>,
}

impl RpcClient {

    pub fn new() -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
        }
    }

    // Liveness probe; any failure reads as "not alive".
    pub async fn ping(&self, address: SocketAddr, timeout: Duration) -> bool {
        matches!(
            self.call(address, Request::Ping, timeout).await,
            Ok(Response::Pong)
        )
    }

    pub async fn heartbeat(
        &self,
        address: SocketAddr,
        epoch: Epoch,
        timeout: Duration,
    ) -> Result<bool> {
        match self.call(address, Request::Heartbeat { epoch }, timeout).await? {
            Response::Heartbeat { accepted } => Ok(accepted),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn request_vote(
        &self,
        address: SocketAddr,
        candidate: PeerId,
        epoch: Epoch,
        timeout: Duration,
    ) -> Result<bool> {
        let req = Request::RequestVote { candidate, epoch };
        match self.call(address, req, timeout).await? {
            Response::Vote { granted } => Ok(granted),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn register_files(
        &self,
        address: SocketAddr,
        peer: PeerId,
        files: Vec<String>,
        timeout: Duration,
    ) -> Result<bool> {
        let req = Request::RegisterFiles { peer, files };
        match self.call(address, req, timeout).await? {
            Response::Registered { ok } => Ok(ok),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn search_file(
        &self,
        address: SocketAddr,
        filename: &str,
        timeout: Duration,
    ) -> Result<Vec<PeerId>> {
        let req = Request::SearchFile { filename: filename.to_owned() };
        match self.call(address, req, timeout).await? {
            Response::Holders { peers } => Ok(peers),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn get_file_index(
        &self,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<(PeerId, Vec<String>)>> {
        match self.call(address, Request::GetFileIndex, timeout).await? {
            Response::FileIndex { entries } => Ok(entries),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn download_file(
        &self,
        address: SocketAddr,
        filename: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let req = Request::DownloadFile { filename: filename.to_owned() };
        match self.call(address, req, timeout).await? {
            Response::FileData { data } => Ok(data),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    async fn call(
        &self,
        address: SocketAddr,
        req: Request,
        timeout: Duration,
    ) -> Result<Response> {

        let slot = {
            let mut pool = self.pool.lock().await;
            Arc::clone(pool.entry(address).or_default())
        };

        // One call at a time per endpoint; the slot lock serializes them.
        let mut conn = slot.lock().await;
        tracing::trace!("send: {} to {}", req, address);

        match time::timeout(timeout, exchange(&mut conn, address, req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                *conn = None;
                Err(e)
            },
            Err(_) => {
                *conn = None;
                Err(RpcError::Timeout)
            },
        }
    }
}

async fn exchange(
    conn: &mut Option<RpcConn>,
    address: SocketAddr,
    req: Request,
) -> Result<Response> {

    if conn.is_none() {
        let stream = TcpStream::connect(address).await?;
        *conn = Some(Framed::new(stream, RpcClientCodec));
    }
    let framed = match conn.as_mut() {
        Some(framed) => framed,
        None => return Err(RpcError::ConnectionClosed),
    };

    framed.send(req).await?;
    match framed.next().await {
        Some(Ok(resp)) => Ok(resp),
        Some(Err(e)) => Err(e.into()),
        None => Err(RpcError::ConnectionClosed),
    }
}
