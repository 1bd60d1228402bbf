use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch, Semaphore},
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use tracing::Instrument;
use wire::{Request, Response, RpcServerCodec};
use crate::{
    peer::{PeerCommand, PeerTx},
    store::FileStore,
};

// Serves this peer's remote surface. `ping` and `download_file` are
// answered right in the connection task (they are valid in any role and
// touch no peer state); everything else is dispatched to the peer task.
pub(crate) fn spawn(
    listener: TcpListener,
    peer_tx: PeerTx,
    store: Arc<FileStore>,
    max_inflight: usize,
    shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    let workers = Arc::new(Semaphore::new(max_inflight));
    tokio::spawn(run(listener, peer_tx, store, workers, shutdown))
}

async fn run(
    listener: TcpListener,
    peer_tx: PeerTx,
    store: Arc<FileStore>,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<()>,
) {
    loop { tokio::select! {

        conn = listener.accept() => {
            let (stream, remote) = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("inbound rpc connection error: {}", e);
                    continue;
                },
            };
            let peer_tx = peer_tx.clone();
            let store = Arc::clone(&store);
            let workers = Arc::clone(&workers);
            tokio::spawn(
                serve_conn(stream, peer_tx, store, workers)
                    .instrument(tracing::trace_span!("rpc", remote = %remote)),
            );
        }

        // Sender dropped: the peer task is gone.
        _ = shutdown.changed() => break,

    }}
}

async fn serve_conn(
    stream: TcpStream,
    peer_tx: PeerTx,
    store: Arc<FileStore>,
    workers: Arc<Semaphore>,
) {
    // Bounds the number of connections being served at once.
    let _permit = match workers.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let mut framed = Framed::new(stream, RpcServerCodec);
    while let Some(req) = framed.next().await {
        let req = match req {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("rpc decode error: {}", e);
                break;
            },
        };
        tracing::trace!("read: {}", req);

        let resp = match req {

            Request::Ping => Response::Pong,

            Request::DownloadFile { filename } => download(&store, &filename).await,

            state_bound => {
                let (tx, rx) = oneshot::channel();
                if peer_tx.send(PeerCommand::Rpc { request: state_bound, tx }).is_err() {
                    break;
                }
                match rx.await {
                    Ok(resp) => resp,
                    Err(_) => break,
                }
            },

        };

        if let Err(e) = framed.send(resp).await {
            tracing::warn!("rpc send error: {}", e);
            break;
        }
    }
}

// Returns the file's bytes, or an empty payload on miss or read error.
async fn download(store: &FileStore, filename: &str) -> Response {
    match store.read(filename).await {
        Ok(data) => {
            tracing::info!("serving {:?} ({} bytes)", filename, data.len());
            Response::FileData { data }
        },
        Err(e) => {
            tracing::warn!("download of {:?} failed: {}", filename, e);
            Response::FileData { data: Vec::new() }
        },
    }
}
