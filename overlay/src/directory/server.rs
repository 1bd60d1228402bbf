use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use tracing::Instrument;
use wire::{DirectoryRequest, DirectoryResponse, DirectoryServerCodec};
use super::Result;

type Registry = Arc<RwLock<HashMap<String, String>>>;

// Handle to a running name directory. Aborting the task drops every
// binding; the registry is purely in-memory.
pub struct DirectoryHandle {

    pub address: SocketAddr,

    handle: JoinHandle<()>,

}

impl DirectoryHandle {
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

// Binds the registry service and serves it until the handle is dropped
// or shut down.
pub async fn spawn(bind: SocketAddr) -> Result<DirectoryHandle> {

    let listener = TcpListener::bind(bind).await?;
    let address = listener.local_addr()?;
    let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

    let handle = tokio::spawn(
        run(listener, registry).instrument(tracing::info_span!("directory", addr = %address)),
    );
    tracing::info!("name directory listening on {}", address);

    Ok(DirectoryHandle { address, handle })
}

async fn run(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("inbound directory connection error: {}", e);
                continue;
            },
        };
        let registry = Arc::clone(&registry);
        tokio::spawn(
            serve_conn(stream, registry).instrument(tracing::trace_span!("conn", remote = %remote)),
        );
    }
}

async fn serve_conn(stream: TcpStream, registry: Registry) {
    let mut framed = Framed::new(stream, DirectoryServerCodec);
    while let Some(req) = framed.next().await {
        let req = match req {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("directory request error: {}", e);
                break;
            },
        };
        let resp = handle_request(&registry, req).await;
        if framed.send(resp).await.is_err() {
            break;
        }
    }
}

async fn handle_request(registry: &Registry, req: DirectoryRequest) -> DirectoryResponse {
    match req {

        DirectoryRequest::Register { name, endpoint } => {
            tracing::debug!("register {:?} -> {}", name, endpoint);
            registry.write().await.insert(name, endpoint);
            DirectoryResponse::Done { ok: true }
        },

        DirectoryRequest::Unregister { name } => {
            let removed = registry.write().await.remove(&name).is_some();
            tracing::debug!("unregister {:?} (bound: {})", name, removed);
            DirectoryResponse::Done { ok: removed }
        },

        DirectoryRequest::Lookup { name } => DirectoryResponse::Endpoint {
            endpoint: registry.read().await.get(&name).cloned(),
        },

        DirectoryRequest::List { prefix } => {
            let mut entries: Vec<(String, String)> = registry
                .read()
                .await
                .iter()
                .filter(|(name, _)| name.starts_with(&prefix))
                .map(|(name, endpoint)| (name.clone(), endpoint.clone()))
                .collect();
            entries.sort();
            DirectoryResponse::Listing { entries }
        },

    }
}
