use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tracing::Instrument;
use wire::{Epoch, PeerId, Request, Response};
use crate::{
    config::PeerConfig,
    directory::{self, DirectoryClient, DirectoryError},
    election, heartbeat,
    index::FileIndex,
    locator::TrackerLocator,
    rpc::{self, RpcClient, RpcError},
    store::{FileStore, StoreError},
    watchdog::{self, WatchdogCmd, WatchdogTx},
    TRACKER_PREFIX,
};

// Registration attempts for ordinary re-advertisement: one call plus one
// retry after re-resolving the Tracker.
const REGISTER_ATTEMPTS: u32 = 2;

// A freshly downloaded file gets more patience, it may land mid-handover.
const DOWNLOAD_REGISTER_ATTEMPTS: u32 = 3;

const REGISTER_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no tracker is currently registered")]
    NoTracker,

    #[error("peer {0} is not registered")]
    UnknownPeer(PeerId),

    #[error("peer {0} returned no data for {1:?}")]
    EmptyDownload(PeerId, String),

    #[error("peer task has shut down")]
    PeerDropped,

}

pub type Result<T> = std::result::Result<T, PeerError>;
pub(crate) type PeerTx = mpsc::UnboundedSender<PeerCommand>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

// Commands that can be sent to the peer task from other tasks.
pub(crate) enum PeerCommand {

    // State-touching RPC dispatched by the server.
    Rpc { request: Request, tx: oneshot::Sender<Response> },

    // Watchdog gave up on the Tracker.
    TrackerTimeout,

    // The election task casting this peer's own ballot.
    ClaimVote { epoch: Epoch, tx: oneshot::Sender<bool> },

    ElectionWon { epoch: Epoch },

    ElectionLost { epoch: Epoch },

    Status { tx: oneshot::Sender<PeerStatus> },

    Shutdown,

}

// Read-mostly state shared by the background workers and the handle.
pub(crate) struct PeerContext {

    pub peer_id: PeerId,

    // Our own RPC endpoint, as registered in the directory.
    pub endpoint: SocketAddr,

    pub store: Arc<FileStore>,

    pub directory: DirectoryClient,

    pub locator: TrackerLocator,

    pub client: RpcClient,

    pub peer_tx: PeerTx,

    // Cap on outbound data and vote RPCs.
    pub rpc_timeout: Duration,

}

// Role is a tagged state: only the Tracker variant owns an index and a
// heartbeat tenure, so the index cannot outlive the role.
enum Role {

    Follower,

    Candidate,

    Tracker {
        index: FileIndex,
        // Dropping this stops the heartbeat emitter.
        _tenure: watch::Sender<()>,
    },

}

impl Role {
    fn kind(&self) -> RoleKind {
        match self {
            Role::Follower => RoleKind::Follower,
            Role::Candidate => RoleKind::Candidate,
            Role::Tracker { .. } => RoleKind::Tracker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Follower,
    Candidate,
    Tracker,
}

#[derive(Debug, Clone)]
pub struct PeerStatus {

    pub peer_id: PeerId,

    pub role: RoleKind,

    pub current_epoch: Epoch,

    pub endpoint: SocketAddr,

}

pub struct Peer {

    ctx: Arc<PeerContext>,

    config: PeerConfig,

    role: Role,

    current_epoch: Epoch,

    // Highest epoch this peer has granted a vote in, own ballots included.
    voted_for_epoch: Epoch,

    // Monotonic arrival time of the last accepted heartbeat.
    last_heartbeat: Option<Instant>,

    // Epoch of the candidacy in flight, if any.
    election_epoch: Option<Epoch>,

    peer_rx: PeerRx,

    watchdog_tx: WatchdogTx,

    watchdog_handle: JoinHandle<()>,

    server_handle: JoinHandle<()>,

    // Dropped on exit; the rpc server watches it.
    _shutdown_tx: watch::Sender<()>,

}

impl Peer {

    // Binds the RPC endpoint, registers `peer.<id>` with the directory
    // and starts the peer task.
    pub async fn spawn(config: PeerConfig) -> Result<PeerHandle> {

        let listener = TcpListener::bind(config.listen_address).await?;
        let endpoint = listener.local_addr()?;
        let store = Arc::new(FileStore::open(&config.files_dir).await?);
        let directory = DirectoryClient::new(config.directory_address);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(PeerContext {
            peer_id: config.peer_id,
            endpoint,
            store: Arc::clone(&store),
            directory: directory.clone(),
            locator: TrackerLocator::new(directory),
            client: RpcClient::new(),
            peer_tx: peer_tx.clone(),
            rpc_timeout: config.rpc_timeout,
        });

        // Make ourselves reachable before joining the overlay.
        let name = directory::peer_name(config.peer_id);
        ctx.directory.register(&name, endpoint).await?;
        tracing::info!("registered as {} at {}", name, endpoint);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let server_handle = rpc::server::spawn(
            listener,
            peer_tx.clone(),
            store,
            config.max_inflight_rpcs,
            shutdown_rx,
        );
        let (watchdog_handle, watchdog_tx) = watchdog::spawn(Arc::clone(&ctx));

        let peer_id = config.peer_id;
        let peer = Peer {
            ctx: Arc::clone(&ctx),
            config,
            role: Role::Follower,
            current_epoch: 0,
            voted_for_epoch: 0,
            last_heartbeat: None,
            election_epoch: None,
            peer_rx,
            watchdog_tx,
            watchdog_handle,
            server_handle,
            _shutdown_tx: shutdown_tx,
        };
        let handle = tokio::spawn(
            peer.run().instrument(tracing::info_span!("peer", id = peer_id)),
        );

        Ok(PeerHandle {
            peer_id,
            endpoint,
            ctx,
            peer_tx,
            handle,
        })
    }

    async fn run(mut self) {

        // Let peers launched alongside us register before we go looking
        // for a Tracker.
        time::sleep(self.config.startup_grace).await;
        self.join().await;

        while let Some(cmd) = self.peer_rx.recv().await {
            match cmd {

                PeerCommand::Rpc { request, tx } => {
                    let resp = self.handle_rpc(request).await;
                    tx.send(resp).ok();
                },

                PeerCommand::TrackerTimeout => self.start_election(),

                PeerCommand::ClaimVote { epoch, tx } => {
                    tx.send(self.claim_vote(epoch)).ok();
                },

                PeerCommand::ElectionWon { epoch } => self.handle_election_won(epoch).await,

                PeerCommand::ElectionLost { epoch } => self.handle_election_lost(epoch),

                PeerCommand::Status { tx } => {
                    tx.send(self.status()).ok();
                },

                PeerCommand::Shutdown => break,

            }
        }

        self.shutdown().await;
    }

    // Startup: adopt the highest-epoch Tracker if one is registered,
    // otherwise escalate straight to election.
    async fn join(&mut self) {
        match self.ctx.locator.refresh().await {

            Ok(Some((address, epoch))) => {
                tracing::info!("found tracker for epoch {} at {}", epoch, address);
                self.current_epoch = epoch;
                self.last_heartbeat = Some(Instant::now());
                spawn_advertise(&self.ctx, REGISTER_ATTEMPTS);
                self.watchdog_tx.send(WatchdogCmd::Reset).ok();
            },

            Ok(None) => {
                tracing::info!("no tracker registered, starting election");
                self.start_election();
            },

            Err(e) => {
                tracing::error!("tracker lookup failed: {}", e);
                self.start_election();
            },

        }
    }

    async fn handle_rpc(&mut self, request: Request) -> Response {
        match request {

            Request::Heartbeat { epoch } => Response::Heartbeat {
                accepted: self.on_heartbeat(epoch).await,
            },

            Request::RequestVote { candidate, epoch } => Response::Vote {
                granted: self.on_request_vote(candidate, epoch),
            },

            Request::RegisterFiles { peer, files } => Response::Registered {
                ok: self.on_register_files(peer, files),
            },

            Request::SearchFile { filename } => Response::Holders {
                peers: self.on_search(&filename),
            },

            Request::GetFileIndex => Response::FileIndex {
                entries: self.on_file_index(),
            },

            // Answered by the rpc server task; kept total for safety.
            Request::Ping => Response::Pong,
            Request::DownloadFile { .. } => Response::FileData { data: Vec::new() },

        }
    }

    // Heartbeat acceptance drives everything: epoch adoption, role
    // demotion, re-advertisement and the failure detector.
    async fn on_heartbeat(&mut self, epoch: Epoch) -> bool {

        if epoch < self.current_epoch {
            tracing::debug!(
                "rejecting stale heartbeat for epoch {} (current {})",
                epoch, self.current_epoch,
            );
            return false;
        }

        self.last_heartbeat = Some(Instant::now());

        if epoch > self.current_epoch {
            tracing::info!(
                "observed tracker with epoch {} (was {}), re-registering files",
                epoch, self.current_epoch,
            );
            self.current_epoch = epoch;
            self.step_down();
            // The next locate walks the directory and finds the new Tracker.
            self.ctx.locator.invalidate().await;
            spawn_advertise(&self.ctx, REGISTER_ATTEMPTS);
        }

        // An accepted heartbeat re-arms the detector, unless we are the
        // Tracker ourselves (equal-epoch echoes must not wake it).
        if !matches!(self.role, Role::Tracker { .. }) {
            self.watchdog_tx.send(WatchdogCmd::Reset).ok();
        }
        true
    }

    // Strict single vote per epoch: grant only an epoch newer than both
    // what we have seen and what we have voted in.
    fn on_request_vote(&mut self, candidate: PeerId, epoch: Epoch) -> bool {
        if epoch > self.current_epoch && epoch > self.voted_for_epoch {
            tracing::info!("granting vote to peer {} for epoch {}", candidate, epoch);
            self.voted_for_epoch = epoch;
            true
        } else {
            tracing::info!(
                "denying vote to peer {} for epoch {} (current {}, voted {})",
                candidate, epoch, self.current_epoch, self.voted_for_epoch,
            );
            false
        }
    }

    fn on_register_files(&mut self, peer: PeerId, files: Vec<String>) -> bool {
        match &mut self.role {
            Role::Tracker { index, .. } => {
                tracing::info!("registering {} files for peer {}", files.len(), peer);
                index.register(peer, files);
                true
            },
            _ => false,
        }
    }

    fn on_search(&self, filename: &str) -> Vec<PeerId> {
        match &self.role {
            Role::Tracker { index, .. } => {
                let holders = index.search(filename);
                tracing::info!("peers holding {:?}: {:?}", filename, holders);
                holders
            },
            _ => Vec::new(),
        }
    }

    fn on_file_index(&self) -> Vec<(PeerId, Vec<String>)> {
        match &self.role {
            Role::Tracker { index, .. } => index.snapshot(),
            _ => Vec::new(),
        }
    }

    fn start_election(&mut self) {

        if matches!(self.role, Role::Tracker { .. }) {
            return;
        }
        if self.election_epoch.is_some() {
            tracing::debug!("election already in progress, ignoring trigger");
            return;
        }

        if let Some(at) = self.last_heartbeat {
            tracing::info!("last accepted heartbeat was {:?} ago", at.elapsed());
        }

        // Going past voted_for_epoch keeps a pair of peers whose ballots
        // cancelled out from re-contesting an epoch neither can claim.
        let epoch = self.current_epoch.max(self.voted_for_epoch) + 1;
        tracing::info!("starting election for epoch {}", epoch);

        self.role = Role::Candidate;
        self.election_epoch = Some(epoch);
        self.watchdog_tx.send(WatchdogCmd::Suspend).ok();
        election::spawn(Arc::clone(&self.ctx), epoch);
    }

    fn claim_vote(&mut self, epoch: Epoch) -> bool {
        if self.election_epoch != Some(epoch) || !matches!(self.role, Role::Candidate) {
            return false;
        }
        if epoch > self.current_epoch && epoch > self.voted_for_epoch {
            self.voted_for_epoch = epoch;
            true
        } else {
            false
        }
    }

    async fn handle_election_won(&mut self, epoch: Epoch) {

        if self.election_epoch != Some(epoch) || !matches!(self.role, Role::Candidate) {
            tracing::debug!("discarding stale election win for epoch {}", epoch);
            return;
        }
        self.election_epoch = None;

        if let Err(e) = self.become_tracker(epoch).await {
            tracing::error!("could not take over as tracker for epoch {}: {}", epoch, e);
            self.role = Role::Follower;
            self.watchdog_tx.send(WatchdogCmd::Reset).ok();
        }
    }

    fn handle_election_lost(&mut self, epoch: Epoch) {
        if self.election_epoch != Some(epoch) {
            return;
        }
        self.election_epoch = None;
        if matches!(self.role, Role::Candidate) {
            self.role = Role::Follower;
        }
        self.watchdog_tx.send(WatchdogCmd::Reset).ok();
    }

    async fn become_tracker(&mut self, epoch: Epoch) -> Result<()> {

        tracing::info!("won election, becoming tracker for epoch {}", epoch);
        self.current_epoch = epoch;

        // Seed the index with our own files before anyone can query it.
        let files = self.ctx.store.scan().await?;
        let mut index = FileIndex::new();
        index.register(self.ctx.peer_id, files);

        // Purge stale tenures; best effort, a leftover name with a lower
        // epoch loses to ours anyway.
        match self.ctx.directory.list(TRACKER_PREFIX).await {
            Ok(entries) => {
                for (name, _) in entries {
                    if let Err(e) = self.ctx.directory.unregister(&name).await {
                        tracing::warn!("could not remove stale {}: {}", name, e);
                    }
                }
            },
            Err(e) => tracing::warn!("could not enumerate stale trackers: {}", e),
        }

        let name = directory::tracker_name(epoch);
        self.ctx.directory.register(&name, self.ctx.endpoint).await?;
        self.ctx.locator.set(self.ctx.endpoint, epoch).await;

        let (tenure, _handle) = heartbeat::spawn(Arc::clone(&self.ctx), epoch);
        self.role = Role::Tracker { index, _tenure: tenure };
        self.watchdog_tx.send(WatchdogCmd::Suspend).ok();

        tracing::info!("registered as {}", name);
        Ok(())
    }

    fn step_down(&mut self) {
        match &self.role {
            Role::Tracker { .. } => {
                tracing::info!("superseded by a higher epoch, stepping down as tracker");
            },
            Role::Candidate => {
                tracing::info!("superseded by a higher epoch, abandoning candidacy");
            },
            Role::Follower => {},
        }
        // Dropping a Tracker role stops the heartbeat emitter.
        self.role = Role::Follower;
        self.election_epoch = None;
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            peer_id: self.ctx.peer_id,
            role: self.role.kind(),
            current_epoch: self.current_epoch,
            endpoint: self.ctx.endpoint,
        }
    }

    async fn shutdown(self) {
        tracing::info!("peer shutting down");
        let Peer {
            role,
            watchdog_tx,
            watchdog_handle,
            server_handle,
            _shutdown_tx,
            ..
        } = self;
        // Stops the heartbeat emitter, the watchdog and the rpc server.
        drop(role);
        drop(watchdog_tx);
        drop(_shutdown_tx);
        watchdog_handle.await.ok();
        server_handle.await.ok();
        tracing::info!("peer stopped");
    }
}

// Owner's view of a running peer.
pub struct PeerHandle {

    peer_id: PeerId,

    endpoint: SocketAddr,

    ctx: Arc<PeerContext>,

    peer_tx: PeerTx,

    handle: JoinHandle<()>,

}

impl PeerHandle {

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub async fn status(&self) -> Result<PeerStatus> {
        let (tx, rx) = oneshot::channel();
        self.peer_tx
            .send(PeerCommand::Status { tx })
            .map_err(|_| PeerError::PeerDropped)?;
        rx.await.map_err(|_| PeerError::PeerDropped)
    }

    // Writes the file locally and advertises the new set to the Tracker.
    pub async fn add_file(&self, filename: &str, data: &[u8]) -> Result<()> {
        self.ctx.store.write(filename, data).await?;
        tracing::info!("added {:?} locally ({} bytes)", filename, data.len());
        if let Err(e) = advertise(&self.ctx, REGISTER_ATTEMPTS).await {
            tracing::warn!("could not advertise {:?}: {}", filename, e);
        }
        Ok(())
    }

    // Ok(false) if the file wasn't stored locally.
    pub async fn remove_file(&self, filename: &str) -> Result<bool> {
        let removed = self.ctx.store.remove(filename).await?;
        if removed {
            tracing::info!("removed {:?} locally", filename);
            if let Err(e) = advertise(&self.ctx, REGISTER_ATTEMPTS).await {
                tracing::warn!("could not advertise removal of {:?}: {}", filename, e);
            }
        }
        Ok(removed)
    }

    pub async fn local_files(&self) -> Result<Vec<String>> {
        let mut files: Vec<String> = self.ctx.store.scan().await?.into_iter().collect();
        files.sort();
        Ok(files)
    }

    // Asks the Tracker which peers hold `filename`.
    pub async fn search(&self, filename: &str) -> Result<Vec<PeerId>> {
        search(&self.ctx, filename).await
    }

    // Snapshot of the Tracker's whole index.
    pub async fn network_files(&self) -> Result<HashMap<PeerId, Vec<String>>> {
        network_files(&self.ctx).await
    }

    // Fetches `filename` from the holding peer, stores it locally and
    // advertises the grown set. Returns the downloaded bytes.
    pub async fn download_from(&self, peer: PeerId, filename: &str) -> Result<Vec<u8>> {
        download_from(&self.ctx, peer, filename).await
    }

    // Graceful stop: background workers exit and are awaited.
    pub async fn shutdown(self) {
        self.peer_tx.send(PeerCommand::Shutdown).ok();
        self.handle.await.ok();
    }

    // Hard stop, as if the process died: no directory cleanup, no
    // handover. Survivors find out via their failure detectors.
    pub fn kill(&self) {
        self.handle.abort();
    }
}

fn spawn_advertise(ctx: &Arc<PeerContext>, attempts: u32) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(e) = advertise(&ctx, attempts).await {
            tracing::warn!("re-registration failed: {}", e);
        }
    });
}

// Scans the store and registers the result with the current Tracker.
// An attempt that fails (or hits a demoted Tracker) invalidates the
// locator so the next one re-resolves.
pub(crate) async fn advertise(ctx: &Arc<PeerContext>, attempts: u32) -> Result<()> {

    let mut last_err = PeerError::NoTracker;
    for attempt in 0..attempts {
        if attempt > 0 {
            time::sleep(REGISTER_RETRY_DELAY).await;
        }
        match try_advertise(ctx).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("file registration attempt {} failed: {}", attempt + 1, e);
                ctx.locator.invalidate().await;
                last_err = e;
            },
        }
    }
    Err(last_err)
}

async fn try_advertise(ctx: &Arc<PeerContext>) -> Result<()> {

    let mut files: Vec<String> = ctx.store.scan().await?.into_iter().collect();
    files.sort();

    let (address, _) = ctx.locator.locate().await?.ok_or(PeerError::NoTracker)?;
    let ok = ctx
        .client
        .register_files(address, ctx.peer_id, files, ctx.rpc_timeout)
        .await?;
    if ok {
        tracing::debug!("file set registered with tracker at {}", address);
        Ok(())
    } else {
        // Whoever we called is no longer the Tracker.
        Err(PeerError::NoTracker)
    }
}

pub(crate) async fn search(ctx: &Arc<PeerContext>, filename: &str) -> Result<Vec<PeerId>> {

    let mut refreshed = false;
    loop {
        let (address, _) = ctx.locator.locate().await?.ok_or(PeerError::NoTracker)?;
        let holders = ctx.client.search_file(address, filename, ctx.rpc_timeout).await?;

        // Empty can mean a genuine miss or a demoted Tracker; re-resolve
        // once before trusting it.
        if !holders.is_empty() || refreshed {
            return Ok(holders);
        }
        ctx.locator.invalidate().await;
        refreshed = true;
    }
}

pub(crate) async fn network_files(
    ctx: &Arc<PeerContext>,
) -> Result<HashMap<PeerId, Vec<String>>> {

    let mut refreshed = false;
    loop {
        let (address, _) = ctx.locator.locate().await?.ok_or(PeerError::NoTracker)?;
        let entries = ctx.client.get_file_index(address, ctx.rpc_timeout).await?;

        // A real Tracker always lists at least itself.
        if !entries.is_empty() || refreshed {
            return Ok(entries.into_iter().collect());
        }
        ctx.locator.invalidate().await;
        refreshed = true;
    }
}

pub(crate) async fn download_from(
    ctx: &Arc<PeerContext>,
    peer: PeerId,
    filename: &str,
) -> Result<Vec<u8>> {

    let name = directory::peer_name(peer);
    let address = ctx
        .directory
        .lookup(&name)
        .await?
        .ok_or(PeerError::UnknownPeer(peer))?;

    tracing::info!("downloading {:?} from peer {} at {}", filename, peer, address);
    let data = ctx.client.download_file(address, filename, ctx.rpc_timeout).await?;
    if data.is_empty() {
        return Err(PeerError::EmptyDownload(peer, filename.to_owned()));
    }

    ctx.store.write(filename, &data).await?;
    tracing::info!("downloaded {:?} ({} bytes)", filename, data.len());

    if let Err(e) = advertise(ctx, DOWNLOAD_REGISTER_ATTEMPTS).await {
        tracing::warn!("could not register {:?} with the tracker: {}", filename, e);
    }
    Ok(data)
}
