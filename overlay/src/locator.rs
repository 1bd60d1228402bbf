use std::net::SocketAddr;
use tokio::sync::Mutex;
use crate::{
    directory::{self, DirectoryClient},
    Epoch, TRACKER_PREFIX,
};

// Cached view of who the Tracker is. The list-then-pick-max-epoch walk of
// the directory is the cache-miss path, not the steady state; the cache
// is dropped whenever a heartbeat reveals a higher epoch.
pub(crate) struct TrackerLocator {

    directory: DirectoryClient,

    cached: Mutex<Option<(SocketAddr, Epoch)>>,

}

impl TrackerLocator {

    pub fn new(directory: DirectoryClient) -> Self {
        Self {
            directory,
            cached: Mutex::new(None),
        }
    }

    pub async fn cached(&self) -> Option<(SocketAddr, Epoch)> {
        *self.cached.lock().await
    }

    // Pins the cache, used when this peer itself takes over as Tracker.
    pub async fn set(&self, address: SocketAddr, epoch: Epoch) {
        *self.cached.lock().await = Some((address, epoch));
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    // Cache hit, or a directory walk on miss.
    pub async fn locate(&self) -> directory::Result<Option<(SocketAddr, Epoch)>> {
        if let Some(hit) = self.cached().await {
            return Ok(Some(hit));
        }
        self.refresh().await
    }

    // Lists `Tracker_Epoca_*`, keeps the highest epoch, caches it.
    pub async fn refresh(&self) -> directory::Result<Option<(SocketAddr, Epoch)>> {
        let entries = self.directory.list(TRACKER_PREFIX).await?;
        let best = entries
            .into_iter()
            .filter_map(|(name, address)| {
                directory::parse_tracker_epoch(&name).map(|epoch| (address, epoch))
            })
            .max_by_key(|(_, epoch)| *epoch);

        match best {
            Some((address, epoch)) => {
                tracing::debug!("tracker for epoch {} at {}", epoch, address)
            },
            None => tracing::debug!("no tracker registered"),
        }

        *self.cached.lock().await = best;
        Ok(best)
    }
}
