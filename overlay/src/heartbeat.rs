use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::Instrument;
use wire::Epoch;
use crate::{directory, peer::PeerContext, PEER_PREFIX};

// Broadcast period while Tracker; per-peer sends are capped to it.
pub(crate) const INTERVAL: Duration = Duration::from_millis(100);

// Runs for exactly one Tracker tenure. Dropping the returned sender stops
// the emitter within one period.
pub(crate) fn spawn(ctx: Arc<PeerContext>, epoch: Epoch) -> (watch::Sender<()>, JoinHandle<()>) {
    let (tenure_tx, tenure_rx) = watch::channel(());
    let handle = tokio::spawn(
        run(ctx, epoch, tenure_rx).instrument(tracing::info_span!("heartbeat", epoch)),
    );
    (tenure_tx, handle)
}

async fn run(ctx: Arc<PeerContext>, epoch: Epoch, mut tenure: watch::Receiver<()>) {

    let mut ticker = time::interval(INTERVAL);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop { tokio::select! {

        // Sender dropped: the role left Tracker.
        _ = tenure.changed() => {
            tracing::info!("tenure over, heartbeat emitter stopping");
            break;
        },

        _ = ticker.tick() => broadcast(&ctx, epoch).await,

    }}
}

async fn broadcast(ctx: &Arc<PeerContext>, epoch: Epoch) {

    let peers = match ctx.directory.list(PEER_PREFIX).await {
        Ok(peers) => peers,
        Err(e) => {
            tracing::warn!("peer enumeration failed: {}", e);
            return;
        },
    };

    // A missing peer is not the Tracker's problem; individual send
    // errors are dropped.
    let sends = peers.into_iter().filter_map(|(name, address)| {
        match directory::parse_peer_id(&name) {
            Some(peer_id) if peer_id != ctx.peer_id => Some(async move {
                ctx.client.heartbeat(address, epoch, INTERVAL).await.ok();
            }),
            _ => None,
        }
    });
    futures::future::join_all(sends).await;
}
