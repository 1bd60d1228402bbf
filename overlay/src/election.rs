use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use rand::Rng;
use tokio::{sync::oneshot, time};
use tracing::Instrument;
use wire::Epoch;
use crate::{
    directory,
    peer::{PeerCommand, PeerContext},
    PEER_PREFIX,
};

// Per-peer cap when soliciting votes.
const VOTE_TIMEOUT: Duration = Duration::from_secs(5);

// De-synchronises candidates whose detectors fired together.
const CANDIDACY_BACKOFF_MS: RangeInclusive<u64> = 250..=1000;

// Cool-off after a lost round, before the watchdog is re-armed.
const RETRY_BACKOFF_MS: RangeInclusive<u64> = 500..=2000;

// One single-pass majority vote for `epoch`. Reports the outcome back to
// the peer task; there is no retry loop here, the next watchdog timeout
// triggers the next round.
pub(crate) fn spawn(ctx: Arc<PeerContext>, epoch: Epoch) {
    tokio::spawn(run(ctx, epoch).instrument(tracing::info_span!("election", epoch)));
}

async fn run(ctx: Arc<PeerContext>, epoch: Epoch) {

    let backoff = rand::thread_rng().gen_range(CANDIDACY_BACKOFF_MS);
    time::sleep(Duration::from_millis(backoff)).await;

    // Cast our own ballot through the same single-vote-per-epoch gate as
    // everyone else's. Losing it means another candidate got there first.
    if !claim_own_vote(&ctx, epoch).await {
        tracing::info!("own vote for epoch {} already spent, standing down", epoch);
        ctx.peer_tx.send(PeerCommand::ElectionLost { epoch }).ok();
        return;
    }

    match solicit(&ctx, epoch).await {
        Ok(true) => {
            ctx.peer_tx.send(PeerCommand::ElectionWon { epoch }).ok();
        },
        Ok(false) => {
            let backoff = rand::thread_rng().gen_range(RETRY_BACKOFF_MS);
            tracing::info!("election for epoch {} lost, backing off {}ms", epoch, backoff);
            time::sleep(Duration::from_millis(backoff)).await;
            ctx.peer_tx.send(PeerCommand::ElectionLost { epoch }).ok();
        },
        Err(e) => {
            tracing::error!("election for epoch {} failed: {}", epoch, e);
            ctx.peer_tx.send(PeerCommand::ElectionLost { epoch }).ok();
        },
    }
}

async fn claim_own_vote(ctx: &Arc<PeerContext>, epoch: Epoch) -> bool {
    let (tx, rx) = oneshot::channel();
    if ctx.peer_tx.send(PeerCommand::ClaimVote { epoch, tx }).is_err() {
        return false;
    }
    rx.await.unwrap_or(false)
}

async fn solicit(ctx: &Arc<PeerContext>, epoch: Epoch) -> directory::Result<bool> {

    let peers = ctx.directory.list(PEER_PREFIX).await?;
    tracing::info!("soliciting votes from {} registered peers", peers.len());

    // Quorum is counted over the peers actually contacted: enumerated,
    // minus those that errored out. We count ourselves.
    let mut contacted = peers.len();
    let mut votes: usize = 1;

    for (name, address) in peers {
        let peer_id = match directory::parse_peer_id(&name) {
            Some(peer_id) => peer_id,
            None => {
                tracing::warn!("unparseable peer name in directory: {:?}", name);
                contacted -= 1;
                continue;
            },
        };
        if peer_id == ctx.peer_id {
            continue;
        }

        match ctx.client.request_vote(address, ctx.peer_id, epoch, VOTE_TIMEOUT).await {
            Ok(true) => {
                tracing::info!("peer {} granted vote", peer_id);
                votes += 1;
            },
            Ok(false) => tracing::info!("peer {} denied vote", peer_id),
            Err(e) => {
                tracing::warn!("vote request to peer {} failed: {}", peer_id, e);
                contacted -= 1;
            },
        }
    }

    let needed = contacted / 2 + 1;
    tracing::info!(
        "{} of {} contacted peers voted for epoch {} (need {})",
        votes, contacted, epoch, needed,
    );
    Ok(votes >= needed)
}
