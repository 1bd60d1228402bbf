use std::{sync::Arc, time::Duration};
use rand::Rng;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::Instrument;
use crate::peer::{PeerCommand, PeerContext};

// Bounds for hearing from the Tracker. Drawn fresh on every reset so two
// peers don't keep timing out in lockstep.
const TIMEOUT_MIN_MS: u64 = 150;
const TIMEOUT_MAX_MS: u64 = 300;

// Cap on the confirmation ping before escalating.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) enum WatchdogCmd {

    // A heartbeat was accepted; re-arm the timer.
    Reset,

    // Stop watching: the peer is Tracker or mid-election.
    Suspend,

}

pub(crate) type WatchdogTx = mpsc::UnboundedSender<WatchdogCmd>;
type WatchdogRx = mpsc::UnboundedReceiver<WatchdogCmd>;

pub(crate) fn spawn(ctx: Arc<PeerContext>) -> (JoinHandle<()>, WatchdogTx) {
    let (watchdog_tx, watchdog_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(ctx, watchdog_rx).instrument(tracing::info_span!("watchdog")));
    (handle, watchdog_tx)
}

fn draw_deadline() -> Instant {
    let timeout = rand::thread_rng().gen_range(TIMEOUT_MIN_MS..=TIMEOUT_MAX_MS);
    Instant::now() + Duration::from_millis(timeout)
}

async fn run(ctx: Arc<PeerContext>, mut watchdog_rx: WatchdogRx) {

    // Parked until the first reset.
    let mut deadline: Option<Instant> = None;

    loop { tokio::select! {

        cmd = watchdog_rx.recv() => match cmd {
            Some(WatchdogCmd::Reset) => deadline = Some(draw_deadline()),
            Some(WatchdogCmd::Suspend) => deadline = None,
            None => break,
        },

        _ = expiry(deadline) => {
            // Give the Tracker one direct chance before escalating.
            if let Some((address, epoch)) = ctx.locator.cached().await {
                if ctx.client.ping(address, PING_TIMEOUT).await {
                    tracing::debug!("missed heartbeats but tracker for epoch {} answered ping", epoch);
                    deadline = Some(draw_deadline());
                    continue;
                }
            }
            tracing::info!("tracker timed out, escalating to election");
            ctx.peer_tx.send(PeerCommand::TrackerTimeout).ok();
            // Parked until the election flow resets us.
            deadline = None;
        },

    }}
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
