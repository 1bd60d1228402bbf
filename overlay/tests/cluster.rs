use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};
use anyhow::{ensure, Result};
use tokio::time::{self, Instant};
use overlay::{
    directory::{self, DirectoryClient, DirectoryHandle},
    rpc::RpcClient,
    Epoch, Peer, PeerConfig, PeerHandle, PeerId, RoleKind, TRACKER_PREFIX,
};

const POLL: Duration = Duration::from_millis(50);

fn loopback() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

fn peer_config(id: PeerId, directory: SocketAddr, files_root: &Path) -> PeerConfig {
    let mut config = PeerConfig::new(id);
    config.directory_address = directory;
    config.files_dir = files_root.join(format!("peer_{}", id));
    config.startup_grace = Duration::from_millis(300);
    config
}

struct Cluster {
    dir: DirectoryHandle,
    client: DirectoryClient,
    peers: Vec<PeerHandle>,
}

impl Cluster {
    async fn stop(self) {
        for peer in self.peers {
            peer.shutdown().await;
        }
        self.dir.shutdown();
    }
}

async fn boot_cluster(ids: &[PeerId], stagger: Duration, files_root: &Path) -> Result<Cluster> {
    let dir = directory::server::spawn(loopback()).await?;
    let client = DirectoryClient::new(dir.address);
    let mut peers = Vec::new();
    for (i, &id) in ids.iter().enumerate() {
        if i > 0 {
            time::sleep(stagger).await;
        }
        peers.push(Peer::spawn(peer_config(id, dir.address, files_root)).await?);
    }
    Ok(Cluster { dir, client, peers })
}

async fn registered_trackers(client: &DirectoryClient) -> Result<Vec<(Epoch, SocketAddr)>> {
    let mut entries: Vec<(Epoch, SocketAddr)> = client
        .list(TRACKER_PREFIX)
        .await?
        .into_iter()
        .filter_map(|(name, address)| {
            directory::parse_tracker_epoch(&name).map(|epoch| (epoch, address))
        })
        .collect();
    entries.sort_unstable_by_key(|(epoch, _)| *epoch);
    Ok(entries)
}

// Polls until exactly one tracker name is registered.
async fn wait_for_sole_tracker(
    client: &DirectoryClient,
    deadline: Duration,
) -> Result<(Epoch, SocketAddr)> {
    let give_up = Instant::now() + deadline;
    loop {
        let entries = registered_trackers(client).await?;
        if entries.len() == 1 {
            return Ok(entries[0]);
        }
        ensure!(
            Instant::now() < give_up,
            "no sole tracker within {:?}, registered: {:?}",
            deadline,
            entries,
        );
        time::sleep(POLL).await;
    }
}

// Polls until every peer reports `epoch` with exactly one Tracker role.
async fn wait_for_settled(peers: &[PeerHandle], epoch: Epoch, deadline: Duration) -> Result<()> {
    let give_up = Instant::now() + deadline;
    loop {
        let mut tracker_count = 0;
        let mut settled = true;
        for peer in peers {
            let status = peer.status().await?;
            match status.role {
                RoleKind::Tracker => tracker_count += 1,
                RoleKind::Follower => {},
                RoleKind::Candidate => settled = false,
            }
            if status.current_epoch != epoch {
                settled = false;
            }
        }
        if settled && tracker_count == 1 {
            return Ok(());
        }
        ensure!(
            Instant::now() < give_up,
            "cluster did not settle on epoch {} within {:?}",
            epoch,
            deadline,
        );
        time::sleep(POLL).await;
    }
}

// S1: three peers and an empty directory produce exactly one
// `Tracker_Epoca_1`, with the others following at epoch 1.
#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_elects_single_tracker() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let cluster = boot_cluster(&[1, 2, 3], Duration::from_millis(400), tmp.path()).await?;

    let (epoch, tracker_addr) = wait_for_sole_tracker(&cluster.client, Duration::from_secs(3)).await?;
    assert_eq!(epoch, 1);
    assert!(
        cluster.peers.iter().any(|p| p.endpoint() == tracker_addr),
        "registered tracker endpoint is not one of ours",
    );

    wait_for_settled(&cluster.peers, 1, Duration::from_secs(3)).await?;

    cluster.stop().await;
    Ok(())
}

// S2: killing the Tracker yields a successor at epoch 2 within 5 s and
// removes the epoch-1 name. Epochs never go backwards along the way.
#[tokio::test(flavor = "multi_thread")]
async fn tracker_failover_advances_epoch() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let mut cluster = boot_cluster(&[1, 2, 3], Duration::from_millis(400), tmp.path()).await?;

    let (epoch, tracker_addr) = wait_for_sole_tracker(&cluster.client, Duration::from_secs(5)).await?;
    assert_eq!(epoch, 1);
    wait_for_settled(&cluster.peers, 1, Duration::from_secs(3)).await?;

    let pos = cluster
        .peers
        .iter()
        .position(|p| p.endpoint() == tracker_addr)
        .expect("tracker endpoint not in cluster");
    let dead = cluster.peers.swap_remove(pos);
    dead.kill();

    let give_up = Instant::now() + Duration::from_secs(5);
    let successor = loop {
        let entries = registered_trackers(&cluster.client).await?;
        // The successor purges stale names before registering its own, so
        // at no point is more than one tenure registered.
        assert!(entries.len() <= 1, "multiple tracker names registered: {:?}", entries);
        if entries.len() == 1 && entries[0].0 > 1 {
            break entries[0];
        }
        ensure!(
            Instant::now() < give_up,
            "no successor tracker within 5s, registered: {:?}",
            entries,
        );
        time::sleep(POLL).await;
    };

    // A split first round pushes the winning epoch to 3; anything beyond
    // that means the election is not converging.
    let (epoch, successor_addr) = successor;
    assert!(epoch == 2 || epoch == 3, "unexpected successor epoch {}", epoch);
    assert_ne!(successor_addr, tracker_addr);
    assert!(cluster.peers.iter().any(|p| p.endpoint() == successor_addr));

    // No stale epoch-1 name survives the handover.
    let entries = registered_trackers(&cluster.client).await?;
    assert!(entries.iter().all(|(e, _)| *e != 1), "stale tracker name: {:?}", entries);

    // Survivors converge on the new epoch; none ever reports a lower one.
    wait_for_settled(&cluster.peers, epoch, Duration::from_secs(3)).await?;
    for peer in &cluster.peers {
        assert!(peer.status().await?.current_epoch >= 1);
    }

    cluster.stop().await;
    Ok(())
}

// S3 + property 5: a new file becomes searchable within a heartbeat, a
// download is byte-identical and the downloader shows up as a holder.
#[tokio::test(flavor = "multi_thread")]
async fn advertise_search_and_download() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let cluster = boot_cluster(&[1, 2, 3], Duration::from_millis(400), tmp.path()).await?;
    wait_for_sole_tracker(&cluster.client, Duration::from_secs(5)).await?;
    wait_for_settled(&cluster.peers, 1, Duration::from_secs(3)).await?;

    let p2 = &cluster.peers[1];
    let p3 = &cluster.peers[2];

    p2.add_file("x.bin", b"x-content").await?;

    let give_up = Instant::now() + Duration::from_secs(2);
    loop {
        if p3.search("x.bin").await? == vec![2] {
            break;
        }
        ensure!(Instant::now() < give_up, "x.bin never became searchable");
        time::sleep(POLL).await;
    }

    let data = p3.download_from(2, "x.bin").await?;
    assert_eq!(data, b"x-content");
    let on_disk = std::fs::read(tmp.path().join("peer_3").join("x.bin"))?;
    assert_eq!(on_disk, b"x-content");

    let give_up = Instant::now() + Duration::from_secs(2);
    loop {
        if p2.search("x.bin").await? == vec![2, 3] {
            break;
        }
        ensure!(Instant::now() < give_up, "downloader never advertised x.bin");
        time::sleep(POLL).await;
    }

    cluster.stop().await;
    Ok(())
}

// S4: the same filename held independently by two peers resolves to both
// holders, and each download yields that holder's own bytes.
#[tokio::test(flavor = "multi_thread")]
async fn same_filename_distinct_contents() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    for (id, content) in [(1, "from-one"), (2, "from-two")] {
        let dir = tmp.path().join(format!("peer_{}", id));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("dup.txt"), content)?;
    }

    let cluster = boot_cluster(&[1, 2, 3], Duration::from_millis(400), tmp.path()).await?;
    wait_for_sole_tracker(&cluster.client, Duration::from_secs(5)).await?;
    wait_for_settled(&cluster.peers, 1, Duration::from_secs(3)).await?;

    let p3 = &cluster.peers[2];
    let give_up = Instant::now() + Duration::from_secs(2);
    loop {
        if p3.search("dup.txt").await? == vec![1, 2] {
            break;
        }
        ensure!(Instant::now() < give_up, "dup.txt holders never indexed");
        time::sleep(POLL).await;
    }

    assert_eq!(p3.download_from(1, "dup.txt").await?, b"from-one");
    assert_eq!(p3.download_from(2, "dup.txt").await?, b"from-two");

    cluster.stop().await;
    Ok(())
}

// S5: a heartbeat with a stale epoch is rejected and changes nothing.
// An equal-epoch heartbeat is accepted.
#[tokio::test(flavor = "multi_thread")]
async fn stale_heartbeat_rejected() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let cluster = boot_cluster(&[1, 2], Duration::from_millis(400), tmp.path()).await?;
    let (epoch, tracker_addr) = wait_for_sole_tracker(&cluster.client, Duration::from_secs(5)).await?;
    assert_eq!(epoch, 1);
    wait_for_settled(&cluster.peers, 1, Duration::from_secs(3)).await?;

    let follower = cluster
        .peers
        .iter()
        .find(|p| p.endpoint() != tracker_addr)
        .expect("no follower in cluster");
    let before = follower.status().await?;
    assert_eq!(before.role, RoleKind::Follower);

    let rpc = RpcClient::new();
    let timeout = Duration::from_secs(1);

    let accepted = rpc.heartbeat(follower.endpoint(), 0, timeout).await?;
    assert!(!accepted, "stale heartbeat must be rejected");

    let after = follower.status().await?;
    assert_eq!(after.current_epoch, before.current_epoch);
    assert_eq!(after.role, RoleKind::Follower);

    let accepted = rpc.heartbeat(follower.endpoint(), before.current_epoch, timeout).await?;
    assert!(accepted, "equal-epoch heartbeat must be accepted");

    cluster.stop().await;
    Ok(())
}

// Property 6 + the role-mismatch contract: re-registering an identical
// set leaves the index unchanged, and Tracker-only calls answered by a
// non-Tracker come back empty/false.
#[tokio::test(flavor = "multi_thread")]
async fn reregistration_idempotent_and_role_mismatch() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let cluster = boot_cluster(&[1, 2], Duration::from_millis(400), tmp.path()).await?;
    let (_, tracker_addr) = wait_for_sole_tracker(&cluster.client, Duration::from_secs(5)).await?;
    wait_for_settled(&cluster.peers, 1, Duration::from_secs(3)).await?;

    let rpc = RpcClient::new();
    let timeout = Duration::from_secs(2);
    let files = vec!["a.bin".to_owned(), "b.bin".to_owned()];

    assert!(rpc.register_files(tracker_addr, 42, files.clone(), timeout).await?);
    let first = rpc.get_file_index(tracker_addr, timeout).await?;
    assert!(rpc.register_files(tracker_addr, 42, files.clone(), timeout).await?);
    let second = rpc.get_file_index(tracker_addr, timeout).await?;

    assert_eq!(first, second);
    assert!(second.contains(&(42, files)));

    let follower_addr = cluster
        .peers
        .iter()
        .map(|p| p.endpoint())
        .find(|addr| *addr != tracker_addr)
        .expect("no follower in cluster");

    assert!(!rpc.register_files(follower_addr, 42, vec![], timeout).await?);
    assert!(rpc.search_file(follower_addr, "a.bin", timeout).await?.is_empty());
    assert!(rpc.get_file_index(follower_addr, timeout).await?.is_empty());

    cluster.stop().await;
    Ok(())
}

// S6: two peers whose detectors fire together still produce at most one
// winner per epoch; a split round is retried and converges quickly.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_candidates_converge() -> Result<()> {
    let tmp = tempfile::TempDir::new()?;
    // No stagger: both peers look for a tracker at the same instant.
    let cluster = boot_cluster(&[1, 2], Duration::ZERO, tmp.path()).await?;

    let give_up = Instant::now() + Duration::from_secs(5);
    let winning_epoch = loop {
        // Never two Trackers claiming the same epoch.
        let mut tracker_epochs = Vec::new();
        for peer in &cluster.peers {
            let status = peer.status().await?;
            if status.role == RoleKind::Tracker {
                tracker_epochs.push(status.current_epoch);
            }
        }
        tracker_epochs.sort_unstable();
        for pair in tracker_epochs.windows(2) {
            assert_ne!(pair[0], pair[1], "two trackers elected for the same epoch");
        }

        let entries = registered_trackers(&cluster.client).await?;
        if entries.len() == 1 && tracker_epochs.len() == 1 {
            break entries[0].0;
        }
        ensure!(Instant::now() < give_up, "no winner within 5s: {:?}", entries);
        time::sleep(Duration::from_millis(25)).await;
    };

    // One split round at most is expected before convergence.
    assert!(
        (1..=4).contains(&winning_epoch),
        "took too many rounds, winning epoch {}",
        winning_epoch,
    );
    wait_for_settled(&cluster.peers, winning_epoch, Duration::from_secs(3)).await?;

    cluster.stop().await;
    Ok(())
}
