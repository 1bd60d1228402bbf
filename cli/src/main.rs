use std::{net::SocketAddr, path::PathBuf, time::Duration};
use anyhow::Result;
use clap::{Parser, Subcommand};
use overlay::{directory, Peer, PeerConfig, PeerId};

#[derive(Parser)]
#[command(about = "Peer-to-peer file sharing with an elected tracker")]
struct Args {

    #[command(subcommand)]
    mode: Mode,

}

#[derive(Subcommand)]
enum Mode {

    // Standalone bootstrap name directory.
    Directory {
        #[arg(long, default_value = "127.0.0.1:9090", help = "Address to listen on")]
        bind: SocketAddr,
    },

    // A single peer.
    Peer {
        #[arg(long, help = "Unique positive peer id")]
        peer: PeerId,

        #[arg(long, help = "Directory holding this peer's files")]
        files_dir: Option<PathBuf>,

        #[arg(long, default_value = "127.0.0.1:9090", help = "Name directory endpoint")]
        directory: SocketAddr,

        #[arg(long, default_value = "127.0.0.1:0", help = "Address to serve RPCs on")]
        bind: SocketAddr,
    },

    // A name directory plus a local cluster of peers.
    Cluster {
        #[arg(long, default_value_t = 5, help = "Number of peers to start")]
        peers: PeerId,

        #[arg(long, default_value = "127.0.0.1:9090", help = "Address for the name directory")]
        bind: SocketAddr,
    },

}

#[tokio::main]
async fn main() -> Result<()> {

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let args = Args::parse();
    match args.mode {

        Mode::Directory { bind } => {
            let dir = directory::server::spawn(bind).await?;
            println!("name directory running on {}", dir.address);
            tokio::signal::ctrl_c().await?;
            dir.shutdown();
        },

        Mode::Peer { peer, files_dir, directory, bind } => {
            let mut config = PeerConfig::new(peer);
            config.directory_address = directory;
            config.listen_address = bind;
            if let Some(dir) = files_dir {
                config.files_dir = dir;
            }
            let handle = Peer::spawn(config).await?;
            println!("peer {} serving on {}", handle.peer_id(), handle.endpoint());
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        },

        Mode::Cluster { peers, bind } => {
            let dir = directory::server::spawn(bind).await?;
            println!("name directory running on {}", dir.address);

            let mut handles = Vec::new();
            for id in 1..=peers {
                let mut config = PeerConfig::new(id);
                config.directory_address = dir.address;
                let handle = Peer::spawn(config).await?;
                println!("peer {} serving on {}", id, handle.endpoint());
                handles.push(handle);
                // Staggered start keeps the first election quiet.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            println!("cluster up, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            for handle in handles {
                handle.shutdown().await;
            }
            dir.shutdown();
        },

    }

    Ok(())
}
