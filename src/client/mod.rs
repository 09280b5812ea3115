mod config;
mod session;

pub use config::ClientConfig;
pub use session::{Session, TransferStats};

use crate::error::{BittorrentError, Result};
use crate::peer::PeerId;
use crate::storage::PieceStore;
use crate::torrent::TorrentDescriptor;
use crate::tracker::{
    generate_peer_id, TrackerClient, TrackerEvent, TrackerRequest, TrackerResponse,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Ports tried after `listen_port` when it is taken
const PORT_SCAN: u16 = 8;

const MIN_ANNOUNCE_INTERVAL: u64 = 30;
const MAX_ANNOUNCE_INTERVAL: u64 = 3600;
const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Per-download switches from the command line.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Addresses to try in addition to what trackers return
    pub extra_peers: Vec<SocketAddr>,
    /// Re-hash existing data before downloading
    pub recheck: bool,
}

/// Main BitTorrent client
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: PeerId,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = generate_peer_id();
        info!("Client initialized with peer_id: {}", hex::encode(peer_id));

        Self { config, peer_id }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Download a torrent
    pub async fn download(&self, torrent_path: &Path, options: DownloadOptions) -> Result<()> {
        self.config.validate()?;
        info!("Starting download for: {}", torrent_path.display());

        let descriptor = Arc::new(crate::torrent::load_torrent_file(torrent_path).await?);

        info!("Torrent: {}", descriptor.name);
        info!("Total size: {} bytes", descriptor.total_length);
        info!("Pieces: {}", descriptor.piece_count());
        info!("Info hash: {}", descriptor.info_hash_hex());

        let store = PieceStore::open(descriptor.clone(), &self.config.download_dir)
            .await?
            .with_disk_timeout(self.config.disk_timeout());
        let store = Arc::new(store);

        if options.recheck {
            store.recheck().await?;
        }
        if store.is_complete().await {
            info!("{} is already complete", descriptor.name);
            return Ok(());
        }

        let (listener, port) = bind_listener(self.config.listen_port).await?;
        info!("Listening for peers on port {}", port);

        let session = Session::new(
            store.clone(),
            self.peer_id,
            self.config.peer_config(),
            self.config.max_peers,
            store.bytes_remaining().await,
        );
        let stats = session.stats();
        let stats_rx = stats.clone();

        let (discovered_tx, discovered_rx) = mpsc::channel(16);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);

        if !options.extra_peers.is_empty() {
            let _ = discovered_tx.send(options.extra_peers.clone()).await;
        }

        let tracker = TrackerClient::new(self.config.tracker_timeout())?;
        let mut request = TrackerRequest::new(descriptor.info_hash, self.peer_id, port, 0);
        request.numwant = Some(self.config.numwant);

        let accept_task = tokio::spawn(accept_loop(listener, incoming_tx));
        let announce_task = tokio::spawn(announce_loop(
            tracker,
            descriptor.clone(),
            request.clone(),
            stats,
            discovered_tx,
            self.config.tracker_failure_budget,
        ));

        let result = session.run(discovered_rx, incoming_rx).await;
        accept_task.abort();
        announce_task.abort();

        let tracker = TrackerClient::new(self.config.tracker_timeout())?;
        let last = *stats_rx.borrow();
        request.uploaded = last.uploaded;
        request.downloaded = last.downloaded;
        request.left = last.left;

        match result {
            Ok(totals) => {
                info!(
                    "Download complete: {} bytes downloaded, {} bytes uploaded",
                    totals.downloaded, totals.uploaded
                );
                request.event = Some(TrackerEvent::Completed);
                request.left = 0;
                if let Err(e) = tracker.announce_any(&descriptor.tracker_urls(), &request).await {
                    warn!("Could not report completion to tracker: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                request.event = Some(TrackerEvent::Stopped);
                if let Err(e) = tracker.announce_any(&descriptor.tracker_urls(), &request).await {
                    debug!("Could not report stop to tracker: {}", e);
                }
                Err(e)
            }
        }
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

/// Bind the first free port in `[port, port + PORT_SCAN]`.
async fn bind_listener(port: u16) -> Result<(TcpListener, u16)> {
    let last = port.saturating_add(PORT_SCAN);
    for candidate in port..=last {
        match TcpListener::bind(("0.0.0.0", candidate)).await {
            Ok(listener) => return Ok((listener, candidate)),
            Err(e) => warn!("Port {} unavailable: {}", candidate, e),
        }
    }
    Err(BittorrentError::ConfigError(format!(
        "no free port in {}..={}",
        port, last
    )))
}

async fn accept_loop(listener: TcpListener, incoming: mpsc::Sender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok(accepted) => {
                if incoming.send(accepted).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Announce periodically and feed returned addresses to the session.
/// Dropping `discovered` (after too many failed rounds) tells the session
/// no more peers are coming.
async fn announce_loop(
    tracker: TrackerClient,
    descriptor: Arc<TorrentDescriptor>,
    mut request: TrackerRequest,
    stats: watch::Receiver<TransferStats>,
    discovered: mpsc::Sender<Vec<SocketAddr>>,
    failure_budget: u32,
) {
    let urls = descriptor.tracker_urls();
    let mut failures = 0u32;

    loop {
        {
            let current = stats.borrow();
            request.uploaded = current.uploaded;
            request.downloaded = current.downloaded;
            request.left = current.left;
        }

        let wait = match tracker.announce_any(&urls, &request).await {
            Ok(response) => {
                failures = 0;
                request.event = None;
                if response.tracker_id.is_some() {
                    request.tracker_id = response.tracker_id.clone();
                }
                if let (Some(seeders), Some(leechers)) = (response.complete, response.incomplete) {
                    debug!("Swarm has {} seeders and {} leechers", seeders, leechers);
                }

                let wait = announce_delay(&response);
                let addrs = response.peers.into_iter().map(|peer| peer.addr).collect();
                if discovered.send(addrs).await.is_err() {
                    return;
                }
                wait
            }
            Err(e) => {
                failures += 1;
                warn!("Announce failed ({}/{}): {}", failures, failure_budget, e);
                if failures >= failure_budget {
                    error!("Giving up on trackers after {} failed rounds", failures);
                    return;
                }
                RETRY_DELAY * failures
            }
        };

        tokio::time::sleep(wait).await;
    }
}

/// Time until the next regular announce: the tracker's interval kept within
/// sane bounds, but never below its `min interval`.
fn announce_delay(response: &TrackerResponse) -> Duration {
    let interval = response
        .interval
        .clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL)
        .max(response.min_interval.unwrap_or(0));
    Duration::from_secs(interval)
}
