use crate::error::{BittorrentError, Result};
use crate::peer::{PeerCommand, PeerConfig, PeerConnection, PeerContext, PeerEvent, PeerId};
use crate::storage::PieceStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// How long engines get to wind down once the session ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Transfer totals reported to the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub peers: usize,
}

type PeerOutcome = (SocketAddr, Result<()>);

/// Owns the piece store and the set of running peer engines.
///
/// Engines report through one event channel; the session answers with
/// per-connection commands. Addresses are deduplicated against both running
/// and queued connections.
pub struct Session {
    store: Arc<PieceStore>,
    peer_id: PeerId,
    peer_config: PeerConfig,
    max_peers: usize,
    active: HashMap<SocketAddr, mpsc::UnboundedSender<PeerCommand>>,
    pending: VecDeque<SocketAddr>,
    known: HashSet<SocketAddr>,
    /// Pieces already broadcast as `Have`
    announced: HashSet<u32>,
    tasks: JoinSet<PeerOutcome>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    stats: TransferStats,
    stats_tx: watch::Sender<TransferStats>,
}

impl Session {
    pub fn new(
        store: Arc<PieceStore>,
        peer_id: PeerId,
        peer_config: PeerConfig,
        max_peers: usize,
        left: u64,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stats = TransferStats {
            left,
            ..TransferStats::default()
        };
        let (stats_tx, _) = watch::channel(stats);

        Self {
            store,
            peer_id,
            peer_config,
            max_peers,
            active: HashMap::new(),
            pending: VecDeque::new(),
            known: HashSet::new(),
            announced: HashSet::new(),
            tasks: JoinSet::new(),
            events_tx,
            events_rx,
            stats,
            stats_tx,
        }
    }

    /// Live transfer totals.
    pub fn stats(&self) -> watch::Receiver<TransferStats> {
        self.stats_tx.subscribe()
    }

    /// Queue `addr` unless it is already running or queued.
    fn add_peer(&mut self, addr: SocketAddr) -> bool {
        if !self.known.insert(addr) {
            return false;
        }
        self.pending.push_back(addr);
        true
    }

    fn context(&self) -> Arc<PeerContext> {
        Arc::new(PeerContext {
            store: self.store.clone(),
            peer_id: self.peer_id,
            config: self.peer_config.clone(),
            events: self.events_tx.clone(),
        })
    }

    fn spawn_engine(&mut self, addr: SocketAddr, stream: Option<TcpStream>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let ctx = self.context();

        self.tasks.spawn(async move {
            let result: Result<()> = async {
                let connection = match stream {
                    Some(stream) => PeerConnection::accept(stream, addr, ctx).await?,
                    None => PeerConnection::connect(addr, ctx).await?,
                };
                connection.run(commands_rx).await
            }
            .await;
            (addr, result)
        });

        self.active.insert(addr, commands_tx);
    }

    /// Start queued connections up to the peer limit.
    fn dial_pending(&mut self) {
        while self.active.len() < self.max_peers {
            let Some(addr) = self.pending.pop_front() else {
                break;
            };
            self.spawn_engine(addr, None);
        }
    }

    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.active.len() >= self.max_peers || !self.known.insert(addr) {
            debug!("Refusing incoming connection from {}", addr);
            return;
        }
        self.spawn_engine(addr, Some(stream));
    }

    fn broadcast(&self, command: PeerCommand) {
        for commands in self.active.values() {
            let _ = commands.send(command);
        }
    }

    async fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::PieceVerified(index) => {
                // Two connections can finish the same piece at once
                if !self.announced.insert(index) {
                    debug!("Piece {} already announced", index);
                    return;
                }
                self.broadcast(PeerCommand::Have(index));
                self.stats.left = self.store.bytes_remaining().await;
                info!(
                    "Progress: {}/{} pieces, {} bytes left",
                    self.store.completed_count().await,
                    self.store.piece_count(),
                    self.stats.left
                );
            }
            PeerEvent::Downloaded(bytes) => self.stats.downloaded += bytes,
            PeerEvent::Uploaded(bytes) => self.stats.uploaded += bytes,
        }
    }

    /// Forget a finished engine; disk failures end the whole session.
    fn on_engine_exit(&mut self, joined: std::result::Result<PeerOutcome, JoinError>) -> Result<()> {
        match joined {
            Ok((addr, result)) => {
                self.active.remove(&addr);
                self.known.remove(&addr);
                match result {
                    Ok(()) => debug!("Peer {} finished", addr),
                    Err(e) if e.is_storage_failure() => {
                        error!("Disk failure on connection to {}: {}", addr, e);
                        return Err(e);
                    }
                    Err(e) => debug!("Peer {} dropped: {}", addr, e),
                }
            }
            Err(e) => {
                warn!("Peer task failed: {}", e);
                let closed: Vec<SocketAddr> = self
                    .active
                    .iter()
                    .filter(|(_, commands)| commands.is_closed())
                    .map(|(addr, _)| *addr)
                    .collect();
                for addr in closed {
                    self.active.remove(&addr);
                    self.known.remove(&addr);
                }
            }
        }
        Ok(())
    }

    fn publish_stats(&mut self) {
        self.stats.peers = self.active.len();
        self.stats_tx.send_replace(self.stats);
    }

    /// Drive the download until every piece is verified.
    ///
    /// `discovered` delivers batches of candidate addresses; when it closes
    /// and no connection is left, the session fails instead of waiting.
    /// `incoming` delivers sockets accepted by the listener.
    pub async fn run(
        mut self,
        mut discovered: mpsc::Receiver<Vec<SocketAddr>>,
        mut incoming: mpsc::Receiver<(TcpStream, SocketAddr)>,
    ) -> Result<TransferStats> {
        let mut discovery_open = true;
        let mut incoming_open = true;

        let outcome = loop {
            if self.store.is_complete().await {
                info!("All {} pieces verified", self.store.piece_count());
                break Ok(());
            }
            if !discovery_open && self.tasks.is_empty() && self.pending.is_empty() {
                break Err(BittorrentError::SessionError(
                    "no reachable peers and peer discovery has ended".to_string(),
                ));
            }
            self.publish_stats();

            tokio::select! {
                batch = discovered.recv(), if discovery_open => match batch {
                    Some(addrs) => {
                        let added = addrs.into_iter().filter(|addr| self.add_peer(*addr)).count();
                        debug!("{} new peer addresses", added);
                        self.dial_pending();
                    }
                    None => {
                        debug!("Peer discovery ended");
                        discovery_open = false;
                    }
                },
                accepted = incoming.recv(), if incoming_open => match accepted {
                    Some((stream, addr)) => self.accept_peer(stream, addr),
                    None => incoming_open = false,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = self.on_engine_exit(joined) {
                        break Err(e);
                    }
                    self.dial_pending();
                }
            }
        };

        self.shutdown().await;
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_event(event).await;
        }
        self.stats.left = self.store.bytes_remaining().await;
        self.publish_stats();
        outcome.map(|()| self.stats)
    }

    async fn shutdown(&mut self) {
        self.broadcast(PeerCommand::Shutdown);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            self.tasks.shutdown().await;
        }
        self.active.clear();
    }
}
