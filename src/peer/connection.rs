use super::message::{read_message, write_message};
use super::protocol::{self, Handshake};
use super::queue::SendQueue;
use super::{PeerConfig, PeerId, PeerState, WireMessage};
use crate::error::{PeerError, Result};
use crate::piece::{
    Bitfield, BlockOutcome, BlockRequest, PieceAssembly, PiecePicker, RandomPicker,
    SequentialPicker,
};
use crate::storage::PieceStore;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Largest block a remote may request from us
const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Decoded frames buffered between the reader task and the message loop
const FRAME_BUFFER: usize = 32;

/// Everything an engine shares with the session.
pub struct PeerContext {
    pub store: Arc<PieceStore>,
    pub peer_id: PeerId,
    pub config: PeerConfig,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

/// Reported by an engine to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A piece passed verification and was committed
    PieceVerified(u32),
    /// Payload bytes received
    Downloaded(u64),
    /// Payload bytes sent
    Uploaded(u64),
}

/// Sent by the session to a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// Some connection completed this piece
    Have(u32),
    Shutdown,
}

/// Which side opened the connection, and so speaks first in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A peer connection that has completed its handshake.
pub struct PeerConnection<S> {
    addr: SocketAddr,
    stream: S,
    remote_id: PeerId,
    ctx: Arc<PeerContext>,
}

impl PeerConnection<TcpStream> {
    /// Dial a peer and perform the handshake
    pub async fn connect(addr: SocketAddr, ctx: Arc<PeerContext>) -> Result<Self> {
        debug!("Connecting to peer: {}", addr);

        let stream = time::timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout("connect"))?
            .map_err(PeerError::from)?;

        Self::establish(stream, addr, ctx, Direction::Outbound).await
    }

    /// Answer the handshake on a socket accepted by our listener
    pub async fn accept(stream: TcpStream, addr: SocketAddr, ctx: Arc<PeerContext>) -> Result<Self> {
        debug!("Incoming connection from {}", addr);
        Self::establish(stream, addr, ctx, Direction::Inbound).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the handshake over an already-open stream.
    pub async fn establish(
        mut stream: S,
        addr: SocketAddr,
        ctx: Arc<PeerContext>,
        direction: Direction,
    ) -> Result<Self> {
        let ours = Handshake::new(ctx.store.descriptor().info_hash, ctx.peer_id);
        let exchange = async {
            match direction {
                Direction::Outbound => protocol::initiate(&mut stream, &ours).await,
                Direction::Inbound => protocol::respond(&mut stream, &ours).await,
            }
        };
        let theirs = time::timeout(ctx.config.handshake_timeout, exchange)
            .await
            .map_err(|_| PeerError::Timeout("handshake"))??;

        info!(
            "Handshake complete with {} ({})",
            addr,
            String::from_utf8_lossy(&theirs.peer_id[..8])
        );

        Ok(Self {
            addr,
            stream,
            remote_id: theirs.peer_id,
            ctx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    /// Exchange messages until the remote disconnects, a protocol or disk
    /// error occurs, or the session sends `Shutdown`.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<PeerCommand>) -> Result<()> {
        let Self {
            addr, stream, ctx, ..
        } = self;
        let config = ctx.config.clone();
        let (reader, writer) = tokio::io::split(stream);
        let queue = Arc::new(SendQueue::new());

        let (frame_tx, mut frames) = mpsc::channel(FRAME_BUFFER);
        let _reader = AbortOnDrop(tokio::spawn(read_loop(reader, frame_tx, config.read_timeout)));
        let mut writer = AbortOnDrop(tokio::spawn(write_loop(
            writer,
            queue.clone(),
            config.keepalive_interval,
            config.write_timeout,
            ctx.events.clone(),
        )));

        let mut peer = ActivePeer::new(addr, ctx, queue.clone());
        peer.start().await;

        let result = loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(message)) => {
                        if let Err(e) = peer.handle_message(message).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(PeerError::ConnectionClosed.into()),
                },
                command = commands.recv() => match command {
                    Some(PeerCommand::Have(index)) => peer.piece_completed(index).await,
                    Some(PeerCommand::Shutdown) | None => break Ok(()),
                },
                written = &mut writer.0 => {
                    break match written {
                        Ok(Err(e)) => Err(e.into()),
                        _ => Err(PeerError::ConnectionClosed.into()),
                    };
                }
            }
        };

        queue.close().await;
        match &result {
            Ok(()) => info!("Disconnected from {}", addr),
            Err(e) => info!("Connection to {} closed: {}", addr, e),
        }
        result
    }
}

/// Aborts the task when the connection is torn down.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    frames: mpsc::Sender<std::result::Result<WireMessage, PeerError>>,
    read_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let result = match time::timeout(read_timeout, read_message(&mut reader)).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Timeout("read")),
        };
        let failed = result.is_err();
        if frames.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    queue: Arc<SendQueue>,
    keepalive_interval: Duration,
    write_timeout: Duration,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> std::result::Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = match time::timeout(keepalive_interval, queue.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(_) => WireMessage::KeepAlive,
        };

        time::timeout(write_timeout, write_message(&mut writer, &message))
            .await
            .map_err(|_| PeerError::Timeout("write"))??;

        if let WireMessage::Piece { data, .. } = &message {
            let _ = events.send(PeerEvent::Uploaded(data.len() as u64));
        }
    }
}

/// Protocol state of an established connection.
struct ActivePeer {
    addr: SocketAddr,
    ctx: Arc<PeerContext>,
    queue: Arc<SendQueue>,
    state: PeerState,
    /// Pieces the remote has advertised
    remote: Bitfield,
    /// Pieces being downloaded over this connection
    assemblies: HashMap<u32, PieceAssembly>,
    picker: Box<dyn PiecePicker>,
}

impl ActivePeer {
    fn new(addr: SocketAddr, ctx: Arc<PeerContext>, queue: Arc<SendQueue>) -> Self {
        let picker: Box<dyn PiecePicker> = if ctx.config.sequential {
            Box::new(SequentialPicker)
        } else {
            Box::new(RandomPicker)
        };
        let remote = Bitfield::new(ctx.store.piece_count());

        Self {
            addr,
            ctx,
            queue,
            state: PeerState::default(),
            remote,
            assemblies: HashMap::new(),
            picker,
        }
    }

    fn piece_count(&self) -> usize {
        self.ctx.store.piece_count()
    }

    async fn send(&mut self, message: WireMessage) {
        match message {
            WireMessage::Choke => self.state.am_choking = true,
            WireMessage::Unchoke => self.state.am_choking = false,
            WireMessage::Interested => self.state.am_interested = true,
            WireMessage::NotInterested => self.state.am_interested = false,
            _ => {}
        }
        self.queue.push(message).await;
    }

    /// Advertise what we hold and open the upload side.
    async fn start(&mut self) {
        let local = self.ctx.store.bitfield().await;
        if !local.is_empty() {
            self.send(WireMessage::Bitfield {
                bitfield: local.as_bytes().to_vec(),
            })
            .await;
        }
        self.send(WireMessage::Unchoke).await;
    }

    async fn handle_message(&mut self, message: WireMessage) -> Result<()> {
        debug!("Received {} from {}", message.name(), self.addr);

        match message {
            WireMessage::KeepAlive => {}
            WireMessage::Choke => {
                self.state.peer_choking = true;
                self.forget_requests().await;
            }
            WireMessage::Unchoke => {
                self.state.peer_choking = false;
                self.fill_requests().await;
            }
            WireMessage::Interested => self.state.peer_interested = true,
            WireMessage::NotInterested => self.state.peer_interested = false,
            WireMessage::Have { index } => {
                if !self.remote.set(index as usize) {
                    return Err(PeerError::IndexOutOfRange {
                        index,
                        piece_count: self.piece_count(),
                    }
                    .into());
                }
                self.refresh_interest().await;
                self.fill_requests().await;
            }
            WireMessage::Bitfield { bitfield } => {
                let piece_count = self.piece_count();
                self.remote = Bitfield::from_bytes(&bitfield, piece_count).ok_or(
                    PeerError::LengthMismatch {
                        expected: Bitfield::byte_len(piece_count),
                        actual: bitfield.len(),
                    },
                )?;
                self.refresh_interest().await;
                self.fill_requests().await;
            }
            WireMessage::Request { block } => self.serve_request(block).await?,
            WireMessage::Cancel { block } => {
                if self.queue.remove_piece(&block).await {
                    debug!(
                        "Cancelled queued block {}+{} for {}",
                        block.index, block.begin, self.addr
                    );
                }
            }
            WireMessage::Piece { index, begin, data } => {
                self.receive_block(index, begin, data).await?;
                self.refresh_interest().await;
                self.fill_requests().await;
            }
        }

        Ok(())
    }

    /// Queue a `Piece` response for a block of a piece we hold. Requests
    /// that overlap a pending one, or exceed the upload limit, are dropped.
    async fn serve_request(&mut self, block: BlockRequest) -> Result<()> {
        let index = block.index as usize;
        let store = self.ctx.store.clone();

        if !store.has_piece(index).await {
            debug!(
                "Ignoring request from {} for piece {} we do not have",
                self.addr, index
            );
            return Ok(());
        }
        let Some(piece_len) = store.descriptor().piece_len(index) else {
            return Ok(());
        };

        let end = block.begin as u64 + block.length as u64;
        if block.length == 0 || block.length > MAX_REQUEST_LEN || end > piece_len {
            return Err(PeerError::InvalidBlock {
                index: block.index,
                begin: block.begin,
                length: block.length,
            }
            .into());
        }
        let limit = self.ctx.config.max_queued_uploads;
        if let Err(e) = self.queue.reserve_upload(block, limit).await {
            debug!("Rejected request from {}: {}", self.addr, e);
            return Ok(());
        }

        let offset = store.descriptor().piece_offset(index) + block.begin as u64;
        let data = match store.read_range(offset, block.length as usize).await {
            Ok(data) => data,
            Err(e) => {
                self.queue.release_upload(&block).await;
                return Err(e.into());
            }
        };
        self.queue
            .push(WireMessage::Piece {
                index: block.index,
                begin: block.begin,
                data,
            })
            .await;
        Ok(())
    }

    /// Store a received block and verify its piece once every block is in.
    async fn receive_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        let store = self.ctx.store.clone();
        let Some(piece_len) = store.descriptor().piece_len(index as usize) else {
            return Err(PeerError::IndexOutOfRange {
                index,
                piece_count: self.piece_count(),
            }
            .into());
        };
        if begin as u64 + data.len() as u64 > piece_len {
            return Err(PeerError::InvalidBlock {
                index,
                begin,
                length: data.len() as u32,
            }
            .into());
        }

        if store.has_piece(index as usize).await {
            debug!("Dropping block of completed piece {} from {}", index, self.addr);
            self.assemblies.remove(&index);
            return Ok(());
        }

        let at_capacity = self.assemblies.len() >= self.ctx.config.pipeline_depth;
        let assembly = match self.assemblies.entry(index) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(_) if at_capacity => {
                debug!("Dropping unsolicited block of piece {} from {}", index, self.addr);
                return Ok(());
            }
            Entry::Vacant(entry) => entry.insert(PieceAssembly::new(index, piece_len)),
        };

        let outcome = assembly.add_block(begin, &data);
        match outcome {
            BlockOutcome::Accepted | BlockOutcome::Completed => {}
            BlockOutcome::Duplicate => {
                debug!("Duplicate block {}+{} from {}", index, begin, self.addr);
                return Ok(());
            }
            BlockOutcome::Unexpected => {
                debug!("Block {}+{} from {} is off the block grid", index, begin, self.addr);
                return Ok(());
            }
        }

        let offset = store.descriptor().piece_offset(index as usize) + begin as u64;
        store.write_range(offset, &data).await?;
        let _ = self.ctx.events.send(PeerEvent::Downloaded(data.len() as u64));

        if outcome == BlockOutcome::Completed {
            if let Some(assembly) = self.assemblies.remove(&index) {
                if store.verify_and_commit(index as usize, assembly.data()).await? {
                    let _ = self.ctx.events.send(PeerEvent::PieceVerified(index));
                } else {
                    warn!(
                        "Piece {} from {} failed verification, will re-request",
                        index, self.addr
                    );
                }
            }
        }

        Ok(())
    }

    /// A choking peer discards our requests; forget them so they are
    /// re-issued after the next unchoke.
    async fn forget_requests(&mut self) {
        for assembly in self.assemblies.values_mut() {
            assembly.reset_requested();
        }
        let withdrawn = self.queue.drain_requests().await;
        debug!(
            "Choked by {}, {} queued requests withdrawn",
            self.addr,
            withdrawn.len()
        );
    }

    /// Another connection finished `index`: stop fetching it here and tell
    /// the remote we have it.
    async fn piece_completed(&mut self, index: u32) {
        if let Some(assembly) = self.assemblies.remove(&index) {
            for block in assembly.outstanding() {
                if !self.queue.remove_request(&block).await {
                    self.queue.push(WireMessage::Cancel { block }).await;
                }
            }
            debug!("Piece {} completed elsewhere, dropped on {}", index, self.addr);
        }

        self.queue.push(WireMessage::Have { index }).await;
        self.refresh_interest().await;
        self.fill_requests().await;
    }

    async fn refresh_interest(&mut self) {
        let local = self.ctx.store.bitfield().await;
        let wanted = local.lacks_any_of(&self.remote);

        if wanted && !self.state.am_interested {
            self.send(WireMessage::Interested).await;
        } else if !wanted && self.state.am_interested {
            self.send(WireMessage::NotInterested).await;
        }
    }

    fn outstanding(&self) -> usize {
        self.assemblies
            .values()
            .map(PieceAssembly::outstanding_count)
            .sum()
    }

    /// Top up the request pipeline: first the pieces already in progress,
    /// then newly picked ones.
    async fn fill_requests(&mut self) {
        if self.state.peer_choking || !self.state.am_interested {
            return;
        }

        let mut budget = self
            .ctx
            .config
            .pipeline_depth
            .saturating_sub(self.outstanding());
        if budget == 0 {
            return;
        }

        let mut requests = Vec::new();
        for assembly in self.assemblies.values_mut() {
            if budget == 0 {
                break;
            }
            let batch = assembly.next_requests(budget);
            budget -= batch.len();
            requests.extend(batch);
        }

        let local = self.ctx.store.bitfield().await;
        let descriptor = self.ctx.store.descriptor().clone();
        while budget > 0 {
            let remote = &self.remote;
            let assemblies = &self.assemblies;
            let wanted = |i: usize| {
                !local.has(i) && remote.has(i) && !assemblies.contains_key(&(i as u32))
            };
            let Some(index) = self.picker.pick(local.piece_count(), &wanted) else {
                break;
            };
            let Some(length) = descriptor.piece_len(index) else {
                break;
            };

            let mut assembly = PieceAssembly::new(index as u32, length);
            let batch = assembly.next_requests(budget);
            budget -= batch.len();
            requests.extend(batch);
            self.assemblies.insert(index as u32, assembly);
        }

        for block in requests {
            self.queue.push(WireMessage::Request { block }).await;
        }
    }
}
