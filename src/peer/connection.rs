//! Peer connection module
//!
//! One task per remote peer. It performs the handshake, then shuttles wire
//! messages to and from the torrent actor: incoming frames become
//! [`PeerEvent`]s, [`PeerCommand`]s become outgoing frames. Received blocks
//! go straight into the disk cache; requested blocks are served from it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::engine::rate::BandwidthLimiter;
use crate::error::TorrentError;
use crate::peer::event::{CommandReceiver, EventSender, PeerCommand, PeerEvent};
use crate::peer::state::{CloseReason, ConnectionState, Direction};
use crate::protocol::{max_frame_len, read_message, write_message, Handshake, Message, MAX_BLOCK_LEN};
use crate::storage::{Bitfield, BlockRequest, DiskCache};
use crate::torrent::InfoHash;

/// Connection timers
#[derive(Debug, Clone)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    /// Close when nothing arrives for this long
    pub inactivity: Duration,
    pub keepalive: Duration,
}

impl ConnectionTimeouts {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            handshake: config.handshake_timeout(),
            inactivity: config.inactivity_timeout(),
            keepalive: config.keepalive_interval(),
        }
    }
}

/// Per-torrent state every connection needs
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub info_hash: InfoHash,
    /// Our peer id
    pub peer_id: [u8; 20],
    pub piece_count: usize,
    pub cache: Arc<DiskCache>,
    pub limiter: BandwidthLimiter,
    pub events: EventSender,
    pub timeouts: ConnectionTimeouts,
}

/// A single peer connection, consumed by [`PeerConnection::run`]
pub struct PeerConnection {
    addr: SocketAddr,
    direction: Direction,
    ctx: ConnectionContext,
    state: ConnectionState,
    /// Already connected socket (incoming connections)
    stream: Option<TcpStream>,
    /// Handshake the remote already sent (incoming connections)
    remote: Option<Handshake>,
    /// Pieces we have
    have: Bitfield,
    /// Our requests not yet answered
    outstanding: HashSet<BlockRequest>,
    am_choking: bool,
    peer_choking: bool,
    first_message: bool,
}

impl PeerConnection {
    /// Connection we will open to `addr`
    pub fn outgoing(addr: SocketAddr, ctx: ConnectionContext, have: Bitfield) -> Self {
        Self::build(addr, Direction::Outgoing, ctx, have, None, None)
    }

    /// Connection accepted by the listener, whose handshake was already read
    pub fn incoming(stream: TcpStream, remote: Handshake, ctx: ConnectionContext, have: Bitfield) -> Result<Self> {
        let addr = stream.peer_addr().map_err(|e| {
            TorrentError::peer_error_full("Failed to get peer address", "unknown", e.to_string())
        })?;
        Ok(Self::build(addr, Direction::Incoming, ctx, have, Some(stream), Some(remote)))
    }

    fn build(
        addr: SocketAddr,
        direction: Direction,
        ctx: ConnectionContext,
        have: Bitfield,
        stream: Option<TcpStream>,
        remote: Option<Handshake>,
    ) -> Self {
        Self {
            addr,
            direction,
            ctx,
            state: ConnectionState::Connecting,
            stream,
            remote,
            have,
            outstanding: HashSet::new(),
            am_choking: true,
            peer_choking: true,
            first_message: true,
        }
    }

    /// Drive the connection until it closes; always ends with a Closed event
    pub async fn run(mut self, mut commands: CommandReceiver) {
        let (reason, from) = match self.establish().await {
            Ok(stream) => (self.session(stream, &mut commands).await, ConnectionState::Active),
            Err(reason) => (reason, self.state),
        };

        self.state = ConnectionState::Closed;
        match &reason {
            CloseReason::Shutdown => debug!("Connection to {} closed: {}", self.addr, reason),
            _ => info!("Connection to {} closed ({:?}): {}", self.addr, from, reason),
        }
        let _ = self.ctx.events.send(PeerEvent::Closed {
            addr: self.addr,
            reason,
            from,
        });
    }

    /// Connect if needed and exchange handshakes
    async fn establish(&mut self) -> std::result::Result<TcpStream, CloseReason> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                debug!("Connecting to peer: {}", self.addr);
                match timeout(self.ctx.timeouts.connect, TcpStream::connect(self.addr)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        debug!("Failed to connect to {}: {}", self.addr, e);
                        return Err(CloseReason::ConnectionFailed);
                    }
                    Err(_) => {
                        debug!("Connection timeout to {}", self.addr);
                        return Err(CloseReason::ConnectionFailed);
                    }
                }
            }
        };

        self.state = ConnectionState::Handshaking;
        let ours = Handshake::new(self.ctx.info_hash, self.ctx.peer_id);
        let known = self.remote.take();
        let exchange = async {
            ours.write_to(&mut stream).await?;
            match known {
                Some(handshake) => Ok(handshake),
                None => Handshake::read_from(&mut stream).await,
            }
        };

        let remote = match timeout(self.ctx.timeouts.handshake, exchange).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                debug!("Handshake with {} failed: {}", self.addr, e);
                return Err(match classify_error(&e) {
                    CloseReason::ProtocolViolation(_) => CloseReason::HandshakeMismatch,
                    other => other,
                });
            }
            Err(_) => return Err(CloseReason::Timeout),
        };

        if !remote.validate(&self.ctx.info_hash) {
            warn!("Handshake validation failed with peer {}: info hash mismatch", self.addr);
            return Err(CloseReason::HandshakeMismatch);
        }
        if remote.peer_id == self.ctx.peer_id {
            debug!("Dropping connection to ourselves at {}", self.addr);
            return Err(CloseReason::SelfConnection);
        }

        self.state = ConnectionState::Active;
        info!("Connected to peer: {} ({:?})", self.addr, self.direction);
        self.emit(PeerEvent::Connected {
            addr: self.addr,
            peer_id: remote.peer_id,
            direction: self.direction,
        })?;
        Ok(stream)
    }

    async fn session(&mut self, stream: TcpStream, commands: &mut CommandReceiver) -> CloseReason {
        let (mut reader, mut writer) = stream.into_split();
        let max_len = max_frame_len(self.ctx.piece_count);

        let (message_tx, mut messages) = mpsc::channel::<Result<Message>>(32);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = read_message(&mut reader, max_len).await;
                let failed = result.is_err();
                if message_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let reason = self.drive(&mut writer, &mut messages, commands).await;

        reader_task.abort();
        self.state = ConnectionState::Closing;
        let _ = writer.shutdown().await;
        reason
    }

    async fn drive(
        &mut self,
        writer: &mut OwnedWriteHalf,
        messages: &mut mpsc::Receiver<Result<Message>>,
        commands: &mut CommandReceiver,
    ) -> CloseReason {
        if !self.have.none() {
            let bitfield = Message::Bitfield {
                bitfield: self.have.to_bytes(),
            };
            if let Err(reason) = send(writer, &bitfield).await {
                return reason;
            }
        }

        let every = self.ctx.timeouts.keepalive;
        let mut keepalive = tokio::time::interval_at(Instant::now() + every, every);
        let mut last_recv = Instant::now();

        loop {
            let idle_deadline = last_recv + self.ctx.timeouts.inactivity;
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, writer).await,
                    None => Err(CloseReason::Shutdown),
                },
                message = messages.recv() => match message {
                    Some(Ok(message)) => {
                        last_recv = Instant::now();
                        self.handle_message(message, writer).await
                    }
                    Some(Err(e)) => Err(classify_error(&e)),
                    None => Err(CloseReason::RemoteClosed),
                },
                _ = tokio::time::sleep_until(idle_deadline) => Err(CloseReason::Timeout),
                _ = keepalive.tick() => {
                    trace!("Sending keep-alive to {}", self.addr);
                    send(writer, &Message::KeepAlive).await
                }
            };

            if let Err(reason) = step {
                return reason;
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: PeerCommand,
        writer: &mut OwnedWriteHalf,
    ) -> std::result::Result<(), CloseReason> {
        match command {
            PeerCommand::Request(blocks) => {
                if self.peer_choking {
                    return self.emit(PeerEvent::RequestsFailed { addr: self.addr, blocks });
                }
                for block in blocks {
                    self.ctx.limiter.acquire_download(block.length as usize).await;
                    self.outstanding.insert(block);
                    let request = Message::Request {
                        index: block.piece,
                        begin: block.offset,
                        length: block.length,
                    };
                    send(writer, &request).await?;
                }
            }
            PeerCommand::Cancel(block) => {
                if self.outstanding.remove(&block) {
                    let cancel = Message::Cancel {
                        index: block.piece,
                        begin: block.offset,
                        length: block.length,
                    };
                    send(writer, &cancel).await?;
                }
            }
            PeerCommand::Have(piece) => {
                self.have.set(piece as usize);
                send(writer, &Message::Have { piece_index: piece }).await?;
            }
            PeerCommand::Choke => {
                self.am_choking = true;
                send(writer, &Message::Choke).await?;
            }
            PeerCommand::Unchoke => {
                self.am_choking = false;
                send(writer, &Message::Unchoke).await?;
            }
            PeerCommand::Interested(true) => send(writer, &Message::Interested).await?,
            PeerCommand::Interested(false) => send(writer, &Message::NotInterested).await?,
            PeerCommand::Close(reason) => return Err(reason),
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: Message,
        writer: &mut OwnedWriteHalf,
    ) -> std::result::Result<(), CloseReason> {
        if message == Message::KeepAlive {
            return Ok(());
        }
        let first = std::mem::replace(&mut self.first_message, false);
        let addr = self.addr;

        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                self.peer_choking = true;
                self.emit(PeerEvent::Choke { addr, choked: true })?;
                // a choke discards every pending request
                let dropped: Vec<BlockRequest> = self.outstanding.drain().collect();
                if dropped.is_empty() {
                    Ok(())
                } else {
                    self.emit(PeerEvent::RequestsFailed { addr, blocks: dropped })
                }
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.emit(PeerEvent::Choke { addr, choked: false })
            }
            Message::Interested => self.emit(PeerEvent::Interest { addr, interested: true }),
            Message::NotInterested => self.emit(PeerEvent::Interest { addr, interested: false }),
            Message::Have { piece_index } => {
                if piece_index as usize >= self.ctx.piece_count {
                    return Err(CloseReason::ProtocolViolation(format!(
                        "have for piece {} of {}",
                        piece_index, self.ctx.piece_count
                    )));
                }
                self.emit(PeerEvent::Have { addr, piece: piece_index })
            }
            Message::Bitfield { bitfield } => {
                if !first {
                    return Err(CloseReason::ProtocolViolation("bitfield after first message".to_string()));
                }
                let bitfield = Bitfield::from_bytes(&bitfield, self.ctx.piece_count)
                    .map_err(|e| CloseReason::ProtocolViolation(e.to_string()))?;
                self.emit(PeerEvent::Bitfield { addr, bitfield })
            }
            Message::Request { index, begin, length } => self.serve(index, begin, length, writer).await,
            Message::Piece { index, begin, block } => self.receive(index, begin, block).await,
            Message::Cancel { index, begin, .. } => {
                trace!("Peer {} cancelled {}:{}", addr, index, begin);
                Ok(())
            }
            Message::Port { listen_port } => {
                trace!("Peer {} has DHT port {}", addr, listen_port);
                Ok(())
            }
            Message::Unknown { id } => {
                trace!("Ignoring message {} from {}", id, addr);
                Ok(())
            }
        }
    }

    /// Answer a remote block request
    async fn serve(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
        writer: &mut OwnedWriteHalf,
    ) -> std::result::Result<(), CloseReason> {
        let metadata = self.ctx.cache.metadata();
        let in_bounds = (index as usize) < self.ctx.piece_count
            && length > 0
            && length <= MAX_BLOCK_LEN
            && begin as u64 + length as u64 <= metadata.piece_size(index) as u64;
        if !in_bounds {
            return Err(CloseReason::ProtocolViolation(format!(
                "request {}:{}+{} out of range",
                index, begin, length
            )));
        }

        if self.am_choking {
            trace!("Ignoring request from choked peer {}", self.addr);
            return Ok(());
        }
        if !self.ctx.cache.is_sealed(index) {
            debug!("Peer {} requested piece {} we do not have", self.addr, index);
            return Ok(());
        }

        self.ctx.limiter.acquire_upload(length as usize).await;
        match self.ctx.cache.read_block(index, begin, length).await {
            Ok(block) => {
                send(writer, &Message::Piece { index, begin, block }).await?;
                self.emit(PeerEvent::BlockUploaded {
                    addr: self.addr,
                    bytes: length as u64,
                })
            }
            Err(e) => {
                warn!("Failed to read block {}:{} for {}: {}", index, begin, self.addr, e);
                Ok(())
            }
        }
    }

    /// Store a block we asked for
    async fn receive(&mut self, index: u32, begin: u32, block: Bytes) -> std::result::Result<(), CloseReason> {
        let request = BlockRequest::new(index, begin, block.len() as u32);
        if !self.outstanding.remove(&request) {
            debug!("Dropping unsolicited block {}:{} from {}", index, begin, self.addr);
            return Ok(());
        }

        let stored = match self.ctx.cache.write_block(index, begin, block).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to cache block {}:{} from {}: {}", index, begin, self.addr, e);
                false
            }
        };
        trace!("Received block {}:{} from {} (stored: {})", index, begin, self.addr, stored);
        self.emit(PeerEvent::BlockReceived {
            addr: self.addr,
            block: request,
            stored,
        })
    }

    fn emit(&self, event: PeerEvent) -> std::result::Result<(), CloseReason> {
        self.ctx.events.send(event).map_err(|_| CloseReason::Shutdown)
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: &Message) -> std::result::Result<(), CloseReason> {
    write_message(writer, message).await.map_err(|e| classify_error(&e))
}

/// Map a wire error onto a close reason
fn classify_error(e: &anyhow::Error) -> CloseReason {
    if let Some(io) = e.downcast_ref::<std::io::Error>() {
        return match io.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => CloseReason::RemoteClosed,
            _ => CloseReason::Io(io.to_string()),
        };
    }
    match e.downcast_ref::<TorrentError>() {
        Some(TorrentError::ProtocolError { .. }) => CloseReason::ProtocolViolation(e.to_string()),
        _ => CloseReason::Io(e.to_string()),
    }
}
