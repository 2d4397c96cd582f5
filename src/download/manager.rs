//! Torrent manager
//!
//! One actor task per torrent. It owns the piece store, the piece picker and
//! the peer set, and is the only place they are mutated: peer connections
//! report through an event channel, the engine talks to it through a
//! [`TorrentHandle`], and piece verifications report back on a third
//! channel. Re-checking data already on disk reports on that same channel,
//! so the actor keeps answering commands while a torrent is Hashing.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::download::choker::{ChokeCandidate, Choker};
use crate::download::handle::{TorrentCommand, TorrentHandle};
use crate::download::picker::{BlockOutcome, PickMode, PieceManager};
use crate::engine::rate::BandwidthLimiter;
use crate::error::TorrentError;
use crate::peer::event::{EventReceiver, EventSender};
use crate::peer::{
    CloseReason, ConnectionContext, ConnectionState, ConnectionTimeouts, Direction, PeerCommand, PeerConnection,
    PeerEvent, PeerManager, PeerRecord, PeerSlot,
};
use crate::protocol::Handshake;
use crate::stats::{AnnounceOutcome, EventLog, FileSnapshot, RateMeter, TorrentSnapshot, TrackerTierSnapshot};
use crate::storage::{BlockRequest, CacheConfig, DiskCache, FlushOutcome, PieceStore, ResumeManager, StorageBackend};
use crate::torrent::TorrentMetadata;

/// Commands queued per torrent before senders wait
const COMMAND_BUFFER: usize = 64;

/// What a verification task found
#[derive(Debug)]
enum Check {
    /// Flush and hash of a downloaded piece
    Flushed(FlushOutcome),
    /// Start-time hash of data already on disk
    OnDisk(bool),
}

/// (session, piece, result) of a finished verification
type Verification = (u64, u32, Check);
type VerifySender = mpsc::UnboundedSender<Verification>;
type VerifyReceiver = mpsc::UnboundedReceiver<Verification>;

/// Lifecycle of a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TorrentState {
    Stopped,
    /// Checking data already on disk
    Hashing,
    Downloading,
    Seeding,
    /// Unrecoverable disk failure; see the snapshot's error reason
    Error,
}

/// Everything a torrent actor is built from
#[derive(Debug, Clone)]
pub struct TorrentParams {
    pub metadata: Arc<TorrentMetadata>,
    pub save_dir: PathBuf,
    pub backend: Arc<dyn StorageBackend>,
    pub config: Arc<EngineConfig>,
    pub limiter: BandwidthLimiter,
    /// Engine-wide connection budget
    pub permits: Arc<Semaphore>,
    pub peer_id: [u8; 20],
}

/// Single-owner state of one torrent
pub struct TorrentManager {
    metadata: Arc<TorrentMetadata>,
    config: Arc<EngineConfig>,
    state: TorrentState,
    error: Option<String>,
    store: PieceStore,
    picker: PieceManager,
    peers: PeerManager,
    choker: Choker,
    backend: Arc<dyn StorageBackend>,
    cache: Arc<DiskCache>,
    resume: ResumeManager,
    limiter: BandwidthLimiter,
    permits: Arc<Semaphore>,
    peer_id: [u8; 20],
    events_tx: EventSender,
    verify_tx: VerifySender,
    /// Pieces being flushed and hashed in this session
    verifying: HashSet<u32>,
    /// Pieces on disk still waiting for their start-time hash
    rechecking: HashSet<u32>,
    recheck: Option<JoinHandle<()>>,
    /// Bumped on every start so verifications from an earlier run are ignored
    session: u64,
    failed_pieces: u32,
    trackers: Vec<TrackerTierSnapshot>,
    downloaded: RateMeter,
    uploaded: RateMeter,
    ticks: u64,
    /// Statistics captured when the torrent entered Error
    frozen: Option<TorrentSnapshot>,
    recent: EventLog,
}

impl TorrentManager {
    /// Start the actor; it runs until shut down through the handle
    pub fn spawn(params: TorrentParams) -> (TorrentHandle, JoinHandle<()>) {
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (verify_tx, verified) = mpsc::unbounded_channel();

        let manager = Self::new(params, events_tx, verify_tx);
        let handle = TorrentHandle::new(manager.metadata.info_hash, sender);
        let task = tokio::spawn(manager.run(commands, events, verified));
        (handle, task)
    }

    fn new(params: TorrentParams, events_tx: EventSender, verify_tx: VerifySender) -> Self {
        let TorrentParams {
            metadata,
            save_dir,
            backend,
            config,
            limiter,
            permits,
            peer_id,
        } = params;

        let resume = ResumeManager::new(config.resume_dir_for(&save_dir));
        let cache = Arc::new(DiskCache::new(backend.clone(), metadata.clone(), CacheConfig::from_config(&config)));
        let trackers = metadata
            .trackers
            .iter()
            .enumerate()
            .map(|(tier, urls)| TrackerTierSnapshot {
                tier,
                urls: urls.clone(),
                ..Default::default()
            })
            .collect();

        debug!("Creating torrent manager for {} in {}", metadata.name, save_dir.display());
        Self {
            store: PieceStore::new(metadata.clone()),
            picker: PieceManager::new(metadata.clone(), config.block_size, pick_mode(&config)),
            peers: PeerManager::new(config.max_connections_per_torrent, config.blacklist_cooldown()),
            choker: Choker::new(config.upload_slots),
            metadata,
            state: TorrentState::Stopped,
            error: None,
            backend,
            cache,
            resume,
            limiter,
            permits,
            peer_id,
            events_tx,
            verify_tx,
            verifying: HashSet::new(),
            rechecking: HashSet::new(),
            recheck: None,
            session: 0,
            failed_pieces: 0,
            trackers,
            downloaded: RateMeter::default(),
            uploaded: RateMeter::default(),
            ticks: 0,
            frozen: None,
            recent: EventLog::default(),
            config,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<TorrentCommand>,
        mut events: EventReceiver,
        mut verified: VerifyReceiver,
    ) {
        let mut tick = time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(TorrentCommand::Shutdown { responder }) => {
                        let result = self.stop(&mut events, &mut verified).await;
                        let _ = responder.send(result);
                        break;
                    }
                    Some(command) => self.handle_command(command, &mut events, &mut verified).await,
                    None => {
                        let _ = self.stop(&mut events, &mut verified).await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some((session, piece, check)) = verified.recv() => self.handle_verification(session, piece, check),
                _ = tick.tick() => self.on_tick(),
            }
        }

        info!("Torrent manager for {} exited", self.metadata.name);
    }

    async fn handle_command(&mut self, command: TorrentCommand, events: &mut EventReceiver, verified: &mut VerifyReceiver) {
        match command {
            TorrentCommand::Start { responder } => {
                let _ = responder.send(self.start().await);
            }
            TorrentCommand::Stop { responder } => {
                let _ = responder.send(self.stop(events, verified).await);
            }
            TorrentCommand::Retry { responder } => {
                let _ = responder.send(self.retry().await);
            }
            TorrentCommand::AddPeers { addrs } => {
                self.peers.add_candidates(addrs);
                self.connect_candidates();
            }
            TorrentCommand::Incoming {
                stream,
                handshake,
                permit,
            } => self.accept_incoming(stream, handshake, permit),
            TorrentCommand::Snapshot { responder } => {
                let _ = responder.send(self.snapshot());
            }
            TorrentCommand::ReportAnnounce { tier, outcome } => self.report_announce(tier, outcome),
            // handled by the run loop
            TorrentCommand::Shutdown { .. } => {}
        }
    }

    fn is_running(&self) -> bool {
        matches!(self.state, TorrentState::Downloading | TorrentState::Seeding)
    }

    fn set_state(&mut self, state: TorrentState) {
        if self.state != state {
            info!("Torrent {}: {:?} -> {:?}", self.metadata.name, self.state, state);
            self.recent.push(format!("State {:?} -> {:?}", self.state, state));
            self.state = state;
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self.state {
            TorrentState::Stopped => {}
            TorrentState::Error => {
                return Err(TorrentError::validation_error_with_field(
                    format!("Torrent {} is in the error state, retry it instead", self.metadata.name),
                    "state",
                )
                .into());
            }
            _ => {
                debug!("Torrent {} already started", self.metadata.name);
                return Ok(());
            }
        }

        self.set_state(TorrentState::Hashing);
        if let Err(e) = self.prepare().await {
            self.enter_error(format!("failed to prepare storage: {}", e));
            return Err(e);
        }
        if self.rechecking.is_empty() {
            self.finish_hashing();
        }
        Ok(())
    }

    /// Rebuild in-memory state from resume data or from the data on disk
    ///
    /// Without resume data every piece that fits in the existing files is
    /// hashed in the background; the torrent stays Hashing until the last
    /// result arrives.
    async fn prepare(&mut self) -> Result<()> {
        self.session += 1;
        self.verifying.clear();
        self.rechecking.clear();
        self.cache = Arc::new(DiskCache::new(
            self.backend.clone(),
            self.metadata.clone(),
            CacheConfig::from_config(&self.config),
        ));
        self.store = PieceStore::new(self.metadata.clone());
        self.picker = PieceManager::new(self.metadata.clone(), self.config.block_size, pick_mode(&self.config));

        let file_lengths = self.backend.file_lengths().await?;
        let resume = if self.config.fast_resume {
            self.resume.load_resume_data(&self.metadata.info_hash).await
        } else {
            None
        };

        let mut partial = Vec::new();
        let mut on_disk = Vec::new();
        match resume {
            Some(resume) => {
                let report = self.store.restore(&resume, &file_lengths);
                partial = report.partial;
            }
            None => {
                on_disk = (0..self.metadata.piece_count() as u32)
                    .filter(|piece| self.store.fits_on_disk(*piece, &file_lengths))
                    .collect();
            }
        }

        self.backend.allocate().await?;
        for piece in self.store.bitfield().iter_ones() {
            self.cache.seal(piece as u32);
        }
        self.picker.set_completed(self.store.bitfield());
        self.picker.restore_partial(&partial);
        for piece in self.picker.take_ready_pieces() {
            self.spawn_verification(piece);
        }
        if !on_disk.is_empty() {
            self.spawn_recheck(on_disk);
        }
        Ok(())
    }

    /// Hash pieces already on disk one after another, off the actor
    fn spawn_recheck(&mut self, pieces: Vec<u32>) {
        info!("Checking {} pieces already on disk for {}", pieces.len(), self.metadata.name);
        self.rechecking = pieces.iter().copied().collect();

        let cache = self.cache.clone();
        let verify_tx = self.verify_tx.clone();
        let session = self.session;
        self.recheck = Some(tokio::spawn(async move {
            for piece in pieces {
                let valid = match cache.verify_from_disk(piece).await {
                    Ok(valid) => valid,
                    Err(e) => {
                        debug!("Could not check piece {}: {}", piece, e);
                        false
                    }
                };
                if verify_tx.send((session, piece, Check::OnDisk(valid))).is_err() {
                    break;
                }
            }
        }));
    }

    fn cancel_recheck(&mut self) {
        if let Some(task) = self.recheck.take() {
            task.abort();
        }
        self.rechecking.clear();
    }

    /// Leave Hashing for Downloading or Seeding and start dialling peers
    fn finish_hashing(&mut self) {
        self.recheck = None;
        self.picker.set_completed(self.store.bitfield());
        info!(
            "Torrent {} has {}/{} pieces ({:.1}%)",
            self.metadata.name,
            self.store.completed_count(),
            self.metadata.piece_count(),
            self.store.completion_fraction() * 100.0
        );

        if self.store.is_seed() {
            self.set_state(TorrentState::Seeding);
        } else {
            self.set_state(TorrentState::Downloading);
        }
        self.connect_candidates();
    }

    async fn retry(&mut self) -> Result<()> {
        if self.state != TorrentState::Error {
            return Err(TorrentError::validation_error_with_field(
                format!("Torrent {} is not in the error state", self.metadata.name),
                "state",
            )
            .into());
        }

        info!("Retrying torrent {}", self.metadata.name);
        self.error = None;
        self.frozen = None;
        self.failed_pieces = 0;
        self.set_state(TorrentState::Stopped);
        self.start().await
    }

    /// Stop within the configured grace period
    ///
    /// Waits for running verifications, writes dirty blocks, saves resume
    /// data and closes every connection. Connections still running at the
    /// deadline are aborted.
    async fn stop(&mut self, events: &mut EventReceiver, verified: &mut VerifyReceiver) -> Result<()> {
        if self.state == TorrentState::Stopped && self.peers.is_empty() && self.verifying.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.stop_timeout();
        // an interrupted re-check leaves nothing worth saving
        let was_running = !matches!(self.state, TorrentState::Stopped | TorrentState::Hashing);
        self.cancel_recheck();
        if self.state != TorrentState::Error {
            self.set_state(TorrentState::Stopped);
        }

        while !self.verifying.is_empty() {
            match time::timeout_at(deadline, verified.recv()).await {
                Ok(Some((session, piece, check))) => self.handle_verification(session, piece, check),
                _ => {
                    warn!("Gave up waiting for {} piece verifications", self.verifying.len());
                    break;
                }
            }
        }

        let mut result = Ok(());
        let partial = match self.cache.flush_dirty().await {
            Ok(_) => self.picker.partial_pieces(),
            Err(e) => {
                warn!("Failed to write buffered blocks of {}: {}", self.metadata.name, e);
                result = Err(e);
                Vec::new()
            }
        };

        if self.config.fast_resume && was_running {
            let data = self.store.to_resume(partial);
            if let Err(e) = self.resume.save_resume_data(&self.metadata.info_hash, &data).await {
                warn!("Failed to save resume data for {}: {}", self.metadata.name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let slots = self.peers.drain();
        for slot in &slots {
            let _ = slot.commands.send(PeerCommand::Close(CloseReason::Shutdown));
        }
        for mut slot in slots {
            if time::timeout_at(deadline, &mut slot.task).await.is_err() {
                debug!("Aborting connection to {}", slot.record.addr);
                slot.task.abort();
            }
        }
        while events.try_recv().is_ok() {}

        info!("Torrent {} stopped", self.metadata.name);
        result
    }

    fn enter_error(&mut self, reason: String) {
        error!("Torrent {} failed: {}", self.metadata.name, reason);
        self.cancel_recheck();
        self.error = Some(reason);
        self.set_state(TorrentState::Error);
        self.frozen = Some(self.build_snapshot());

        // their Closed events arrive after the slots are gone, so release here
        for slot in self.peers.drain() {
            let record = &slot.record;
            self.picker
                .peer_disconnected(record.addr, &record.bitfield, record.outstanding.iter().copied());
            let _ = slot.commands.send(PeerCommand::Close(CloseReason::Shutdown));
        }
    }

    fn report_announce(&mut self, tier: usize, outcome: AnnounceOutcome) {
        match self.trackers.get_mut(tier) {
            Some(status) => {
                debug!("Tracker tier {} of {}: {:?}", tier, self.metadata.name, outcome);
                let line = match &outcome {
                    AnnounceOutcome::Announced => format!("Tracker tier {}: announced", tier),
                    AnnounceOutcome::Scraped => format!("Tracker tier {}: scraped", tier),
                    AnnounceOutcome::Failed(reason) => format!("Tracker tier {}: failed ({})", tier, reason),
                };
                status.apply(outcome);
                self.recent.push(line);
            }
            None => warn!("Announce report for unknown tracker tier {} of {}", tier, self.metadata.name),
        }
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            piece_count: self.metadata.piece_count(),
            cache: self.cache.clone(),
            limiter: self.limiter.clone(),
            events: self.events_tx.clone(),
            timeouts: ConnectionTimeouts::from_config(&self.config),
        }
    }

    /// Dial queued addresses while both connection budgets allow
    fn connect_candidates(&mut self) {
        if !self.is_running() {
            return;
        }

        while self.peers.can_add_connection() {
            let Some(addr) = self.peers.next_candidate() else {
                break;
            };
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("No connection permit left, deferring {}", addr);
                    self.peers.add_candidates([addr]);
                    break;
                }
            };

            let connection = PeerConnection::outgoing(addr, self.context(), self.store.bitfield().clone());
            let record = PeerRecord::new(addr, Direction::Outgoing, self.metadata.piece_count());
            self.spawn_connection(connection, record, permit);
        }
    }

    fn accept_incoming(&mut self, stream: TcpStream, handshake: Handshake, permit: OwnedSemaphorePermit) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("Dropping incoming connection without address: {}", e);
                return;
            }
        };

        if !self.is_running() {
            debug!("Rejecting {}: torrent {} is not running", addr, self.metadata.name);
            return;
        }
        if self.peers.is_blacklisted(&addr) || self.peers.contains(&addr) {
            debug!("Rejecting incoming connection from {}", addr);
            return;
        }
        if !self.peers.can_add_connection() {
            debug!("Rejecting {}: torrent {} has no free connection slots", addr, self.metadata.name);
            return;
        }

        match PeerConnection::incoming(stream, handshake, self.context(), self.store.bitfield().clone()) {
            Ok(connection) => {
                let mut record = PeerRecord::new(addr, Direction::Incoming, self.metadata.piece_count());
                record.state = ConnectionState::Handshaking;
                self.spawn_connection(connection, record, permit);
            }
            Err(e) => warn!("Failed to accept connection from {}: {}", addr, e),
        }
    }

    fn spawn_connection(&mut self, connection: PeerConnection, record: PeerRecord, permit: OwnedSemaphorePermit) {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(connection.run(rx));
        self.peers.insert(PeerSlot {
            record,
            commands,
            task,
            permit: Some(permit),
        });
    }

    fn handle_event(&mut self, event: PeerEvent) {
        let addr = event.addr();
        if !self.peers.contains(&addr) {
            trace!("Ignoring event from departed peer {}", addr);
            return;
        }

        match event {
            PeerEvent::Connected { peer_id, direction, .. } => {
                if let Some(record) = self.peers.record_mut(&addr) {
                    record.peer_id = Some(peer_id);
                    record.direction = direction;
                    record.state = ConnectionState::Active;
                }
                self.recent.push(format!("Connected to {}", addr));
            }
            PeerEvent::Bitfield { bitfield, .. } => {
                self.picker.peer_bitfield(&bitfield);
                if let Some(record) = self.peers.record_mut(&addr) {
                    record.bitfield = bitfield;
                }
                self.update_interest(addr);
            }
            PeerEvent::Have { piece, .. } => {
                let added = self
                    .peers
                    .record_mut(&addr)
                    .map(|record| record.bitfield.set(piece as usize))
                    .unwrap_or(false);
                if added {
                    self.picker.peer_have(piece);
                }
                self.update_interest(addr);
            }
            PeerEvent::Choke { choked, .. } => {
                if let Some(record) = self.peers.record_mut(&addr) {
                    record.peer_choking = choked;
                }
                if !choked {
                    self.fill_requests(addr);
                }
            }
            PeerEvent::Interest { interested, .. } => {
                if let Some(record) = self.peers.record_mut(&addr) {
                    record.peer_interested = interested;
                }
                if interested {
                    self.maybe_unchoke(addr);
                }
            }
            PeerEvent::BlockReceived { block, stored, .. } => self.on_block(addr, block, stored),
            PeerEvent::RequestsFailed { blocks, .. } => {
                for block in blocks {
                    if let Some(record) = self.peers.record_mut(&addr) {
                        record.untrack(&block);
                    }
                    self.picker.release_block(addr, block);
                }
            }
            PeerEvent::BlockUploaded { bytes, .. } => {
                if let Some(record) = self.peers.record_mut(&addr) {
                    record.upload.record(bytes);
                }
                self.uploaded.record(bytes);
            }
            PeerEvent::Closed { reason, from, .. } => self.on_closed(addr, reason, from),
        }
    }

    fn on_block(&mut self, addr: SocketAddr, block: BlockRequest, stored: bool) {
        if let Some(record) = self.peers.record_mut(&addr) {
            record.untrack(&block);
            record.download.record(block.length as u64);
            record.last_block_at = Some(std::time::Instant::now());
        }
        self.downloaded.record(block.length as u64);

        if !stored {
            self.picker.release_block(addr, block);
        } else {
            match self.picker.on_block_received(addr, block) {
                BlockOutcome::Accepted { piece_complete, cancel } => {
                    for other in cancel {
                        if let Some(record) = self.peers.record_mut(&other) {
                            record.untrack(&block);
                        }
                        self.peers.send(&other, PeerCommand::Cancel(block));
                    }
                    if piece_complete {
                        self.spawn_verification(block.piece);
                    }
                }
                BlockOutcome::Duplicate => {
                    // the piece was reset after this copy reached the cache
                    trace!("Stale block {}:{} from {}", block.piece, block.offset, addr);
                    self.cache.discard_block(block.piece, block.offset);
                }
            }
        }

        self.fill_requests(addr);
    }

    fn on_closed(&mut self, addr: SocketAddr, reason: CloseReason, from: ConnectionState) {
        let Some(slot) = self.peers.remove(&addr) else {
            return;
        };
        debug!("Peer {} left {} from {:?}: {}", addr, self.metadata.name, from, reason);
        if from == ConnectionState::Active {
            self.recent.push(format!("Peer {} disconnected: {}", addr, reason));
        } else {
            self.recent.push(format!("Connection to {} failed: {}", addr, reason));
        }

        self.picker
            .peer_disconnected(addr, &slot.record.bitfield, slot.record.outstanding.iter().copied());
        if matches!(reason, CloseReason::SelfConnection | CloseReason::ProtocolViolation(_)) {
            self.peers.blacklist(addr);
        }
        drop(slot);

        self.connect_candidates();
        self.fill_all();
    }

    fn spawn_verification(&mut self, piece: u32) {
        if !self.verifying.insert(piece) {
            return;
        }
        let cache = self.cache.clone();
        let verify_tx = self.verify_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let outcome = cache.flush(piece).await;
            let _ = verify_tx.send((session, piece, Check::Flushed(outcome)));
        });
    }

    fn handle_verification(&mut self, session: u64, piece: u32, check: Check) {
        if session != self.session {
            trace!("Ignoring verification of piece {} from an earlier run", piece);
            return;
        }
        match check {
            Check::Flushed(outcome) if self.verifying.remove(&piece) => self.on_flushed(piece, outcome),
            Check::OnDisk(valid) if self.rechecking.remove(&piece) => self.on_rechecked(piece, valid),
            _ => trace!("Ignoring stale verification of piece {}", piece),
        }
    }

    fn on_rechecked(&mut self, piece: u32, valid: bool) {
        if valid {
            self.store.mark_complete(piece);
            self.recent.push(format!("Piece {} hashed: pass", piece));
        } else {
            trace!("Piece {} on disk does not match", piece);
            self.recent.push(format!("Piece {} hashed: fail", piece));
        }
        if self.rechecking.is_empty() && self.state == TorrentState::Hashing {
            self.finish_hashing();
        }
    }

    fn on_flushed(&mut self, piece: u32, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Verified => {
                self.recent.push(format!("Piece {} hashed: pass", piece));
                self.picker.on_piece_verified(piece);
                if !self.store.mark_complete(piece) {
                    return;
                }
                info!(
                    "Piece {} of {} verified ({}/{})",
                    piece,
                    self.metadata.name,
                    self.store.completed_count(),
                    self.metadata.piece_count()
                );
                self.peers.broadcast(PeerCommand::Have(piece));

                if self.store.is_seed() && self.state == TorrentState::Downloading {
                    info!("Download of {} complete", self.metadata.name);
                    self.set_state(TorrentState::Seeding);
                    for addr in self.peers.active_addrs() {
                        self.update_interest(addr);
                    }
                    self.save_resume_in_background();
                }
            }
            FlushOutcome::HashMismatch => {
                warn!("Piece {} of {} failed hash check", piece, self.metadata.name);
                self.recent.push(format!("Piece {} hashed: fail", piece));
                for addr in self.picker.on_piece_failed(piece) {
                    let strikes = self.peers.add_strike(addr);
                    if strikes > self.config.bad_data_threshold {
                        warn!("Disconnecting {} after {} bad pieces", addr, strikes);
                        self.peers.blacklist(addr);
                        self.peers.send(&addr, PeerCommand::Close(CloseReason::BadData));
                    }
                }
                self.fill_all();
            }
            FlushOutcome::Failed(reason) => {
                error!("Writing piece {} of {} failed: {}", piece, self.metadata.name, reason);
                self.picker.reset_piece(piece);
                self.cache.discard(piece);
                self.failed_pieces += 1;
                if self.failed_pieces >= self.config.max_failed_pieces && self.state != TorrentState::Error {
                    self.enter_error(format!("disk failure on piece {}: {}", piece, reason));
                }
            }
        }
    }

    fn save_resume_in_background(&self) {
        if !self.config.fast_resume {
            return;
        }
        let data = self.store.to_resume(self.picker.partial_pieces());
        let resume = self.resume.clone();
        let info_hash = self.metadata.info_hash;
        tokio::spawn(async move {
            if let Err(e) = resume.save_resume_data(&info_hash, &data).await {
                warn!("Failed to save resume data for {}: {}", info_hash, e);
            }
        });
    }

    /// Tell the peer whether it has anything we want, then top up requests
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(record) = self.peers.record(&addr) else {
            return;
        };
        let interested = self.state == TorrentState::Downloading && self.picker.is_interesting(&record.bitfield);
        if interested != record.am_interested {
            if let Some(record) = self.peers.record_mut(&addr) {
                record.am_interested = interested;
            }
            self.peers.send(&addr, PeerCommand::Interested(interested));
        }
        if interested {
            self.fill_requests(addr);
        }
    }

    /// Unchoke an interested peer straight away while upload slots are free
    fn maybe_unchoke(&mut self, addr: SocketAddr) {
        if !self.is_running() {
            return;
        }
        let unchoked = self.peers.records().filter(|record| !record.am_choking).count();
        if unchoked >= self.config.upload_slots {
            return;
        }
        if let Some(record) = self.peers.record_mut(&addr) {
            if record.am_choking && record.state == ConnectionState::Active {
                record.am_choking = false;
                debug!("Unchoking {}", addr);
                self.peers.send(&addr, PeerCommand::Unchoke);
            }
        }
    }

    fn fill_requests(&mut self, addr: SocketAddr) {
        if self.state != TorrentState::Downloading {
            return;
        }
        let Some(record) = self.peers.record(&addr) else {
            return;
        };
        if !record.can_request() {
            return;
        }

        let blocks = self.picker.select_requests(record, self.config.max_outstanding_requests);
        if blocks.is_empty() {
            return;
        }
        trace!("Requesting {} blocks from {}", blocks.len(), addr);
        if let Some(record) = self.peers.record_mut(&addr) {
            record.track_requests(&blocks);
        }
        self.peers.send(&addr, PeerCommand::Request(blocks));
    }

    fn fill_all(&mut self) {
        for addr in self.peers.active_addrs() {
            self.fill_requests(addr);
        }
    }

    fn on_tick(&mut self) {
        if !self.is_running() {
            return;
        }
        self.ticks += 1;

        self.expire_requests();
        if self.ticks % self.config.choke_ticks.max(1) as u64 == 0 {
            self.rechoke();
        }
        self.peers.prune_blacklist();
        self.connect_candidates();
        self.fill_all();
    }

    /// Cancel requests that went unanswered for too long
    fn expire_requests(&mut self) {
        let timeout = self.config.request_timeout();
        let expired: Vec<(SocketAddr, Vec<BlockRequest>)> = self
            .peers
            .records()
            .map(|record| (record.addr, record.expired_requests(timeout)))
            .filter(|(_, blocks)| !blocks.is_empty())
            .collect();

        for (addr, blocks) in expired {
            debug!("{} requests to {} timed out", blocks.len(), addr);
            for block in blocks {
                if let Some(record) = self.peers.record_mut(&addr) {
                    record.untrack(&block);
                }
                self.picker.release_block(addr, block);
                self.peers.send(&addr, PeerCommand::Cancel(block));
            }
        }
    }

    fn rechoke(&mut self) {
        let seeding = self.state == TorrentState::Seeding;
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .records()
            .filter(|record| record.state == ConnectionState::Active)
            .map(|record| ChokeCandidate {
                addr: record.addr,
                rate: if seeding { record.upload.rate() } else { record.download.rate() },
                interested: record.peer_interested,
                choked: record.am_choking,
            })
            .collect();

        let decision = self.choker.rechoke(&candidates);
        for addr in decision.unchoke {
            if let Some(record) = self.peers.record_mut(&addr) {
                record.am_choking = false;
            }
            self.peers.send(&addr, PeerCommand::Unchoke);
        }
        for addr in decision.choke {
            if let Some(record) = self.peers.record_mut(&addr) {
                record.am_choking = true;
            }
            self.peers.send(&addr, PeerCommand::Choke);
        }
    }

    fn snapshot(&self) -> TorrentSnapshot {
        match &self.frozen {
            Some(frozen) => frozen.clone(),
            None => self.build_snapshot(),
        }
    }

    fn build_snapshot(&self) -> TorrentSnapshot {
        let files = self
            .metadata
            .files
            .iter()
            .zip(self.store.file_progress())
            .map(|(file, progress)| FileSnapshot {
                path: file.path.clone(),
                length: file.length,
                progress,
            })
            .collect();

        TorrentSnapshot {
            info_hash: self.metadata.info_hash,
            name: self.metadata.name.clone(),
            state: self.state,
            error: self.error.clone(),
            progress: self.store.completion_fraction(),
            total_size: self.metadata.total_size(),
            verified_bytes: self.store.verified_bytes(),
            pieces_complete: self.store.completed_count(),
            piece_count: self.metadata.piece_count(),
            downloaded: self.downloaded.total(),
            uploaded: self.uploaded.total(),
            download_rate: self.downloaded.rate(),
            upload_rate: self.uploaded.rate(),
            current_requests: self.picker.outstanding_requests(),
            endgame: self.state == TorrentState::Downloading && self.picker.in_endgame(),
            peers: self
                .peers
                .records()
                .filter(|record| record.state == ConnectionState::Active)
                .map(PeerRecord::snapshot)
                .collect(),
            trackers: self.trackers.clone(),
            files,
            cache: self.cache.stats(),
            recent_events: self.recent.entries(),
        }
    }
}

fn pick_mode(config: &EngineConfig) -> PickMode {
    if config.sequential {
        PickMode::Sequential
    } else {
        PickMode::RarestFirst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use crate::testing::{test_config, FailingBackend, FakeSeeder, SeederMode, SlowBackend, TestTorrent};
    use std::path::Path;
    use std::time::Duration;

    const PIECE: u64 = 16 * 1024;

    fn params(torrent: &TestTorrent, dir: &Path, config: EngineConfig) -> TorrentParams {
        let save_dir = dir.join("data");
        TorrentParams {
            metadata: torrent.metadata.clone(),
            backend: Arc::new(FileStorage::new(save_dir.clone(), torrent.metadata.clone())),
            save_dir,
            config: Arc::new(config),
            limiter: BandwidthLimiter::unlimited(),
            permits: Arc::new(Semaphore::new(16)),
            peer_id: Handshake::generate_peer_id(),
        }
    }

    async fn wait_for(handle: &TorrentHandle, done: impl Fn(&TorrentSnapshot) -> bool) -> TorrentSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out in state {:?} at {:.2}",
                snapshot.state,
                snapshot.progress
            );
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn saved_file(dir: &Path, torrent: &TestTorrent) -> Vec<u8> {
        std::fs::read(dir.join("data").join(&torrent.metadata.files[0].path)).unwrap()
    }

    /// Payload already in place, behind a backend that takes `delay` per read
    fn slow_params(torrent: &TestTorrent, dir: &Path, delay: Duration) -> TorrentParams {
        let data = dir.join("data");
        std::fs::create_dir_all(&data).unwrap();
        torrent.write_to(&data);
        let mut params = params(torrent, dir, test_config(&dir.join("resume")));
        params.backend = Arc::new(SlowBackend::new(FileStorage::new(data, torrent.metadata.clone()), delay));
        params
    }

    /// A manager driven by hand, without its run loop
    fn idle_manager(torrent: &TestTorrent, dir: &Path, config: EngineConfig) -> TorrentManager {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (verify_tx, _verified) = mpsc::unbounded_channel();
        TorrentManager::new(params(torrent, dir, config), events_tx, verify_tx)
    }

    /// Register an active peer that has every piece and a full request window
    fn busy_peer(manager: &mut TorrentManager, port: u16) -> (SocketAddr, mpsc::UnboundedReceiver<PeerCommand>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let piece_count = manager.metadata.piece_count();
        let mut record = PeerRecord::new(addr, Direction::Outgoing, piece_count);
        record.state = ConnectionState::Active;
        for piece in 0..piece_count {
            record.bitfield.set(piece);
        }
        manager.picker.peer_bitfield(&record.bitfield);
        let blocks = manager.picker.select_requests(&record, 4);
        record.track_requests(&blocks);

        let (commands, rx) = mpsc::unbounded_channel();
        manager.peers.insert(PeerSlot {
            record,
            commands,
            task: tokio::spawn(async {}),
            permit: None,
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_two_peers_complete_download() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("scenario.bin", PIECE, 4 * PIECE as usize);
        let a = FakeSeeder::spawn(&torrent, &[0, 1, 2], SeederMode::Honest).await;
        let b = FakeSeeder::spawn(&torrent, &[1, 2, 3], SeederMode::Honest).await;

        let config = test_config(&dir.path().join("resume"));
        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config));
        handle.start().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().state, TorrentState::Downloading);
        handle.add_peers(vec![a.addr, b.addr]).await.unwrap();

        let done = wait_for(&handle, |s| s.state == TorrentState::Seeding).await;
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.pieces_complete, 4);
        assert!(done.downloaded >= 4 * PIECE);
        assert_eq!(done.files[0].progress, 1.0);
        assert!(!done.endgame);
        assert!(done.recent_events.len() <= 10);
        assert_eq!(done.recent_events.last().map(String::as_str), Some("State Downloading -> Seeding"));
        assert!(done.recent_events.iter().any(|e| e.starts_with("Piece ") && e.ends_with("hashed: pass")));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(saved_file(dir.path(), &torrent), torrent.data);
    }

    #[tokio::test]
    async fn test_restart_trusts_resume_data_within_file_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("resume.bin", PIECE, 4 * PIECE as usize);
        let seeder = FakeSeeder::spawn(&torrent, &[0, 1, 2, 3], SeederMode::Honest).await;
        let config = test_config(&dir.path().join("resume"));

        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config.clone()));
        handle.start().await.unwrap();
        handle.add_peers(vec![seeder.addr]).await.unwrap();
        wait_for(&handle, |s| s.state == TorrentState::Seeding).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        // untouched files: everything is trusted without rehashing
        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config.clone()));
        handle.start().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, TorrentState::Seeding);
        assert_eq!(snapshot.cache.bytes_read, 0);
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        // truncated file: pieces past the new end are downloaded again
        let path = dir.path().join("data").join("resume.bin");
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(2 * PIECE + 100).unwrap();
        drop(file);

        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config));
        handle.start().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, TorrentState::Downloading);
        assert_eq!(snapshot.pieces_complete, 2);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_data_is_rehashed_without_resume() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("existing.bin", PIECE, 3 * PIECE as usize);
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        torrent.write_to(&dir.path().join("data"));

        let config = test_config(&dir.path().join("resume"));
        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config));
        handle.start().await.unwrap();

        let snapshot = wait_for(&handle, |s| s.state == TorrentState::Seeding).await;
        assert_eq!(snapshot.pieces_complete, 3);
        assert_eq!(snapshot.cache.bytes_read, 3 * PIECE);
        assert_eq!(
            snapshot.recent_events,
            vec![
                "State Stopped -> Hashing",
                "Piece 0 hashed: pass",
                "Piece 1 hashed: pass",
                "Piece 2 hashed: pass",
                "State Hashing -> Seeding",
            ]
        );
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshots_are_answered_while_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("slow.bin", PIECE, 10 * PIECE as usize);
        let (handle, task) = TorrentManager::spawn(slow_params(&torrent, dir.path(), Duration::from_millis(200)));

        handle.start().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, TorrentState::Hashing);
        assert!(snapshot.pieces_complete < 10);
        // queued while hashing, dialled once it finishes
        handle.add_peers(vec![SocketAddr::from(([127, 0, 0, 1], 9))]).await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().state, TorrentState::Hashing);

        let done = wait_for(&handle, |s| s.state == TorrentState::Seeding).await;
        assert_eq!(done.pieces_complete, 10);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_hashing_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("interrupted.bin", PIECE, 10 * PIECE as usize);
        let (handle, task) = TorrentManager::spawn(slow_params(&torrent, dir.path(), Duration::from_millis(200)));

        handle.start().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().state, TorrentState::Hashing);
        handle.stop().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, TorrentState::Stopped);

        // results of the abandoned check must not complete pieces later
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.snapshot().await.unwrap().pieces_complete, snapshot.pieces_complete);
        let saved = std::fs::read_dir(dir.path().join("resume")).map(|d| d.count()).unwrap_or(0);
        assert_eq!(saved, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_aborts_connections_past_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("stuck.bin", PIECE, 2 * PIECE as usize);
        let seeder = FakeSeeder::spawn(&torrent, &[0, 1], SeederMode::Honest).await;

        let config = EngineConfig {
            stop_timeout_ms: 300,
            ..test_config(&dir.path().join("resume"))
        };
        let mut params = params(&torrent, dir.path(), config);
        // one byte per second parks the connection inside the limiter
        params.limiter = BandwidthLimiter::new(1, 0);
        let permits = params.permits.clone();
        let (handle, task) = TorrentManager::spawn(params);
        handle.start().await.unwrap();
        handle.add_peers(vec![seeder.addr]).await.unwrap();
        wait_for(&handle, |s| s.current_requests > 0).await;
        time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "stopped after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "stopped after {:?}", elapsed);
        assert_eq!(permits.available_permits(), 16);
    }

    #[tokio::test]
    async fn test_expired_requests_return_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("expiry.bin", PIECE, 2 * PIECE as usize);
        let config = EngineConfig {
            request_timeout_ms: 200,
            ..test_config(&dir.path().join("resume"))
        };
        let mut manager = idle_manager(&torrent, dir.path(), config);
        let (addr, mut commands) = busy_peer(&mut manager, 6881);
        assert_eq!(manager.picker.outstanding_requests(), 2);

        manager.expire_requests();
        assert_eq!(manager.picker.outstanding_requests(), 2);

        time::sleep(Duration::from_millis(250)).await;
        manager.expire_requests();
        assert_eq!(manager.picker.outstanding_requests(), 0);
        assert!(manager.peers.record(&addr).unwrap().outstanding.is_empty());
        let mut cancelled = 0;
        while let Ok(command) = commands.try_recv() {
            assert!(matches!(command, PeerCommand::Cancel(_)));
            cancelled += 1;
        }
        assert_eq!(cancelled, 2);

        // free for the next peer to pick up
        let (_other, _other_commands) = busy_peer(&mut manager, 6882);
        assert_eq!(manager.picker.outstanding_requests(), 2);
    }

    #[tokio::test]
    async fn test_error_releases_peer_requests() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("released.bin", PIECE, 2 * PIECE as usize);
        let mut manager = idle_manager(&torrent, dir.path(), test_config(&dir.path().join("resume")));
        let (addr, mut commands) = busy_peer(&mut manager, 6881);
        assert_eq!(manager.picker.availability(0), 1);

        manager.enter_error("disk gone".to_string());
        assert_eq!(manager.state, TorrentState::Error);
        assert!(manager.peers.record(&addr).is_none());
        assert_eq!(manager.picker.outstanding_requests(), 0);
        assert_eq!(manager.picker.availability(0), 0);
        assert_eq!(commands.try_recv().unwrap(), PeerCommand::Close(CloseReason::Shutdown));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.error.as_deref(), Some("disk gone"));
        assert_eq!(snapshot.recent_events.last().map(String::as_str), Some("State Stopped -> Error"));
    }

    #[tokio::test]
    async fn test_mismatched_peer_never_joins() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("mismatch.bin", PIECE, 2 * PIECE as usize);
        let impostor = FakeSeeder::spawn(&torrent, &[0, 1], SeederMode::WrongInfoHash).await;

        let config = test_config(&dir.path().join("resume"));
        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config));
        handle.start().await.unwrap();
        handle.add_peers(vec![impostor.addr]).await.unwrap();

        for _ in 0..10 {
            time::sleep(Duration::from_millis(30)).await;
            let snapshot = handle.snapshot().await.unwrap();
            assert!(snapshot.peers.is_empty());
            assert_eq!(snapshot.state, TorrentState::Downloading);
        }
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_peer_is_blacklisted() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("corrupt.bin", PIECE, 2 * PIECE as usize);
        let corrupt = FakeSeeder::spawn(&torrent, &[0, 1], SeederMode::Corrupt).await;
        let honest = FakeSeeder::spawn(&torrent, &[0, 1], SeederMode::Honest).await;

        let config = EngineConfig {
            bad_data_threshold: 0,
            ..test_config(&dir.path().join("resume"))
        };
        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), config));
        handle.start().await.unwrap();
        handle.add_peers(vec![corrupt.addr]).await.unwrap();

        // the first failed piece exceeds the threshold and drops the peer
        let snapshot = wait_for(&handle, |s| s.downloaded > 0 && s.peers.is_empty()).await;
        assert_eq!(snapshot.pieces_complete, 0);

        handle.add_peers(vec![corrupt.addr, honest.addr]).await.unwrap();
        let done = wait_for(&handle, |s| s.state == TorrentState::Seeding).await;
        assert!(done.peers.iter().all(|p| p.addr != corrupt.addr));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(saved_file(dir.path(), &torrent), torrent.data);
    }

    #[tokio::test]
    async fn test_disk_failure_enters_error_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("failing.bin", PIECE, PIECE as usize);
        let seeder = FakeSeeder::spawn(&torrent, &[0], SeederMode::Honest).await;

        let mut params = params(&torrent, dir.path(), test_config(&dir.path().join("resume")));
        params.backend = Arc::new(FailingBackend::default());
        let (handle, task) = TorrentManager::spawn(params);
        handle.start().await.unwrap();
        handle.add_peers(vec![seeder.addr]).await.unwrap();

        let failed = wait_for(&handle, |s| s.state == TorrentState::Error).await;
        assert!(failed.error.as_deref().unwrap().contains("disk unplugged"));

        // frozen at the moment of failure
        time::sleep(Duration::from_millis(100)).await;
        let later = handle.snapshot().await.unwrap();
        assert_eq!(later.downloaded, failed.downloaded);
        assert_eq!(later.error, failed.error);
        assert!(handle.start().await.is_err());

        handle.retry().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, TorrentState::Downloading);
        assert!(snapshot.error.is_none());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_announce_reports_for_unknown_tier_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("trackerless.bin", PIECE, PIECE as usize);
        let (handle, task) = TorrentManager::spawn(params(&torrent, dir.path(), test_config(&dir.path().join("resume"))));

        handle.report_announce(3, AnnounceOutcome::Announced).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.trackers.is_empty());
        assert_eq!(snapshot.state, TorrentState::Stopped);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
