//! Torrent handle
//!
//! Commands accepted by a torrent actor and the cloneable handle used to
//! send them.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};

use crate::error::TorrentError;
use crate::protocol::Handshake;
use crate::stats::{AnnounceOutcome, TorrentSnapshot};
use crate::torrent::InfoHash;

/// Requests handled by a torrent actor
#[derive(Debug)]
pub enum TorrentCommand {
    /// Check existing data, then begin downloading or seeding
    Start {
        responder: oneshot::Sender<Result<()>>,
    },
    /// Persist state and close every connection
    Stop {
        responder: oneshot::Sender<Result<()>>,
    },
    /// Leave the Error state by starting again
    Retry {
        responder: oneshot::Sender<Result<()>>,
    },
    AddPeers {
        addrs: Vec<SocketAddr>,
    },
    /// A connection accepted by the listener for this torrent
    Incoming {
        stream: TcpStream,
        handshake: Handshake,
        permit: OwnedSemaphorePermit,
    },
    Snapshot {
        responder: oneshot::Sender<TorrentSnapshot>,
    },
    ReportAnnounce {
        tier: usize,
        outcome: AnnounceOutcome,
    },
    /// Stop and end the actor
    Shutdown {
        responder: oneshot::Sender<Result<()>>,
    },
}

/// Handle for talking to one torrent actor
#[derive(Debug, Clone)]
pub struct TorrentHandle {
    info_hash: InfoHash,
    sender: mpsc::Sender<TorrentCommand>,
}

impl TorrentHandle {
    pub fn new(info_hash: InfoHash, sender: mpsc::Sender<TorrentCommand>) -> Self {
        Self { info_hash, sender }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub async fn start(&self) -> Result<()> {
        self.request(|responder| TorrentCommand::Start { responder }).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|responder| TorrentCommand::Stop { responder }).await?
    }

    pub async fn retry(&self) -> Result<()> {
        self.request(|responder| TorrentCommand::Retry { responder }).await?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| TorrentCommand::Shutdown { responder }).await?
    }

    pub async fn snapshot(&self) -> Result<TorrentSnapshot> {
        self.request(|responder| TorrentCommand::Snapshot { responder }).await
    }

    pub async fn add_peers(&self, addrs: Vec<SocketAddr>) -> Result<()> {
        self.send(TorrentCommand::AddPeers { addrs }).await
    }

    pub async fn report_announce(&self, tier: usize, outcome: AnnounceOutcome) -> Result<()> {
        self.send(TorrentCommand::ReportAnnounce { tier, outcome }).await
    }

    /// Hand over an accepted connection together with its connection permit
    pub async fn incoming(&self, stream: TcpStream, handshake: Handshake, permit: OwnedSemaphorePermit) -> Result<()> {
        self.send(TorrentCommand::Incoming {
            stream,
            handshake,
            permit,
        })
        .await
    }

    async fn send(&self, command: TorrentCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| TorrentError::EngineShutdown.into())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> TorrentCommand) -> Result<T> {
        let (responder, rx) = oneshot::channel();
        self.send(build(responder)).await?;
        rx.await.map_err(|_| TorrentError::EngineShutdown.into())
    }
}
