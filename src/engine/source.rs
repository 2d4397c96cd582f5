//! Peer sources
//!
//! Discovery layers (trackers, DHT, local lists) hand addresses to the
//! engine through [`PeerSource`]. The engine only dials what it is given.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// An asynchronous feed of peer addresses
#[async_trait]
pub trait PeerSource: Send {
    /// Next batch of addresses, or `None` once the source is exhausted
    async fn next_batch(&mut self) -> Option<Vec<SocketAddr>>;
}

/// Waits for one address, then drains whatever else is already queued
#[async_trait]
impl PeerSource for mpsc::Receiver<SocketAddr> {
    async fn next_batch(&mut self) -> Option<Vec<SocketAddr>> {
        let first = self.recv().await?;
        let mut batch = vec![first];
        while let Ok(addr) = self.try_recv() {
            batch.push(addr);
        }
        Some(batch)
    }
}

/// A fixed list handed out once
#[derive(Debug, Clone)]
pub struct StaticPeers {
    addrs: Option<Vec<SocketAddr>>,
}

impl StaticPeers {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs: Some(addrs) }
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn next_batch(&mut self) -> Option<Vec<SocketAddr>> {
        self.addrs.take().filter(|addrs| !addrs.is_empty())
    }
}
