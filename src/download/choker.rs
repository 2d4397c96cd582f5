//! Choking algorithm
//!
//! Every rechoke round the fastest interested peers get the regular upload
//! slots and one more interested peer, chosen at random, gets an optimistic
//! slot. The optimistic peer is kept for a few rounds before rotating.

use std::collections::HashSet;
use std::net::SocketAddr;

use rand::seq::SliceRandom;
use tracing::debug;

/// Rounds an optimistic unchoke lasts
const OPTIMISTIC_ROUNDS: u32 = 3;

/// What the choker needs to know about a peer
#[derive(Debug, Clone)]
pub struct ChokeCandidate {
    pub addr: SocketAddr,
    /// Download rate while leeching, upload rate while seeding
    pub rate: f64,
    pub interested: bool,
    /// We are currently choking this peer
    pub choked: bool,
}

/// Changes to apply after a round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

#[derive(Debug)]
pub struct Choker {
    slots: usize,
    optimistic: Option<SocketAddr>,
    round: u32,
}

impl Choker {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            optimistic: None,
            round: 0,
        }
    }

    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    pub fn rechoke(&mut self, peers: &[ChokeCandidate]) -> ChokeDecision {
        self.round += 1;

        let mut interested: Vec<&ChokeCandidate> = peers.iter().filter(|p| p.interested).collect();
        interested.sort_by(|a, b| b.rate.total_cmp(&a.rate).then(a.addr.cmp(&b.addr)));

        let mut unchoked: HashSet<SocketAddr> = interested.iter().take(self.slots).map(|p| p.addr).collect();
        let rest: Vec<SocketAddr> = interested
            .iter()
            .map(|p| p.addr)
            .filter(|addr| !unchoked.contains(addr))
            .collect();

        let keep = self.round % OPTIMISTIC_ROUNDS != 1
            && self.optimistic.is_some_and(|addr| rest.contains(&addr));
        if !keep {
            self.optimistic = rest.choose(&mut rand::thread_rng()).copied();
            if let Some(addr) = self.optimistic {
                debug!("Optimistic unchoke: {}", addr);
            }
        }
        if let Some(addr) = self.optimistic {
            unchoked.insert(addr);
        }

        let mut decision = ChokeDecision::default();
        for peer in peers {
            match (unchoked.contains(&peer.addr), peer.choked) {
                (true, true) => decision.unchoke.push(peer.addr),
                (false, false) => decision.choke.push(peer.addr),
                _ => {}
            }
        }
        decision
    }
}
