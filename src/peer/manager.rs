//! Peer manager module
//!
//! The torrent actor's registry of peers: addresses waiting to be dialled,
//! live connections with their records and command channels, and the
//! temporary blacklist of misbehaving peers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::peer::event::{CommandSender, PeerCommand};
use crate::peer::state::{ConnectionState, PeerRecord};

/// A live connection owned by the torrent
#[derive(Debug)]
pub struct PeerSlot {
    pub record: PeerRecord,
    pub commands: CommandSender,
    pub task: JoinHandle<()>,
    /// Engine-wide connection permit, released when the slot is dropped
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Manages the peers of one torrent
#[derive(Debug)]
pub struct PeerManager {
    candidates: VecDeque<SocketAddr>,
    queued: HashSet<SocketAddr>,
    slots: HashMap<SocketAddr, PeerSlot>,
    blacklist: HashMap<SocketAddr, Instant>,
    /// Bad-data counters and when each last grew, kept across reconnects
    strikes: HashMap<SocketAddr, (u32, Instant)>,
    max_connections: usize,
    cooldown: Duration,
}

impl PeerManager {
    pub fn new(max_connections: usize, cooldown: Duration) -> Self {
        debug!("Creating peer manager with max_connections: {}", max_connections);
        Self {
            candidates: VecDeque::new(),
            queued: HashSet::new(),
            slots: HashMap::new(),
            blacklist: HashMap::new(),
            strikes: HashMap::new(),
            max_connections,
            cooldown,
        }
    }

    /// Queue addresses to dial; returns how many were new
    pub fn add_candidates(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let mut added = 0;
        for addr in addrs {
            if self.queued.contains(&addr) || self.slots.contains_key(&addr) || self.is_blacklisted(&addr) {
                trace!("Skipping candidate {}", addr);
                continue;
            }
            self.queued.insert(addr);
            self.candidates.push_back(addr);
            added += 1;
        }
        if added > 0 {
            debug!("Added {} peer candidates (queued: {})", added, self.candidates.len());
        }
        added
    }

    /// Next address worth dialling
    pub fn next_candidate(&mut self) -> Option<SocketAddr> {
        while let Some(addr) = self.candidates.pop_front() {
            self.queued.remove(&addr);
            if !self.slots.contains_key(&addr) && !self.is_blacklisted(&addr) {
                return Some(addr);
            }
        }
        None
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn can_add_connection(&self) -> bool {
        self.slots.len() < self.max_connections
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.slots.contains_key(addr)
    }

    pub fn insert(&mut self, mut slot: PeerSlot) {
        let addr = slot.record.addr;
        slot.record.bad_data = self.strikes.get(&addr).map(|(count, _)| *count).unwrap_or(0);
        self.queued.remove(&addr);
        self.slots.insert(addr, slot);
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<PeerSlot> {
        self.slots.remove(addr)
    }

    pub fn record(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.slots.get(addr).map(|slot| &slot.record)
    }

    pub fn record_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerRecord> {
        self.slots.get_mut(addr).map(|slot| &mut slot.record)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.slots.values().map(|slot| &slot.record)
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.slots.values_mut().map(|slot| &mut slot.record)
    }

    /// Peers whose handshake completed
    pub fn active_addrs(&self) -> Vec<SocketAddr> {
        self.slots
            .values()
            .filter(|slot| slot.record.state == ConnectionState::Active)
            .map(|slot| slot.record.addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Send a command to one peer; false if it is gone
    pub fn send(&self, addr: &SocketAddr, command: PeerCommand) -> bool {
        match self.slots.get(addr) {
            Some(slot) => slot.commands.send(command).is_ok(),
            None => false,
        }
    }

    /// Send a command to every active peer
    pub fn broadcast(&self, command: PeerCommand) {
        for slot in self.slots.values() {
            if slot.record.state == ConnectionState::Active {
                let _ = slot.commands.send(command.clone());
            }
        }
    }

    /// Count one failed piece against a peer; returns its new total
    pub fn add_strike(&mut self, addr: SocketAddr) -> u32 {
        let entry = self.strikes.entry(addr).or_insert((0, Instant::now()));
        entry.0 += 1;
        entry.1 = Instant::now();
        let count = entry.0;
        if let Some(slot) = self.slots.get_mut(&addr) {
            slot.record.bad_data = count;
        }
        count
    }

    /// Refuse this address until the cooldown passes
    pub fn blacklist(&mut self, addr: SocketAddr) {
        info!("Blacklisting peer {} for {:?}", addr, self.cooldown);
        self.blacklist.insert(addr, Instant::now() + self.cooldown);
    }

    pub fn is_blacklisted(&self, addr: &SocketAddr) -> bool {
        matches!(self.blacklist.get(addr), Some(until) if Instant::now() < *until)
    }

    /// Forget blacklist entries whose cooldown passed
    ///
    /// Strikes of peers that are not connected go with them once the
    /// cooldown has passed since the last strike.
    pub fn prune_blacklist(&mut self) {
        let now = Instant::now();
        self.blacklist.retain(|_, until| now < *until);

        let cooldown = self.cooldown;
        let before = self.strikes.len();
        let slots = &self.slots;
        let blacklist = &self.blacklist;
        self.strikes.retain(|addr, (_, last)| {
            slots.contains_key(addr) || blacklist.contains_key(addr) || now.duration_since(*last) < cooldown
        });
        if self.strikes.len() < before {
            trace!("Forgot bad-data strikes of {} peers", before - self.strikes.len());
        }
    }

    /// Take every slot out, for shutdown
    pub fn drain(&mut self) -> Vec<PeerSlot> {
        self.candidates.clear();
        self.queued.clear();
        self.slots.drain().map(|(_, slot)| slot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::state::Direction;
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn slot(port: u16) -> (PeerSlot, mpsc::UnboundedReceiver<PeerCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let slot = PeerSlot {
            record: PeerRecord::new(addr(port), Direction::Outgoing, 4),
            commands,
            task: tokio::spawn(async {}),
            permit: None,
        };
        (slot, rx)
    }

    #[test]
    fn test_candidates_are_deduplicated() {
        let mut manager = PeerManager::new(10, Duration::from_secs(60));
        assert_eq!(manager.add_candidates([addr(1), addr(2), addr(1)]), 2);
        assert_eq!(manager.add_candidates([addr(2)]), 0);
        assert_eq!(manager.next_candidate(), Some(addr(1)));
        assert_eq!(manager.next_candidate(), Some(addr(2)));
        assert_eq!(manager.next_candidate(), None);
        // dialled addresses can be queued again
        assert_eq!(manager.add_candidates([addr(1)]), 1);
    }

    #[test]
    fn test_blacklist_blocks_and_expires() {
        let mut manager = PeerManager::new(10, Duration::from_millis(30));
        manager.blacklist(addr(5));
        assert!(manager.is_blacklisted(&addr(5)));
        assert_eq!(manager.add_candidates([addr(5)]), 0);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!manager.is_blacklisted(&addr(5)));
        manager.prune_blacklist();
        assert_eq!(manager.add_candidates([addr(5)]), 1);
    }

    #[tokio::test]
    async fn test_strikes_expire_with_cooldown() {
        let mut manager = PeerManager::new(10, Duration::from_millis(30));
        let (connected, _rx) = slot(1);
        manager.insert(connected);
        manager.add_strike(addr(1));
        manager.add_strike(addr(2));
        manager.blacklist(addr(2));
        manager.add_strike(addr(3));
        manager.prune_blacklist();
        assert_eq!(manager.add_strike(addr(3)), 2);

        std::thread::sleep(Duration::from_millis(50));
        manager.prune_blacklist();
        // only the connected peer keeps its record
        assert_eq!(manager.add_strike(addr(1)), 2);
        assert_eq!(manager.add_strike(addr(2)), 1);
        assert_eq!(manager.add_strike(addr(3)), 1);
    }

    #[tokio::test]
    async fn test_capacity_and_broadcast() {
        let mut manager = PeerManager::new(2, Duration::from_secs(60));
        let (mut first, mut first_rx) = slot(1);
        first.record.state = ConnectionState::Active;
        let (second, mut second_rx) = slot(2);
        manager.insert(first);
        manager.insert(second);
        assert!(!manager.can_add_connection());
        assert_eq!(manager.active_addrs(), vec![addr(1)]);

        manager.broadcast(PeerCommand::Have(3));
        assert_eq!(first_rx.try_recv().unwrap(), PeerCommand::Have(3));
        assert!(second_rx.try_recv().is_err());

        assert!(manager.send(&addr(2), PeerCommand::Choke));
        assert_eq!(second_rx.try_recv().unwrap(), PeerCommand::Choke);

        assert_eq!(manager.add_strike(addr(2)), 1);
        assert_eq!(manager.add_strike(addr(2)), 2);
        assert_eq!(manager.record(&addr(2)).unwrap().bad_data, 2);

        assert!(manager.remove(&addr(1)).is_some());
        assert!(manager.can_add_connection());
        assert!(!manager.send(&addr(1), PeerCommand::Choke));
        assert_eq!(manager.drain().len(), 1);
        assert!(manager.is_empty());
    }
}
