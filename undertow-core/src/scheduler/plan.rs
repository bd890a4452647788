//! Block-level request tracking for a single piece.

use std::net::SocketAddr;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(super) struct InFlight {
    pub peer: SocketAddr,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
enum BlockSlot {
    Open,
    /// Requested from one or more peers; more than one only inside the
    /// urgent window
    InFlight(Vec<InFlight>),
    Received,
}

/// Request state of every block of a piece being downloaded.
#[derive(Debug)]
pub(super) struct PiecePlan {
    slots: Vec<BlockSlot>,
}

impl PiecePlan {
    pub fn new(block_count: u32) -> Self {
        Self {
            slots: vec![BlockSlot::Open; block_count as usize],
        }
    }

    pub fn first_open(&self) -> Option<u32> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, BlockSlot::Open))
            .map(|slot| slot as u32)
    }

    /// First in-flight block that `peer` is not already fetching.
    pub fn first_duplicate(&self, peer: SocketAddr) -> Option<u32> {
        self.slots
            .iter()
            .position(|slot| match slot {
                BlockSlot::InFlight(holders) => holders.iter().all(|held| held.peer != peer),
                _ => false,
            })
            .map(|slot| slot as u32)
    }

    pub fn has_open(&self) -> bool {
        self.first_open().is_some()
    }

    pub fn assign(&mut self, slot: u32, in_flight: InFlight) {
        let Some(entry) = self.slots.get_mut(slot as usize) else {
            return;
        };
        match entry {
            BlockSlot::InFlight(holders) => holders.push(in_flight),
            BlockSlot::Open => *entry = BlockSlot::InFlight(vec![in_flight]),
            BlockSlot::Received => {}
        }
    }

    /// Marks a block received and returns every peer that had it in flight.
    pub fn receive(&mut self, slot: u32) -> Vec<SocketAddr> {
        let Some(entry) = self.slots.get_mut(slot as usize) else {
            return Vec::new();
        };
        let previous = std::mem::replace(entry, BlockSlot::Received);
        match previous {
            BlockSlot::InFlight(holders) => holders.into_iter().map(|held| held.peer).collect(),
            BlockSlot::Open | BlockSlot::Received => Vec::new(),
        }
    }

    /// Drops the peer's requests; returns how many were removed.
    pub fn release_peer(&mut self, peer: SocketAddr) -> usize {
        let mut released = 0;
        for slot in &mut self.slots {
            if let BlockSlot::InFlight(holders) = slot {
                let before = holders.len();
                holders.retain(|held| held.peer != peer);
                released += before - holders.len();
                if holders.is_empty() {
                    *slot = BlockSlot::Open;
                }
            }
        }
        released
    }

    /// Removes requests past their deadline and reopens orphaned blocks.
    pub fn expire(&mut self, now: Instant) -> Vec<(u32, SocketAddr)> {
        let mut expired = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let BlockSlot::InFlight(holders) = slot {
                holders.retain(|held| {
                    if held.deadline <= now {
                        expired.push((index as u32, held.peer));
                        false
                    } else {
                        true
                    }
                });
                if holders.is_empty() {
                    *slot = BlockSlot::Open;
                }
            }
        }
        expired
    }

    /// Peers still holding requests for this piece, one entry per request.
    pub fn in_flight_peers(&self) -> Vec<SocketAddr> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                BlockSlot::InFlight(holders) => Some(holders.iter().map(|held| held.peer)),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_plan_assign_then_receive_returns_holders() {
        let now = Instant::now();
        let mut plan = PiecePlan::new(2);
        plan.assign(0, InFlight { peer: peer(1), deadline: now });
        plan.assign(0, InFlight { peer: peer(2), deadline: now });

        assert_eq!(plan.first_open(), Some(1));
        assert_eq!(plan.first_duplicate(peer(1)), None);
        assert_eq!(plan.first_duplicate(peer(3)), Some(0));
        assert_eq!(plan.receive(0), vec![peer(1), peer(2)]);
        assert!(plan.receive(0).is_empty());
    }

    #[test]
    fn test_plan_expire_reopens_block() {
        let now = Instant::now();
        let mut plan = PiecePlan::new(2);
        plan.assign(0, InFlight { peer: peer(1), deadline: now });
        plan.assign(1, InFlight { peer: peer(1), deadline: now + Duration::from_secs(5) });

        assert_eq!(plan.expire(now), vec![(0, peer(1))]);
        assert_eq!(plan.first_open(), Some(0));
        assert_eq!(plan.in_flight_peers(), vec![peer(1)]);
    }

    #[test]
    fn test_plan_release_peer_keeps_other_holders() {
        let now = Instant::now();
        let mut plan = PiecePlan::new(1);
        plan.assign(0, InFlight { peer: peer(1), deadline: now });
        plan.assign(0, InFlight { peer: peer(2), deadline: now });

        assert_eq!(plan.release_peer(peer(1)), 1);
        assert!(!plan.has_open());
        assert_eq!(plan.release_peer(peer(2)), 1);
        assert!(plan.has_open());
    }
}
