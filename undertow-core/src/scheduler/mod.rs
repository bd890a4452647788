//! Streaming-aware block selection.
//!
//! Blends the playback cursor's urgent window with rarest-first selection
//! over the rest of the torrent. Selection runs under a short lock; callers
//! do network and disk work outside it.

mod plan;

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use self::plan::{InFlight, PiecePlan};
use crate::playback::UrgentWindow;
use crate::torrent::{BLOCK_SIZE, PieceBitmap, PieceIndex, TorrentDescriptor};

/// Maximum outstanding block requests per peer unless configured otherwise.
pub const DEFAULT_PIPELINE_DEPTH: usize = 10;

/// A block to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

/// A request that exceeded its deadline and went back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredRequest {
    pub peer: SocketAddr,
    pub request: BlockRequest,
}

#[derive(Debug)]
struct SchedulerState {
    /// Peers known to advertise each piece
    rarity: Vec<u32>,
    verified: PieceBitmap,
    plans: HashMap<u32, PiecePlan>,
    load: HashMap<SocketAddr, usize>,
    /// Pieces treated as urgent regardless of the playback window
    priority: BTreeSet<u32>,
}

impl SchedulerState {
    fn unload(&mut self, peer: SocketAddr) {
        if let Some(count) = self.load.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }
    }

    fn has_open(&self, piece: u32) -> bool {
        self.plans.get(&piece).is_none_or(PiecePlan::has_open)
    }
}

/// Per-torrent piece scheduler.
#[derive(Debug)]
pub struct PieceScheduler {
    descriptor: Arc<TorrentDescriptor>,
    pipeline_depth: usize,
    request_timeout: Duration,
    state: Mutex<SchedulerState>,
}

impl PieceScheduler {
    /// Creates a scheduler; pieces already set in `verified` are never
    /// requested.
    pub fn new(
        descriptor: Arc<TorrentDescriptor>,
        verified: PieceBitmap,
        pipeline_depth: usize,
        request_timeout: Duration,
    ) -> Self {
        let piece_count = descriptor.piece_count() as usize;
        Self {
            descriptor,
            pipeline_depth: pipeline_depth.max(1),
            request_timeout,
            state: Mutex::new(SchedulerState {
                rarity: vec![0; piece_count],
                verified,
                plans: HashMap::new(),
                load: HashMap::new(),
                priority: BTreeSet::new(),
            }),
        }
    }

    /// Counts a newly received peer bitfield.
    pub fn add_peer(&self, bitmap: &PieceBitmap) {
        let mut state = self.state.lock();
        for piece in bitmap.iter_set() {
            if let Some(count) = state.rarity.get_mut(piece.as_usize()) {
                *count += 1;
            }
        }
    }

    /// Counts a `Have` announcement.
    pub fn peer_have(&self, piece: PieceIndex) {
        if let Some(count) = self.state.lock().rarity.get_mut(piece.as_usize()) {
            *count += 1;
        }
    }

    /// Forgets a disconnected peer; returns how many requests went back to
    /// the pool.
    pub fn remove_peer(&self, peer: SocketAddr, bitmap: &PieceBitmap) -> usize {
        {
            let mut state = self.state.lock();
            for piece in bitmap.iter_set() {
                if let Some(count) = state.rarity.get_mut(piece.as_usize()) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        self.release_peer(peer)
    }

    /// Returns every block in flight to `peer` to the pool.
    pub fn release_peer(&self, peer: SocketAddr) -> usize {
        let mut state = self.state.lock();
        let released: usize = state
            .plans
            .values_mut()
            .map(|plan| plan.release_peer(peer))
            .sum();
        state.load.remove(&peer);
        if released > 0 {
            tracing::debug!("release_peer: peer={peer} released={released}");
        }
        released
    }

    pub fn rarity(&self, piece: PieceIndex) -> u32 {
        self.state
            .lock()
            .rarity
            .get(piece.as_usize())
            .copied()
            .unwrap_or(0)
    }

    /// Outstanding requests held by `peer`.
    pub fn outstanding(&self, peer: SocketAddr) -> usize {
        self.state.lock().load.get(&peer).copied().unwrap_or(0)
    }

    /// Outstanding requests across all peers.
    pub fn in_flight(&self) -> usize {
        self.state.lock().load.values().sum()
    }

    /// Marks the last `count` pieces of the selected file urgent.
    ///
    /// Media containers often keep their index at the end of the file, so
    /// players read it before starting playback.
    pub fn prioritize_tail(&self, count: u32) -> Vec<u32> {
        let file = self.descriptor.selected_file();
        let Some(pieces) = self
            .descriptor
            .pieces_for_range(file.offset, file.end())
            .filter(|_| count > 0)
        else {
            return Vec::new();
        };
        let last = *pieces.end();
        let first = last.saturating_sub(count - 1).max(*pieces.start());

        let mut state = self.state.lock();
        let tail: Vec<u32> = (first..=last)
            .filter(|&piece| !state.verified.has(PieceIndex::new(piece)))
            .collect();
        state.priority.extend(tail.iter().copied());
        tail
    }

    /// Picks the next block to request from `peer`.
    ///
    /// Urgent pieces come first by index, then the rarest missing piece the
    /// peer has (ties to the lowest index). A block already in flight is
    /// requested again only for urgent pieces.
    pub fn next_request(
        &self,
        peer: SocketAddr,
        peer_bitmap: &PieceBitmap,
        window: Option<&UrgentWindow>,
        now: Instant,
    ) -> Option<BlockRequest> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.load.get(&peer).copied().unwrap_or(0) >= self.pipeline_depth {
            return None;
        }

        let wanted = |verified: &PieceBitmap, piece: u32| {
            let index = PieceIndex::new(piece);
            !verified.has(index) && peer_bitmap.has(index)
        };
        let in_window = |piece: u32| window.is_some_and(|window| window.contains(piece));

        let mut urgent: Vec<u32> = window
            .map(|window| window.pieces.clone().collect())
            .unwrap_or_default();
        urgent.extend(state.priority.iter().copied().filter(|&piece| !in_window(piece)));
        urgent.retain(|&piece| wanted(&state.verified, piece));
        let stalled = window.is_some_and(|window| window.stalled);

        for &piece in &urgent {
            if let Some(slot) = self.open_slot(state, piece) {
                return self.assign(state, peer, piece, slot, now);
            }
            if stalled && let Some(slot) = duplicate_slot(state, piece, peer) {
                return self.assign(state, peer, piece, slot, now);
            }
        }
        for &piece in &urgent {
            if let Some(slot) = duplicate_slot(state, piece, peer) {
                return self.assign(state, peer, piece, slot, now);
            }
        }

        let rarest = (0..self.descriptor.piece_count())
            .filter(|&piece| {
                !in_window(piece)
                    && !state.priority.contains(&piece)
                    && wanted(&state.verified, piece)
                    && state.has_open(piece)
            })
            .min_by_key(|&piece| (state.rarity[piece as usize], piece))?;
        let slot = self.open_slot(state, rarest)?;
        self.assign(state, peer, rarest, slot, now)
    }

    /// Records a received block. Returns the other peers that had the same
    /// block in flight, so their requests can be cancelled.
    pub fn block_received(&self, peer: SocketAddr, piece: PieceIndex, offset: u32) -> Vec<SocketAddr> {
        let mut state = self.state.lock();
        let Some(plan) = state.plans.get_mut(&piece.as_u32()) else {
            return Vec::new();
        };
        let holders = plan.receive(offset / BLOCK_SIZE);
        for &holder in &holders {
            state.unload(holder);
        }
        holders.into_iter().filter(|&holder| holder != peer).collect()
    }

    /// Drops a verified piece from selection.
    pub fn piece_verified(&self, piece: PieceIndex) {
        let mut state = self.state.lock();
        state.verified.set(piece);
        state.priority.remove(&piece.as_u32());
        if let Some(plan) = state.plans.remove(&piece.as_u32()) {
            for holder in plan.in_flight_peers() {
                state.unload(holder);
            }
        }
    }

    /// Requeues every block of a piece that failed its hash check.
    pub fn piece_failed(&self, piece: PieceIndex) {
        let mut state = self.state.lock();
        if let Some(plan) = state.plans.remove(&piece.as_u32()) {
            for holder in plan.in_flight_peers() {
                state.unload(holder);
            }
        }
        tracing::debug!("piece_failed: piece={piece} requeued");
    }

    /// Returns timed-out requests to the pool.
    pub fn expire_requests(&self, now: Instant) -> Vec<ExpiredRequest> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        for (&piece, plan) in &mut state.plans {
            for (slot, peer) in plan.expire(now) {
                let offset = slot * BLOCK_SIZE;
                let index = PieceIndex::new(piece);
                let length = self.descriptor.block_length(index, offset).unwrap_or(0);
                expired.push(ExpiredRequest {
                    peer,
                    request: BlockRequest {
                        piece: index,
                        offset,
                        length,
                    },
                });
            }
        }
        for entry in &expired {
            state.unload(entry.peer);
        }
        expired
    }

    fn open_slot(&self, state: &mut SchedulerState, piece: u32) -> Option<u32> {
        let block_count = self.descriptor.block_count(PieceIndex::new(piece));
        state
            .plans
            .entry(piece)
            .or_insert_with(|| PiecePlan::new(block_count))
            .first_open()
    }

    fn assign(
        &self,
        state: &mut SchedulerState,
        peer: SocketAddr,
        piece: u32,
        slot: u32,
        now: Instant,
    ) -> Option<BlockRequest> {
        let index = PieceIndex::new(piece);
        let offset = slot * BLOCK_SIZE;
        let length = self.descriptor.block_length(index, offset)?;
        state.plans.get_mut(&piece)?.assign(
            slot,
            InFlight {
                peer,
                deadline: now + self.request_timeout,
            },
        );
        *state.load.entry(peer).or_insert(0) += 1;
        Some(BlockRequest {
            piece: index,
            offset,
            length,
        })
    }
}

fn duplicate_slot(state: &SchedulerState, piece: u32, peer: SocketAddr) -> Option<u32> {
    state.plans.get(&piece)?.first_duplicate(peer)
}
