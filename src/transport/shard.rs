//! Which connection serves which shard, and what each shard last received.

use std::sync::Mutex;

use crate::protocol::{DistMsgType, Frame, SplitInfo};

/// Rejects data frames that a retry delivered twice. Keyed by split index, ordered by
/// `(ticket, seq)`; unsequenced frames always pass.
#[derive(Debug, Default)]
pub struct Dedup {
    last: Vec<Option<(u64, u32)>>,
}

impl Dedup {
    pub fn accept(&mut self, frame: &Frame) -> bool {
        if frame.seq == 0 {
            return true;
        }
        let idx = usize::from(frame.split.split_idx);
        if self.last.len() <= idx {
            self.last.resize(idx + 1, None);
        }
        let key = (frame.ticket, frame.seq);
        match self.last[idx] {
            Some(prev) if key <= prev => false,
            _ => {
                self.last[idx] = Some(key);
                true
            }
        }
    }

    pub fn reset(&mut self, split_idx: u16) {
        if let Some(slot) = self.last.get_mut(usize::from(split_idx)) {
            *slot = None;
        }
    }

    pub fn reset_all(&mut self) {
        self.last.clear();
    }
}

#[derive(Debug, Default)]
struct ShardEntry {
    /// Most recent pass-graph frame addressed to this shard.
    latest: Option<Frame>,
    owner: Option<usize>,
    /// A frame whose write failed, sent first by the next bound writer.
    stash: Option<Frame>,
    acked: Option<u64>,
}

#[derive(Debug, Default)]
struct ShardState {
    shards: Vec<ShardEntry>,
    dedup: Dedup,
}

impl ShardState {
    fn entry(&mut self, split_idx: u16) -> &mut ShardEntry {
        let idx = usize::from(split_idx);
        if self.shards.len() <= idx {
            self.shards.resize_with(idx + 1, ShardEntry::default);
        }
        &mut self.shards[idx]
    }
}

/// Where a pass-graph frame popped by a writer should go.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    /// Write it on this connection, which now owns the shard.
    Here,
    /// Another live connection owns the shard.
    Forward(usize),
    /// This connection serves a different shard and nobody owns the target; the frame
    /// stays cached for the next follower that claims the shard.
    Park,
}

/// Authority-side shard bookkeeping, shared by every connection thread.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    state: Mutex<ShardState>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ShardState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Caches a popped pass-graph frame and decides which connection writes it.
    pub fn route_graph(&self, conn: usize, frame: &Frame) -> Route {
        debug_assert_eq!(frame.kind, DistMsgType::PassGraph);
        let idx = frame.split.split_idx;
        self.with(|s| {
            let bound_here = s.shards.iter().position(|e| e.owner == Some(conn));
            let entry = s.entry(idx);
            entry.latest = Some(frame.clone());
            match entry.owner {
                Some(owner) if owner == conn => Route::Here,
                Some(owner) => Route::Forward(owner),
                None if bound_here.is_none() => {
                    entry.owner = Some(conn);
                    Route::Here
                }
                None => Route::Park,
            }
        })
    }

    pub fn split_of(&self, conn: usize) -> Option<u16> {
        self.with(|s| {
            s.shards
                .iter()
                .position(|e| e.owner == Some(conn))
                .map(|i| i as u16)
        })
    }

    pub fn owner(&self, split_idx: u16) -> Option<usize> {
        self.with(|s| s.shards.get(usize::from(split_idx)).and_then(|e| e.owner))
    }

    /// Unbinds every shard `conn` owned. The shards keep their cached graphs.
    pub fn release(&self, conn: usize) -> Vec<u16> {
        self.with(|s| {
            let mut orphaned = Vec::new();
            for (i, e) in s.shards.iter_mut().enumerate() {
                if e.owner == Some(conn) {
                    e.owner = None;
                    orphaned.push(i as u16);
                }
            }
            orphaned
        })
    }

    /// Handles a follower's HELLO. `known` is the ticket and split of the last graph
    /// the follower applied (`split_cnt == 0` when it has none). Returns the shard the
    /// connection now serves and the graph to replay, if the follower is behind.
    pub fn hello(&self, conn: usize, ticket: u64, known: SplitInfo) -> Option<(u16, Option<Frame>)> {
        self.with(|s| {
            let claimed = if known.split_cnt > 0 && known.is_valid() {
                let entry = s.entry(known.split_idx);
                match entry.owner {
                    Some(owner) if owner != conn => None,
                    _ => Some(known.split_idx),
                }
            } else {
                // Already bound by its writer: keep that shard, nothing to replay.
                if let Some(owned) = s.shards.iter().position(|e| e.owner == Some(conn)) {
                    return Some((owned as u16, None));
                }
                s.shards
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, e)| e.owner.is_none() && e.latest.is_some())
                    .map(|(i, _)| i as u16)
            };

            let idx = claimed?;
            // One shard per connection: a claim replaces anything adopted before HELLO.
            for (i, e) in s.shards.iter_mut().enumerate() {
                if i != usize::from(idx) && e.owner == Some(conn) {
                    e.owner = None;
                }
            }
            s.dedup.reset(idx);
            let fresh = known.split_cnt == 0;
            let entry = s.entry(idx);
            entry.owner = Some(conn);
            let replay = entry
                .latest
                .as_ref()
                .filter(|g| fresh || g.ticket > ticket)
                .cloned();
            Some((idx, replay))
        })
    }

    /// Binds an idle connection to the lowest shard that has a cached graph but no
    /// owner, and returns that graph for it to send.
    pub fn adopt_orphan(&self, conn: usize) -> Option<(u16, Frame)> {
        self.with(|s| {
            if s.shards.iter().any(|e| e.owner == Some(conn)) {
                return None;
            }
            let idx = s
                .shards
                .iter()
                .enumerate()
                .skip(1)
                .position(|(_, e)| e.owner.is_none() && e.latest.is_some())?
                + 1;
            let graph = s.shards[idx].latest.clone()?;
            s.shards[idx].owner = Some(conn);
            s.dedup.reset(idx as u16);
            Some((idx as u16, graph))
        })
    }

    pub fn accept_data(&self, frame: &Frame) -> bool {
        self.with(|s| s.dedup.accept(frame))
    }

    pub fn record_ack(&self, split_idx: u16, ticket: u64) {
        self.with(|s| s.entry(split_idx).acked = Some(ticket));
    }

    pub fn acked(&self, split_idx: u16) -> Option<u64> {
        self.with(|s| s.shards.get(usize::from(split_idx)).and_then(|e| e.acked))
    }

    pub fn stash(&self, frame: Frame) {
        self.with(|s| {
            let entry = s.entry(frame.split.split_idx);
            if let Some(old) = entry.stash.replace(frame) {
                log::warn!(
                    "[transport] stash for split {} replaced, ticket {} lost",
                    old.split.split_idx,
                    old.ticket
                );
            }
        });
    }

    pub fn take_stash(&self, split_idx: u16) -> Option<Frame> {
        self.with(|s| s.shards.get_mut(usize::from(split_idx))?.stash.take())
    }

    pub fn latest(&self, split_idx: u16) -> Option<Frame> {
        self.with(|s| s.shards.get(usize::from(split_idx))?.latest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(ticket: u64, idx: u16) -> Frame {
        Frame::new(DistMsgType::PassGraph, ticket, SplitInfo::new(3, idx), vec![])
    }

    fn data(ticket: u64, idx: u16, seq: u32) -> Frame {
        Frame::new(DistMsgType::PassData, ticket, SplitInfo::new(3, idx), vec![]).with_seq(seq)
    }

    #[test]
    fn dedup_drops_replayed_seq() {
        let mut d = Dedup::default();
        assert!(d.accept(&data(1, 1, 5)));
        assert!(!d.accept(&data(1, 1, 5)));
        assert!(!d.accept(&data(1, 1, 4)));
        assert!(d.accept(&data(1, 2, 4)));
        assert!(d.accept(&data(2, 1, 1)));
        assert!(d.accept(&data(2, 1, 0)));
        assert!(d.accept(&data(2, 1, 0)));
        d.reset(1);
        assert!(d.accept(&data(1, 1, 5)));
    }

    #[test]
    fn first_writer_binds_others_forward_or_park() {
        let reg = ShardRegistry::new();
        assert_eq!(reg.route_graph(0, &graph(1, 2)), Route::Here);
        assert_eq!(reg.route_graph(1, &graph(1, 2)), Route::Forward(0));
        assert_eq!(reg.route_graph(0, &graph(1, 1)), Route::Park);
        assert_eq!(reg.split_of(0), Some(2));
        assert_eq!(reg.latest(1).unwrap().ticket, 1);
    }

    #[test]
    fn hello_replays_newer_graph_and_adopts_orphans() {
        let reg = ShardRegistry::new();
        reg.route_graph(0, &graph(4, 2));
        reg.route_graph(0, &graph(4, 1));
        assert_eq!(reg.release(0), vec![2]);

        // Follower that last saw ticket 3 on split 2 comes back.
        let (idx, replay) = reg.hello(7, 3, SplitInfo::new(3, 2)).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(replay.unwrap().ticket, 4);

        // Up to date: bound, nothing replayed.
        reg.release(7);
        let (_, replay) = reg.hello(7, 4, SplitInfo::new(3, 2)).unwrap();
        assert!(replay.is_none());

        // A fresh follower adopts the lowest orphan with a cached graph.
        let (idx, replay) = reg.hello(8, 0, SplitInfo::default()).unwrap();
        assert_eq!(idx, 1);
        assert!(replay.is_some());
        assert!(reg.hello(9, 0, SplitInfo::default()).is_none());
    }

    #[test]
    fn idle_connection_adopts_a_parked_graph() {
        let reg = ShardRegistry::new();
        // Connection 0 takes split 2, then pops split 1's graph as well.
        assert_eq!(reg.route_graph(0, &graph(1, 2)), Route::Here);
        assert_eq!(reg.route_graph(0, &graph(1, 1)), Route::Park);

        assert!(reg.adopt_orphan(0).is_none());
        let (idx, frame) = reg.adopt_orphan(1).unwrap();
        assert_eq!((idx, frame.split.split_idx), (1, 1));
        assert_eq!(reg.owner(1), Some(1));
        assert!(reg.adopt_orphan(2).is_none());
    }

    #[test]
    fn hello_claim_replaces_an_adopted_shard() {
        let reg = ShardRegistry::new();
        reg.route_graph(0, &graph(2, 1));
        reg.route_graph(0, &graph(2, 2));
        reg.release(0);

        assert_eq!(reg.adopt_orphan(5).unwrap().0, 1);
        let (idx, _) = reg.hello(5, 2, SplitInfo::new(3, 2)).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(reg.split_of(5), Some(2));
        assert_eq!(reg.owner(1), None);
    }

    #[test]
    fn fresh_hello_keeps_a_shard_bound_by_routing() {
        let reg = ShardRegistry::new();
        assert_eq!(reg.route_graph(0, &graph(1, 2)), Route::Here);
        assert_eq!(reg.route_graph(0, &graph(1, 1)), Route::Park);

        assert_eq!(reg.hello(0, 0, SplitInfo::default()), Some((2, None)));
        assert_eq!(reg.owner(1), None);
        assert_eq!(reg.adopt_orphan(1).unwrap().0, 1);
    }
}
