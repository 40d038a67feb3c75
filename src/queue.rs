//! Bounded hand-off queues between the render thread and the socket threads.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::{
    config::Role,
    protocol::{DistMsgType, Frame},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Bounded FIFO whose `push` never blocks: when full, the oldest unread items are
/// evicted and returned to the caller.
pub struct WaitQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for WaitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> WaitQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Returns every item evicted to make room, oldest first. Racing producers can
    /// refill the slot between eviction and send, so there may be more than one.
    pub fn push(&self, item: T) -> Vec<T> {
        let mut item = item;
        let mut evicted = Vec::new();
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(old) = self.rx.try_recv() {
                        evicted.push(old);
                    }
                }
                // Both ends live in `self`.
                Err(TrySendError::Disconnected(back)) => {
                    evicted.push(back);
                    return evicted;
                }
            }
        }
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drops everything queued and returns how many items were discarded.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// For `crossbeam_channel::Select` in writer threads.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

/// Pushes a frame and logs whatever the queue had to evict to make room.
pub fn push_frame(queue: &WaitQueue<Frame>, frame: Frame, queue_name: &str) {
    for old in queue.push(frame) {
        log::warn!(
            "[queue] {queue_name} full ({}), dropped oldest {:?} ticket={} split={}",
            queue.capacity(),
            old.kind,
            old.ticket,
            old.split.split_idx
        );
    }
}

/// Every queue the engine and the transport share.
///
/// `output[k]` carries authority→follower data for shard k, `input[k]` carries
/// follower→authority data for shard k.
pub struct DistChannels {
    pub pass_out: WaitQueue<Frame>,
    pub pass_in: WaitQueue<Frame>,
    pub input: Vec<WaitQueue<Frame>>,
    pub output: Vec<WaitQueue<Frame>>,
    /// Follower control records (ACK) waiting for the writer.
    pub control: WaitQueue<Frame>,
}

impl DistChannels {
    pub fn new(split_cnt: u16, capacity: usize) -> Self {
        let lanes = usize::from(split_cnt.max(1));
        Self {
            pass_out: WaitQueue::new(capacity),
            pass_in: WaitQueue::new(capacity),
            input: (0..lanes).map(|_| WaitQueue::new(capacity)).collect(),
            output: (0..lanes).map(|_| WaitQueue::new(capacity)).collect(),
            control: WaitQueue::new(capacity),
        }
    }

    pub fn split_cnt(&self) -> u16 {
        self.input.len() as u16
    }

    /// Queue a comm pass on this side fills.
    pub fn outbound_data(&self, role: Role, split_idx: u16) -> Option<&WaitQueue<Frame>> {
        match role {
            Role::Authority => self.output.get(usize::from(split_idx)),
            Role::Follower => self.input.get(usize::from(split_idx)),
        }
    }

    /// Queue a comm pass on this side drains.
    pub fn inbound_data(&self, role: Role, split_idx: u16) -> Option<&WaitQueue<Frame>> {
        match role {
            Role::Authority => self.input.get(usize::from(split_idx)),
            Role::Follower => self.output.get(usize::from(split_idx)),
        }
    }

    pub fn send_pass_graph(&self, frame: Frame) {
        debug_assert_eq!(frame.kind, DistMsgType::PassGraph);
        push_frame(&self.pass_out, frame, "pass_out");
    }

    /// Routes a received data frame to its shard lane; frames for unknown shards are
    /// dropped and logged.
    pub fn deliver_data(&self, role: Role, frame: Frame) {
        let idx = frame.split.split_idx;
        match self.inbound_data(role, idx) {
            Some(queue) => {
                let name = if role.is_authority() { "input" } else { "output" };
                push_frame(queue, frame, name);
            }
            None => log::warn!(
                "[queue] data for split {idx} but only {} lanes, dropped",
                self.split_cnt()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SplitInfo;

    #[test]
    fn fifo_order() {
        let q = WaitQueue::new(8);
        for i in 0..8 {
            assert!(q.push(i).is_empty());
        }
        let got: Vec<i32> = (0..8).filter_map(|_| q.pop()).collect();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn overflow_evicts_oldest_and_hands_it_back() {
        let cap = 4;
        let q = WaitQueue::new(cap);
        let mut evicted = Vec::new();
        for i in 0..2 * cap {
            evicted.extend(q.push(i));
        }
        assert_eq!(evicted, vec![0, 1, 2, 3]);
        assert_eq!(q.len(), cap);
        let rest: Vec<usize> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(rest, vec![4, 5, 6, 7]);
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let q = WaitQueue::new(2);
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(42u32);
        });
        assert_eq!(q.pop(), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn role_picks_opposite_lanes() {
        let ch = DistChannels::new(3, 4);
        let f = Frame::new(DistMsgType::PassData, 1, SplitInfo::new(3, 2), vec![]);
        ch.outbound_data(Role::Authority, 2).unwrap().push(f.clone());
        assert_eq!(ch.output[2].len(), 1);
        ch.outbound_data(Role::Follower, 2).unwrap().push(f.clone());
        assert_eq!(ch.input[2].len(), 1);
        assert!(ch.outbound_data(Role::Authority, 3).is_none());

        ch.deliver_data(Role::Authority, f);
        assert_eq!(ch.input[2].clear(), 2);
        assert!(ch.input[2].is_empty());
    }
}
