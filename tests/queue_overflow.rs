use std::{thread, time::Duration};

use pass_dist_server::{
    config::Role,
    protocol::{DataChunk, Frame, SplitInfo},
    queue::{DistChannels, WaitQueue},
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn twice_capacity_keeps_newest_in_order(cap in 1usize..64) {
        let q = WaitQueue::new(cap);
        let mut evicted = Vec::new();
        for i in 0..2 * cap {
            evicted.extend(q.push(i));
        }
        prop_assert_eq!(q.len(), cap);
        prop_assert_eq!(evicted, (0..cap).collect::<Vec<_>>());
        let drained: Vec<usize> = std::iter::from_fn(|| q.try_pop()).collect();
        prop_assert_eq!(drained, (cap..2 * cap).collect::<Vec<_>>());
    }
}

#[test]
fn producer_and_consumer_threads_preserve_order() {
    let q = WaitQueue::new(1024);
    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            for i in 0..500u32 {
                assert!(q.push(i).is_empty());
            }
        })
    };
    let mut got = Vec::new();
    while got.len() < 500 {
        match q.pop_timeout(Duration::from_secs(5)) {
            Some(v) => got.push(v),
            None => break,
        }
    }
    producer.join().unwrap();
    assert_eq!(got, (0..500).collect::<Vec<_>>());
}

#[test]
fn racing_producers_account_for_every_item() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2_000;
    let q = WaitQueue::new(3);

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let q = q.clone();
            thread::spawn(move || {
                let mut evicted = Vec::new();
                for i in 0..PER_PRODUCER {
                    evicted.extend(q.push(p * PER_PRODUCER + i));
                }
                evicted
            })
        })
        .collect();

    let mut seen: Vec<usize> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    seen.extend(std::iter::from_fn(|| q.try_pop()));
    seen.sort_unstable();
    assert_eq!(seen, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
}

#[test]
fn received_data_lands_on_the_opposite_lane() {
    let ch = DistChannels::new(3, 8);
    let frame = Frame::pass_data(1, SplitInfo::new(3, 2), &[DataChunk::new(0, vec![1])]).unwrap();

    ch.deliver_data(Role::Authority, frame.clone());
    assert_eq!(ch.input[2].try_pop(), Some(frame.clone()));
    ch.deliver_data(Role::Follower, frame.clone());
    assert_eq!(ch.output[2].try_pop(), Some(frame.clone()));

    // No lane for split 5: dropped, not panicking.
    let mut stray = frame;
    stray.split = SplitInfo::new(6, 5);
    ch.deliver_data(Role::Authority, stray);
    assert!(ch.input.iter().all(WaitQueue::is_empty));
}
