use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use pass_dist_server::{
    dist::DistShared,
    protocol::{DataChunk, DistMsgType, Frame, SplitInfo},
    transport::{spawn_authority, spawn_follower},
};

const WAIT: Duration = Duration::from_secs(5);

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pass-dist-{tag}-{}.sock", std::process::id()))
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn graph_ack_and_data_cross_the_socket() {
    let path = socket_path("loop");
    let auth = Arc::new(DistShared::new(2, 64, None));
    let fol = Arc::new(DistShared::new(2, 64, None));

    let mut server = spawn_authority(&path, auth.clone()).unwrap();
    let mut client = spawn_follower(&path, fol.clone(), Duration::from_millis(20)).unwrap();

    let ticket = auth.ticket.advance();
    let graph = Frame::new(DistMsgType::PassGraph, ticket, SplitInfo::new(2, 1), Vec::new());
    auth.channels.send_pass_graph(graph.clone());

    let got = fol.channels.pass_in.pop_timeout(WAIT).unwrap();
    assert_eq!(got, graph);
    assert!(wait_until(|| server.registry().acked(1) == Some(ticket)));
    assert_eq!(server.registry().owner(1), Some(0));

    // Authority -> follower data on the bound shard.
    let down = Frame::pass_data(ticket, SplitInfo::new(2, 1), &[DataChunk::new(0, vec![1, 2, 3])])
        .unwrap()
        .with_seq(1);
    auth.channels.output[1].push(down.clone());
    assert_eq!(fol.channels.output[1].pop_timeout(WAIT), Some(down));

    // Follower -> authority data; stale tickets never reach the queue.
    fol.ticket.set(ticket);
    let stale = Frame::pass_data(ticket - 1, SplitInfo::new(2, 1), &[]).unwrap();
    let up = Frame::pass_data(ticket, SplitInfo::new(2, 1), &[DataChunk::new(0, vec![7; 32])])
        .unwrap()
        .with_seq(1);
    fol.channels.input[1].push(stale);
    fol.channels.input[1].push(up.clone());
    fol.channels.input[1].push(up.clone());
    assert_eq!(auth.channels.input[1].pop_timeout(WAIT), Some(up));
    // The duplicate (same ticket and seq) was dropped.
    assert_eq!(auth.channels.input[1].pop_timeout(Duration::from_millis(200)), None);

    client.shutdown();
    assert!(wait_until(|| server.live_connections() == 0));
    server.shutdown();
    assert!(!path.exists());
}

#[test]
fn follower_reconnects_and_gets_the_graph_replayed() {
    let path = socket_path("replay");
    let auth = Arc::new(DistShared::new(2, 64, None));
    let mut server = spawn_authority(&path, auth.clone()).unwrap();

    let ticket = auth.ticket.advance();
    let graph = Frame::new(DistMsgType::PassGraph, ticket, SplitInfo::new(2, 1), Vec::new());
    auth.channels.send_pass_graph(graph.clone());

    let first = Arc::new(DistShared::new(2, 64, None));
    let mut client = spawn_follower(&path, first.clone(), Duration::from_millis(20)).unwrap();
    assert_eq!(first.channels.pass_in.pop_timeout(WAIT), Some(graph.clone()));
    client.shutdown();
    assert!(wait_until(|| server.live_connections() == 0));

    // A fresh follower adopts the orphaned shard and receives its graph again.
    let second = Arc::new(DistShared::new(2, 64, None));
    let mut client = spawn_follower(&path, second.clone(), Duration::from_millis(20)).unwrap();
    assert_eq!(second.channels.pass_in.pop_timeout(WAIT), Some(graph));
    client.shutdown();
    server.shutdown();
}

#[test]
fn each_follower_gets_its_own_shard() {
    let path = socket_path("shards");
    let auth = Arc::new(DistShared::new(3, 64, None));
    let mut server = spawn_authority(&path, auth.clone()).unwrap();

    let followers: Vec<Arc<DistShared>> = (0..2)
        .map(|_| Arc::new(DistShared::new(3, 64, None)))
        .collect();
    let mut clients: Vec<_> = followers
        .iter()
        .map(|f| spawn_follower(&path, f.clone(), Duration::from_millis(20)).unwrap())
        .collect();
    assert!(wait_until(|| server.live_connections() == 2));

    let ticket = auth.ticket.advance();
    for idx in [2, 1] {
        let graph = Frame::new(DistMsgType::PassGraph, ticket, SplitInfo::new(3, idx), Vec::new());
        auth.channels.send_pass_graph(graph);
    }

    // Whichever writer pops which graph, both followers end up with one each.
    let mut got: Vec<u16> = followers
        .iter()
        .map(|f| f.channels.pass_in.pop_timeout(WAIT).unwrap().split.split_idx)
        .collect();
    let by_follower = got.clone();
    got.sort_unstable();
    assert_eq!(got, [1, 2]);
    assert!(wait_until(|| {
        server.registry().acked(1) == Some(ticket) && server.registry().acked(2) == Some(ticket)
    }));
    assert!(server.registry().owner(1).is_some());
    assert_ne!(server.registry().owner(1), server.registry().owner(2));

    // Data for each shard reaches the follower that owns it, on that shard's lane.
    for idx in [1u16, 2] {
        let chunk = DataChunk::new(0, vec![idx as u8; 4]);
        let down = Frame::pass_data(ticket, SplitInfo::new(3, idx), &[chunk])
            .unwrap()
            .with_seq(1);
        auth.channels.output[usize::from(idx)].push(down);
    }
    for (follower, idx) in followers.iter().zip(&by_follower) {
        let lane = usize::from(*idx);
        let data = follower.channels.output[lane].pop_timeout(WAIT).unwrap();
        assert_eq!(data.split.split_idx, *idx);
        assert_eq!(data.chunks().unwrap()[0].bytes, vec![*idx as u8; 4]);
        // Nothing arrives on the other shard's lane.
        let other = 3 - lane;
        assert!(follower.channels.output[other].is_empty());
    }

    for client in &mut clients {
        client.shutdown();
    }
    server.shutdown();
}
