use std::sync::Arc;

use pass_dist_server::{
    config::{DistConfig, Role},
    dist::{DistShared, MIRROR_DEVICE, PassDistSystem, TickContext},
    pass_graph::{GraphDesc, PassId, PassSystem, PassTree},
    protocol::{Frame, PassCreateType, PassGraphFragment, SplitInfo},
};

fn engine(role: Role, split_cnt: u16) -> PassDistSystem {
    let cfg = DistConfig {
        role: Some(role),
        split_cnt,
        ..Default::default()
    };
    PassDistSystem::new(&cfg, Arc::new(DistShared::from_config(&cfg)))
}

/// Runs one authority rewrite and returns the message for shard 1.
fn authority_message(split_cnt: u16) -> Frame {
    let mut auth = engine(Role::Authority, split_cnt);
    let mut tree = PassTree::new();
    let root = GraphDesc::shadow_pipeline().instantiate(&mut tree).unwrap();
    auth.create_dist_pipeline(&mut tree, MIRROR_DEVICE, "Mirror").unwrap();
    auth.process_dist_changes(&mut tree, root, &mut TickContext::new());
    std::iter::from_fn(|| auth.shared().channels.pass_out.try_pop())
        .find(|f| f.split.split_idx == 1)
        .unwrap()
}

fn follower(split_cnt: u16) -> (PassDistSystem, PassTree, PassId) {
    let mut fol = engine(Role::Follower, split_cnt);
    let mut tree = PassTree::new();
    GraphDesc::shadow_pipeline().instantiate(&mut tree).unwrap();
    let root = fol.create_dist_pipeline(&mut tree, 0, "DistPipeline").unwrap();
    (fol, tree, root)
}

#[test]
fn follower_builds_received_passes_in_fragment_order() {
    let msg = authority_message(2);
    let (mut fol, mut tree, root) = follower(2);
    fol.shared().channels.pass_in.push(msg.clone());

    let mut tick = TickContext::new();
    assert!(!tick.is_active(Some(Role::Follower)));
    let created = fol.build_dist_pass_graph(&mut tree, root, &mut tick).unwrap();
    assert_eq!(created, Some(3));
    assert!(tick.is_active(Some(Role::Follower)));

    let names: Vec<&str> = tree.children(root).iter().map(|id| tree.pass_name(*id)).collect();
    assert_eq!(
        names,
        [
            "SunFullscreenShadowPass_DistPre",
            "SunFullscreenShadowPass_Dist",
            "SunFullscreenShadowPass_DistAfter",
        ]
    );
    for id in tree.children(root) {
        assert!(tree.pass(*id).unwrap().is_built());
    }
    assert_eq!(fol.ticket(), msg.ticket);
    assert_eq!(fol.split_info(), SplitInfo::new(2, 1));

    // The remote pass reads what the remote pre-pass receives into.
    let pre = tree.pass(tree.find_pass("SunFullscreenShadowPass_DistPre").unwrap()).unwrap();
    let dist = tree.pass(tree.find_pass("SunFullscreenShadowPass_Dist").unwrap()).unwrap();
    assert_eq!(
        dist.binding("Depth").unwrap().attachment.as_ref(),
        pre.attachment("DepthImage")
    );
}

#[test]
fn no_message_keeps_the_previous_graph() {
    let msg = authority_message(2);
    let (mut fol, mut tree, root) = follower(2);
    let mut tick = TickContext::new();
    assert_eq!(fol.build_dist_pass_graph(&mut tree, root, &mut tick).unwrap(), None);

    fol.shared().channels.pass_in.push(msg.clone());
    fol.build_dist_pass_graph(&mut tree, root, &mut tick).unwrap();
    fol.frame_end(&mut tick);
    assert_eq!(fol.build_dist_pass_graph(&mut tree, root, &mut tick).unwrap(), None);
    assert_eq!(tree.children(root).len(), 3);

    // A second message replaces the graph instead of stacking on it.
    fol.shared().channels.pass_in.push(msg);
    assert_eq!(fol.build_dist_pass_graph(&mut tree, root, &mut tick).unwrap(), Some(3));
    assert_eq!(tree.children(root).len(), 3);
}

#[test]
fn bad_fragments_are_skipped() {
    let (mut fol, mut tree, root) = follower(2);
    let mut unknown = PassGraphFragment::new(PassCreateType::Request, "Orphan");
    unknown.pass_template = "NoSuchTemplate".to_string();
    let mut good = PassGraphFragment::new(PassCreateType::Template, "Plain");
    good.pass_template = "PlainTemplate".to_string();
    good.pass_class = "Raster".to_string();

    let mut body = unknown.encode().unwrap();
    body.extend(good.encode().unwrap());
    // Corrupt the create type of a third record; it is skipped on its own.
    let mut broken = good.encode().unwrap();
    broken[4..8].copy_from_slice(&9u32.to_ne_bytes());
    body.extend(broken);

    let mut frame = Frame::pass_graph(5, SplitInfo::new(2, 1), &[]).unwrap();
    frame.body = body;
    fol.shared().channels.pass_in.push(frame);

    let created = fol
        .build_dist_pass_graph(&mut tree, root, &mut TickContext::new())
        .unwrap();
    assert_eq!(created, Some(1));
    assert_eq!(tree.pass_name(tree.children(root)[0]), "Plain");
    assert_eq!(fol.ticket(), 5);
}
