use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};

use crate::{
    config::{DistConfig, Role},
    pass_graph::{PassId, PassRequest, PassSystem, PassTemplate},
    protocol::{DataChunk, Frame, ProtocolError, SplitInfo, dump_msg},
    queue::{DistChannels, push_frame},
};

use super::{
    node::PassDistNode,
    rewrite::RewriteRule,
    ticket::{TickContext, TicketCounter},
};

/// State the engine shares with socket threads and comm passes.
pub struct DistShared {
    pub channels: DistChannels,
    pub ticket: TicketCounter,
    seq: AtomicU32,
    pub dump_dir: Option<PathBuf>,
}

impl DistShared {
    pub fn new(split_cnt: u16, queue_capacity: usize, dump_dir: Option<PathBuf>) -> Self {
        Self {
            channels: DistChannels::new(split_cnt, queue_capacity),
            ticket: TicketCounter::new(),
            seq: AtomicU32::new(0),
            dump_dir,
        }
    }

    pub fn from_config(cfg: &DistConfig) -> Self {
        Self::new(
            cfg.effective_split_cnt(),
            cfg.queue_capacity,
            cfg.dump_dir.clone(),
        )
    }

    pub fn split_cnt(&self) -> u16 {
        self.channels.split_cnt()
    }

    /// Never returns 0, which marks unsequenced frames.
    pub fn next_seq(&self) -> u32 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    pub fn dump(&self, tag: &str, frame: &Frame) {
        let Ok(bytes) = frame.encode() else { return };
        if let Err(e) = dump_msg(tag, &bytes, self.dump_dir.as_deref()) {
            log::warn!("[dist] dump {tag} failed: {e}");
        }
    }

    /// Queues one data frame for `split`. On the authority the local split fans out
    /// to every remote shard. Returns the number of frames queued.
    pub fn send_data(
        &self,
        role: Role,
        split: SplitInfo,
        chunks: &[DataChunk],
    ) -> Result<usize, ProtocolError> {
        let frame = Frame::pass_data(self.ticket.current(), split, chunks)?.with_seq(self.next_seq());
        let targets: Vec<u16> = if role.is_authority() && split.is_local() {
            SplitInfo::remote_indices(split.split_cnt).collect()
        } else {
            vec![split.split_idx]
        };

        let mut sent = 0;
        for idx in targets {
            let Some(queue) = self.channels.outbound_data(role, idx) else {
                log::warn!("[dist] no data lane for split {idx}, frame dropped");
                continue;
            };
            let mut copy = frame.clone();
            copy.split = SplitInfo::new(split.split_cnt, idx);
            push_frame(queue, copy, "data out");
            sent += 1;
        }
        Ok(sent)
    }

    /// The authority only takes data of its current ticket. A follower may see data
    /// of a newer ticket before the matching graph is applied, so it only drops older.
    fn accept_data(&self, role: Role, frame: Frame) -> Option<Frame> {
        let current = self.ticket.current();
        let stale = match role {
            Role::Authority => frame.ticket != current,
            Role::Follower => frame.ticket < current,
        };
        if stale {
            log::debug!(
                "[dist] stale data ticket={} current={current} split={}, discarded",
                frame.ticket,
                frame.split.split_idx
            );
            return None;
        }
        Some(frame)
    }

    /// Blocks until a data frame of the current generation arrives for `split_idx`.
    /// `None` waits forever.
    pub fn recv_data(&self, role: Role, split_idx: u16, timeout: Option<Duration>) -> Option<Frame> {
        let queue = self.channels.inbound_data(role, split_idx)?;
        loop {
            let frame = match timeout {
                Some(t) => queue.pop_timeout(t)?,
                None => queue.pop()?,
            };
            if let Some(frame) = self.accept_data(role, frame) {
                return Some(frame);
            }
        }
    }

    pub fn try_recv_data(&self, role: Role, split_idx: u16) -> Option<Frame> {
        let queue = self.channels.inbound_data(role, split_idx)?;
        while let Some(frame) = queue.try_pop() {
            if let Some(frame) = self.accept_data(role, frame) {
                return Some(frame);
            }
        }
        None
    }
}

/// The distribution engine. Owned by the render thread.
pub struct PassDistSystem {
    pub(super) role: Option<Role>,
    pub(super) enabled: bool,
    pub(super) active_pipeline: String,
    pub(super) shadow_suffix: String,
    pub(super) replicate_suffix: String,
    pub(super) change_list: BTreeMap<String, PassDistNode>,
    pub(super) templates: Vec<Arc<PassTemplate>>,
    pub(super) requests: Vec<PassRequest>,
    pub(super) dist_pipelines: BTreeMap<u32, PassId>,
    pub(super) split_info: SplitInfo,
    pub(super) shared: Arc<DistShared>,
}

impl PassDistSystem {
    pub fn new(cfg: &DistConfig, shared: Arc<DistShared>) -> Self {
        Self {
            role: cfg.role,
            enabled: true,
            active_pipeline: String::new(),
            shadow_suffix: cfg.shadow_suffix.clone(),
            replicate_suffix: cfg.replicate_suffix.clone(),
            change_list: BTreeMap::new(),
            templates: Vec::new(),
            requests: Vec::new(),
            dist_pipelines: BTreeMap::new(),
            split_info: SplitInfo::local(shared.split_cnt()),
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<DistShared> {
        &self.shared
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = Some(role);
    }

    pub fn enable(&mut self) {
        log::info!("[dist] enabled");
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        log::info!("[dist] disabled");
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// An empty name selects the authority role unless a role is already configured.
    pub fn set_active_pipeline(&mut self, name: &str) -> Option<Role> {
        log::info!("[dist] active pipeline {name:?}");
        self.active_pipeline = name.to_string();
        if name.is_empty() && self.role.is_none() {
            self.role = Some(Role::Authority);
        }
        self.role
    }

    pub fn active_pipeline(&self) -> &str {
        &self.active_pipeline
    }

    pub fn ticket(&self) -> u64 {
        self.shared.ticket.current()
    }

    /// Authority: its local split. Follower: the split of the last applied graph.
    pub fn split_info(&self) -> SplitInfo {
        self.split_info
    }

    pub fn change_list(&self) -> &BTreeMap<String, PassDistNode> {
        &self.change_list
    }

    pub fn dist_node(&self, modified: &str) -> Option<&PassDistNode> {
        self.change_list.get(modified)
    }

    pub fn templates(&self) -> &[Arc<PassTemplate>] {
        &self.templates
    }

    pub fn requests(&self) -> &[PassRequest] {
        &self.requests
    }

    pub fn is_dist_processed(&self, name: &str) -> bool {
        self.change_list.contains_key(name)
    }

    /// Records a rewrite. An existing entry for the same pass wins.
    pub fn add_dist_node(&mut self, modified: &str, node: PassDistNode) -> bool {
        if self.change_list.contains_key(modified) {
            log::warn!("[dist] {modified} already has a pending rewrite, new one ignored");
            return false;
        }
        log::debug!("[dist] recorded rewrite of {modified}");
        self.change_list.insert(modified.to_string(), node);
        true
    }

    pub fn create_dist_pipeline(
        &mut self,
        sys: &mut dyn PassSystem,
        device: u32,
        name: &str,
    ) -> Result<PassId> {
        let root = sys
            .create_parent_pass(name)
            .with_context(|| format!("failed to create dist pipeline {name:?}"))?;
        log::info!("[dist] pipeline {name:?} on device {device}");
        self.dist_pipelines.insert(device, root);
        Ok(root)
    }

    pub fn get_dist_pipeline(&self, device: u32) -> Option<PassId> {
        self.dist_pipelines.get(&device).copied()
    }

    pub(super) fn register_template(&mut self, template: PassTemplate) -> Arc<PassTemplate> {
        let template = Arc::new(template);
        self.templates.push(template.clone());
        template
    }

    /// Collects every leaf under `pass` into a name-keyed map.
    pub fn process_sub_passes(
        sys: &dyn PassSystem,
        pass: PassId,
        leaves: &mut BTreeMap<String, PassId>,
    ) {
        let Some(p) = sys.pass(pass) else { return };
        if p.is_parent() {
            for child in p.children() {
                Self::process_sub_passes(sys, *child, leaves);
            }
        } else {
            leaves.insert(p.name.clone(), pass);
        }
    }

    /// Finds unprocessed rewrite targets under `root`, records their rewrites and
    /// commits them. Returns the number of new change-list entries.
    pub fn process_dist_changes(
        &mut self,
        sys: &mut dyn PassSystem,
        root: PassId,
        tick: &mut TickContext,
    ) -> usize {
        if !self.enabled {
            log::debug!("[dist] disabled, skipping {:?}", sys.pass_name(root));
            return 0;
        }
        if !tick.enter() {
            log::debug!("[dist] already distributing in this tick");
            return 0;
        }

        let added = self.modify_dist_pass_graph(sys, root);
        self.update_dist_passes(sys);
        tick.leave();
        added
    }

    fn modify_dist_pass_graph(&mut self, sys: &mut dyn PassSystem, root: PassId) -> usize {
        let mut leaves = BTreeMap::new();
        for child in sys.children(root).to_vec() {
            Self::process_sub_passes(sys, child, &mut leaves);
        }

        let candidates: Vec<(String, PassId, RewriteRule)> = leaves
            .iter()
            .filter_map(|(name, id)| {
                let rule = self.rule_for(name)?;
                if self.is_dist_processed(name) {
                    log::trace!("[dist] {name} already modified");
                    return None;
                }
                Some((name.clone(), *id, rule))
            })
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        if self.role == Some(Role::Authority) {
            let ticket = self.shared.ticket.advance();
            log::info!("[dist] rewrite cycle, ticket {ticket}");
        }

        let mut added = 0;
        for (name, id, rule) in candidates {
            log::info!("[dist] {name} matched {rule:?}");
            match self.apply_rule(rule, sys, id, &leaves) {
                Ok(node) => {
                    if self.add_dist_node(&name, node) {
                        added += 1;
                    }
                }
                Err(e) => log::warn!("[dist] rewrite of {name} failed: {e:#}"),
            }
        }
        added
    }

    /// Applies every unbuilt rewrite: pending connection edits, `self` at `modify`'s
    /// index, `after` right behind `modify`, then rebuilds.
    pub fn update_dist_passes(&mut self, sys: &mut dyn PassSystem) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut committed = 0;
        for (name, node) in self.change_list.iter_mut().filter(|(_, n)| !n.built) {
            if let Err(e) = commit_node(sys, node) {
                log::warn!("[dist] commit of {name} incomplete: {e:#}");
            }
            node.built = true;
            committed += 1;
            log::debug!("[dist] committed rewrite of {name}");
        }
        committed
    }

    pub fn send_data(&self, split: SplitInfo, chunks: &[DataChunk]) -> Result<usize> {
        let role = self.role.context("role not selected")?;
        Ok(self.shared.send_data(role, split, chunks)?)
    }

    pub fn recv_data(&self, split_idx: u16, timeout: Option<Duration>) -> Option<Frame> {
        self.shared.recv_data(self.role?, split_idx, timeout)
    }

    pub fn try_recv_data(&self, split_idx: u16) -> Option<Frame> {
        self.shared.try_recv_data(self.role?, split_idx)
    }

    pub fn frame_end(&mut self, tick: &mut TickContext) {
        log::trace!("[dist] frame {} end", tick.frame);
        tick.end_frame();
    }
}

fn commit_node(sys: &mut dyn PassSystem, node: &PassDistNode) -> Result<()> {
    for edit in &node.edits {
        edit.apply(sys)?;
    }

    let parent = sys
        .pass(node.modify)
        .and_then(|p| p.parent)
        .context("modified pass has no parent")?;
    let index = sys
        .child_index(parent, node.modify)
        .context("modified pass missing from its parent")?;
    sys.insert_child(parent, node.self_pass, index)?;
    if let Some(after) = node.after {
        let index = sys.child_index(parent, node.modify).unwrap_or(index + 1);
        sys.insert_child(parent, after, index + 1)?;
    }

    // `self` first: `modify` now reads its inputs through it.
    sys.build(node.self_pass, false)?;
    sys.build(node.modify, false)?;
    if let Some(after) = node.after {
        sys.build(after, false)?;
    }
    for follow in &node.follows {
        sys.build(*follow, false)?;
    }
    Ok(())
}
