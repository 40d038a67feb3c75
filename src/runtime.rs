//! Frame loop wiring: pass tree, distribution engine, comm passes and transport.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::{
    config::{DistConfig, Role},
    dist::{CommPass, CommStats, DistShared, MIRROR_DEVICE, PassDistSystem, TickContext, graph_to_dot},
    pass_graph::{CommandList, GraphDesc, HostMemory, PassId, PassSystem, PassTree, RecordingCommandList},
    transport::{AuthorityHandle, FollowerHandle, spawn_authority, spawn_follower},
};

/// Name of the follower's root that received graphs are built under.
pub const FOLLOWER_PIPELINE: &str = "DistPipeline";
pub const MIRROR_PIPELINE: &str = "DistMirrorPipeline";

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Link {
    Offline,
    Authority(AuthorityHandle),
    Follower(FollowerHandle),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    /// Authority: rewrites recorded this frame.
    pub rewrites: usize,
    /// Follower: passes created from a received graph, if one arrived.
    pub created: Option<usize>,
    pub executed: usize,
    pub comm: CommStats,
}

pub struct DistRuntime {
    role: Role,
    engine: PassDistSystem,
    tree: PassTree,
    memory: HostMemory,
    main_root: PassId,
    /// Authority: the main pipeline. Follower: the pipeline received graphs land in.
    exec_root: PassId,
    tick: TickContext,
    link: Link,
    drain_timeout: Duration,
}

impl DistRuntime {
    pub fn new(cfg: &DistConfig, role: Role, graph: &GraphDesc) -> Result<Self> {
        let mut cfg = cfg.clone();
        cfg.role = Some(role);
        let shared = Arc::new(DistShared::from_config(&cfg));
        let mut engine = PassDistSystem::new(&cfg, shared);
        engine.set_active_pipeline("");

        let mut tree = PassTree::new();
        let main_root = graph
            .instantiate(&mut tree)
            .context("failed to instantiate pass graph")?;

        let exec_root = match role {
            Role::Authority => {
                engine.create_dist_pipeline(&mut tree, MIRROR_DEVICE, MIRROR_PIPELINE)?;
                main_root
            }
            Role::Follower => engine.create_dist_pipeline(&mut tree, 0, FOLLOWER_PIPELINE)?,
        };
        log::info!(
            "[runtime] {} with {} shard(s), root {:?}",
            role.label(),
            engine.shared().split_cnt(),
            tree.pass_name(exec_root)
        );

        Ok(Self {
            role,
            engine,
            tree,
            memory: HostMemory::new(),
            main_root,
            exec_root,
            tick: TickContext::new(),
            link: Link::Offline,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn connect(&mut self, cfg: &DistConfig) -> Result<()> {
        let shared = self.engine.shared().clone();
        self.link = match self.role {
            Role::Authority => Link::Authority(spawn_authority(&cfg.ipc_path, shared)?),
            Role::Follower => Link::Follower(spawn_follower(
                &cfg.ipc_path,
                shared,
                cfg.reconnect_backoff(),
            )?),
        };
        Ok(())
    }

    pub fn engine(&self) -> &PassDistSystem {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PassDistSystem {
        &mut self.engine
    }

    pub fn tree(&self) -> &PassTree {
        &self.tree
    }

    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut HostMemory {
        &mut self.memory
    }

    pub fn exec_root(&self) -> PassId {
        self.exec_root
    }

    pub fn graph_dot(&self) -> String {
        graph_to_dot(&self.tree, self.main_root)
    }

    pub fn run_frame(&mut self) -> Result<FrameStats> {
        let mut stats = FrameStats {
            frame: self.tick.frame,
            ..Default::default()
        };

        match self.role {
            Role::Authority => {
                stats.rewrites =
                    self.engine
                        .process_dist_changes(&mut self.tree, self.exec_root, &mut self.tick);
            }
            Role::Follower => {
                stats.created =
                    self.engine
                        .build_dist_pass_graph(&mut self.tree, self.exec_root, &mut self.tick)?;
                if !self.tree.children(self.exec_root).is_empty() {
                    self.tick.activate();
                }
            }
        }

        if self.tick.is_active(Some(self.role)) {
            self.execute(&mut stats)?;
        }
        self.engine.frame_end(&mut self.tick);
        Ok(stats)
    }

    /// Runs every leaf in order. Regular passes stamp their own attachments in host
    /// memory; comm passes move data and submit copies.
    fn execute(&mut self, stats: &mut FrameStats) -> Result<()> {
        let fill = (self.tick.frame & 0xff) as u8;
        let mut cmds = RecordingCommandList::default();
        for id in self.tree.leaves(self.exec_root) {
            let Some(pass) = self.tree.pass(id) else { continue };
            stats.executed += 1;
            if pass.comm.is_none() {
                for att in &pass.attachments {
                    let Some(len) = att.kind.byte_size() else {
                        log::warn!("[runtime] {} has no usable size, skipped", att.key());
                        continue;
                    };
                    self.memory.write(&att.key(), &vec![fill; len]);
                }
                continue;
            }

            let mut comm = CommPass::from_pass(&self.tree, id, self.role, self.engine.shared().clone())?
                .with_drain_timeout(self.drain_timeout);
            comm.compile_resources(&self.tree)?;
            let s = comm.build_command_list(&self.tree, &mut self.memory, &mut cmds)?;
            stats.comm.drained += s.drained;
            stats.comm.copies += s.copies;
            stats.comm.sent += s.sent;
        }
        for item in cmds.submitted.drain(..) {
            self.memory.submit(&item)?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        match std::mem::replace(&mut self.link, Link::Offline) {
            Link::Authority(mut h) => h.shutdown(),
            Link::Follower(mut h) => h.shutdown(),
            Link::Offline => {}
        }
    }
}

impl Drop for DistRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
