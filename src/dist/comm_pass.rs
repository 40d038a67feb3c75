//! Per-frame execution of a comm pass: drain inbound data, submit copies, send data.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::{
    config::Role,
    pass_graph::{
        CommOper, CommPassData, CommandList, CopyItem, HostMemory, Pass, PassId, PassSystem,
    },
    protocol::{DataChunk, Frame, SplitInfo},
};

use super::system::DistShared;

/// Frames applied per lane and frame: the first may block, the rest are already queued.
const MAX_DRAIN_PER_LANE: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommStats {
    pub drained: usize,
    pub copies: usize,
    pub sent: usize,
}

pub struct CommPass {
    pass: PassId,
    name: String,
    data: CommPassData,
    role: Role,
    shared: Arc<DistShared>,
    copy_items: Vec<CopyItem>,
    drain_timeout: Option<Duration>,
}

impl CommPass {
    pub fn from_pass(
        sys: &dyn PassSystem,
        id: PassId,
        role: Role,
        shared: Arc<DistShared>,
    ) -> Result<Self> {
        let pass = sys.pass(id).context("comm pass vanished")?;
        let data = pass
            .comm
            .with_context(|| format!("{} carries no comm data", pass.name))?;
        Ok(Self {
            pass: id,
            name: pass.name.clone(),
            data,
            role,
            shared,
            copy_items: Vec::new(),
            drain_timeout: None,
        })
    }

    /// Bounds each blocking drain. Without it a missing peer stalls the frame.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pass(&self) -> PassId {
        self.pass
    }

    pub fn data(&self) -> &CommPassData {
        &self.data
    }

    pub fn pending_copies(&self) -> &[CopyItem] {
        &self.copy_items
    }

    /// Queues the input-to-output copy for the next `build_command_list`.
    pub fn compile_resources(&mut self, sys: &dyn PassSystem) -> Result<()> {
        if !self.data.submit {
            return Ok(());
        }
        let pass = sys.pass(self.pass).context("comm pass vanished")?;
        let src = pass.input_binding(0).and_then(|b| b.attachment.as_ref());
        let dst = pass.output_binding(0).and_then(|b| b.attachment.as_ref());
        if let (Some(src), Some(dst)) = (src, dst)
            && src.key() != dst.key()
        {
            let item = CopyItem::between(src, dst);
            log::trace!("[pass] {} queued copy {} -> {}", self.name, item.src(), item.dst());
            self.copy_items.push(item);
        }
        Ok(())
    }

    pub fn build_command_list(
        &mut self,
        sys: &dyn PassSystem,
        memory: &mut HostMemory,
        cmds: &mut dyn CommandList,
    ) -> Result<CommStats> {
        let mut stats = CommStats::default();
        if self.data.oper.drains() {
            stats.drained = self.drain(sys, memory)?;
        }

        for item in self.copy_items.drain(..) {
            cmds.submit(&item)?;
            stats.copies += 1;
        }

        if self.data.oper.sends() {
            stats.sent = self.send(sys, memory)?;
        }
        log::trace!("[pass] {} {:?}: {stats:?}", self.name, self.data.oper);
        Ok(stats)
    }

    fn drain(&self, sys: &dyn PassSystem, memory: &mut HostMemory) -> Result<usize> {
        let split = self.data.split;
        let lanes: Vec<u16> = match self.data.oper {
            CommOper::PrepareInput => vec![split.split_idx],
            CommOper::MergeOutput => SplitInfo::remote_indices(split.split_cnt).collect(),
            _ => Vec::new(),
        };

        let pass = sys.pass(self.pass).context("comm pass vanished")?;
        let mut drained = 0;
        for idx in lanes {
            let Some(first) = self.shared.recv_data(self.role, idx, self.drain_timeout) else {
                log::warn!("[pass] {} got no data for split {idx}", self.name);
                continue;
            };
            // Catch up on a backlog without waiting for more.
            let backlog = std::iter::from_fn(|| self.shared.try_recv_data(self.role, idx))
                .take(MAX_DRAIN_PER_LANE - 1);
            for frame in std::iter::once(first).chain(backlog) {
                self.apply_frame(pass, memory, SplitInfo::new(split.split_cnt, idx), &frame);
                drained += 1;
            }
        }
        Ok(drained)
    }

    fn apply_frame(&self, pass: &Pass, memory: &mut HostMemory, split: SplitInfo, frame: &Frame) {
        let chunks = match frame.chunks() {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("[pass] {} dropped malformed data: {e}", self.name);
                return;
            }
        };
        for chunk in chunks {
            let Some(att) = pass
                .output_binding(chunk.node_id as usize)
                .and_then(|b| b.attachment.as_ref())
            else {
                log::warn!("[pass] {} has no output {}", self.name, chunk.node_id);
                continue;
            };
            match self.data.oper {
                CommOper::MergeOutput => {
                    let Some(size) = att.kind.byte_size() else {
                        log::warn!(
                            "[pass] {} cannot merge into {}: no usable size",
                            self.name,
                            att.key()
                        );
                        continue;
                    };
                    memory.merge_split(&att.key(), size, split, &chunk.bytes);
                }
                _ => memory.write(&att.key(), &chunk.bytes),
            }
        }
    }

    fn send(&self, sys: &dyn PassSystem, memory: &HostMemory) -> Result<usize> {
        let pass = sys.pass(self.pass).context("comm pass vanished")?;
        let chunks: Vec<DataChunk> = pass
            .bindings
            .iter()
            .filter(|b| b.slot_type.is_output())
            .enumerate()
            .filter_map(|(i, b)| {
                let att = b.attachment.as_ref()?;
                let bytes = memory.read(&att.key()).unwrap_or_default();
                Some(DataChunk::new(i as u32, bytes.to_vec()))
            })
            .collect();
        let sent = self.shared.send_data(self.role, self.data.split, &chunks)?;
        if sent == 0 {
            log::debug!("[pass] {} had no peer to send to", self.name);
        }
        Ok(sent)
    }
}
