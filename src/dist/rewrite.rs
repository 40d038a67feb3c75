//! Rewrite rules: which passes are split and how their replacements are wired.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result, bail};

use crate::{
    config::Role,
    pass_graph::{
        AttachmentKind, COMM_PASS_CLASS, CommOper, CommPassData, Pass, PassAttachment,
        PassBufferAttachmentDesc, PassConnection, PassId, PassImageAttachmentDesc, PassRequest,
        PassSlot, PassSlotType, PassSystem, PassTemplate, THIS_PASS,
    },
    protocol::{Frame, SplitInfo},
};

use super::{
    encode::{request_fragment, template_fragment},
    node::{ConnectionEdit, PassDistNode},
    system::PassDistSystem,
};

/// Device whose dist pipeline mirrors the remote triplet on the authority.
pub const MIRROR_DEVICE: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewriteRule {
    /// Split into local pre/after comm passes plus a remote pre/dist/after triplet.
    FullscreenShadow,
    /// Replace with a `_rep` comm pass that takes over the pass's consumers.
    Replicate,
}

pub fn name_ends_with(name: &str, suffix: &str) -> bool {
    !suffix.is_empty() && name.ends_with(suffix)
}

fn ensure_built(sys: &mut dyn PassSystem, id: PassId) -> Result<Pass> {
    let built = sys.pass(id).context("pass vanished")?.is_built();
    if !built {
        sys.build(id, false)?;
    }
    sys.pass(id).cloned().context("pass vanished")
}

fn push_attachment_desc(template: &mut PassTemplate, name: &str, att: &PassAttachment) {
    let declared = template.image_attachments.iter().any(|i| i.name == name)
        || template.buffer_attachments.iter().any(|b| b.name == name);
    if declared {
        return;
    }
    match att.kind {
        AttachmentKind::Image(image) => template.image_attachments.push(PassImageAttachmentDesc {
            name: name.to_string(),
            image,
        }),
        AttachmentKind::Buffer(buffer) => {
            template.buffer_attachments.push(PassBufferAttachmentDesc {
                name: name.to_string(),
                buffer,
            })
        }
    }
}

fn bound_inputs(pass: &Pass) -> Vec<(String, Arc<PassAttachment>)> {
    pass.bindings
        .iter()
        .filter(|b| b.slot_type == PassSlotType::Input)
        .filter_map(|b| Some((b.name.clone(), b.attachment.clone()?)))
        .collect()
}

impl PassDistSystem {
    pub fn rule_for(&self, name: &str) -> Option<RewriteRule> {
        if name_ends_with(name, &self.replicate_suffix) {
            Some(RewriteRule::Replicate)
        } else if name_ends_with(name, &self.shadow_suffix) {
            Some(RewriteRule::FullscreenShadow)
        } else {
            None
        }
    }

    pub(super) fn apply_rule(
        &mut self,
        rule: RewriteRule,
        sys: &mut dyn PassSystem,
        id: PassId,
        leaves: &BTreeMap<String, PassId>,
    ) -> Result<PassDistNode> {
        match rule {
            RewriteRule::FullscreenShadow => self.rewrite_fullscreen_shadow(sys, id),
            RewriteRule::Replicate => self.rewrite_replicate(sys, id, leaves),
        }
    }

    fn create_from_template(
        &mut self,
        sys: &mut dyn PassSystem,
        template: PassTemplate,
        name: &str,
    ) -> Result<PassId> {
        let template = self.register_template(template);
        sys.create_pass_from_template(template, name)
    }

    fn rewrite_fullscreen_shadow(
        &mut self,
        sys: &mut dyn PassSystem,
        id: PassId,
    ) -> Result<PassDistNode> {
        let pass = ensure_built(sys, id)?;
        crate::dist::show_connections(sys, id);

        let inputs = bound_inputs(&pass);
        if inputs.is_empty() {
            bail!("{} has no bound inputs to distribute", pass.name);
        }
        let output_slot = pass
            .output_binding(0)
            .map(|b| b.name.clone())
            .with_context(|| format!("{} has no output slot", pass.name))?;
        let local = SplitInfo::local(self.shared.split_cnt());

        let pre_name = format!("{}_Pre", pass.name);
        let mut pre = PassTemplate::new(format!("{}PreTemplate", pass.name), COMM_PASS_CLASS);
        for (slot, _) in &inputs {
            pre.slots.push(PassSlot::new(slot, PassSlotType::InputOutput));
            if let Some(conn) = pass.connection(slot) {
                pre.connections.push(conn.clone());
            }
        }
        pre.comm = Some(CommPassData::new(CommOper::CopyInput, local));
        let pre_id = self.create_from_template(sys, pre, &pre_name)?;

        let mut after = PassTemplate::new(format!("{}AfterTemplate", pass.name), COMM_PASS_CLASS);
        after.slots.push(PassSlot::new("Output", PassSlotType::InputOutput));
        after
            .connections
            .push(PassConnection::new("Output", &pass.name, &output_slot));
        after.comm = Some(CommPassData::new(CommOper::MergeOutput, local));
        let after_id = self.create_from_template(sys, after, &format!("{}_After", pass.name))?;

        let mut node = PassDistNode::new(pre_id, id, Some(after_id));
        for (slot, _) in &inputs {
            node.edits.push(ConnectionEdit::Set {
                pass: id,
                conn: PassConnection::new(slot, &pre_name, slot),
            });
        }

        if self.role == Some(Role::Authority) {
            match self.clone_fullscreen_shadow(sys, &pass, &inputs, &output_slot) {
                Ok(sent) => log::info!("[dist] {} distributed to {sent} shard(s)", pass.name),
                Err(e) => log::warn!("[dist] distributing {} failed: {e:#}", pass.name),
            }
        }
        Ok(node)
    }

    /// Builds the remote pre/dist/after triplet, mirrors it under the device-1 dist
    /// pipeline and queues one pass-graph message per remote shard.
    fn clone_fullscreen_shadow(
        &mut self,
        sys: &mut dyn PassSystem,
        pass: &Pass,
        inputs: &[(String, Arc<PassAttachment>)],
        output_slot: &str,
    ) -> Result<usize> {
        let Some(root) = self.get_dist_pipeline(MIRROR_DEVICE) else {
            log::debug!("[dist] no dist pipeline on device {MIRROR_DEVICE}");
            return Ok(0);
        };
        if sys.children(root).len() > 1 {
            log::debug!("[dist] dist pipeline already populated");
            return Ok(0);
        }
        let split_cnt = self.shared.split_cnt();

        let pre_name = format!("{}_DistPre", pass.name);
        let dist_name = format!("{}_Dist", pass.name);
        let after_name = format!("{}_DistAfter", pass.name);

        let mut pre = PassTemplate::new(format!("{}DistPreTemplate", pass.name), COMM_PASS_CLASS);
        for (slot, att) in inputs {
            pre.slots.push(PassSlot::new(slot, PassSlotType::InputOutput));
            pre.connections
                .push(PassConnection::new(slot, THIS_PASS, &att.name));
            push_attachment_desc(&mut pre, &att.name, att);
        }
        pre.comm = Some(CommPassData::new(
            CommOper::PrepareInput,
            SplitInfo::local(split_cnt),
        ));

        let mut request = PassRequest {
            pass_name: dist_name.clone(),
            template_name: pass.template_name().to_string(),
            connections: inputs
                .iter()
                .map(|(slot, _)| PassConnection::new(slot, &pre_name, slot))
                .collect(),
            ..Default::default()
        };
        if let Some(att) = pass.output_binding(0).and_then(|b| b.attachment.as_ref())
            && att.owner == pass.name
        {
            match att.kind {
                AttachmentKind::Image(image) => {
                    request.image_overrides.push(PassImageAttachmentDesc {
                        name: att.name.clone(),
                        image,
                    })
                }
                AttachmentKind::Buffer(buffer) => {
                    request.buffer_overrides.push(PassBufferAttachmentDesc {
                        name: att.name.clone(),
                        buffer,
                    })
                }
            }
        }

        let mut after =
            PassTemplate::new(format!("{}DistAfterTemplate", pass.name), COMM_PASS_CLASS);
        after.slots.push(PassSlot::new("Output", PassSlotType::InputOutput));
        after
            .connections
            .push(PassConnection::new("Output", &dist_name, output_slot));
        after.comm = Some(CommPassData::new(
            CommOper::CopyOutput,
            SplitInfo::local(split_cnt),
        ));

        if let Some(template) = &pass.template
            && sys.find_template(&template.name).is_none()
        {
            sys.register_template(template.clone());
        }
        self.mirror_triplet(sys, root, &pre, &pre_name, &request, &after, &after_name)?;

        let ticket = self.shared.ticket.current();
        let mut sent = 0;
        for idx in SplitInfo::remote_indices(split_cnt) {
            let split = SplitInfo::new(split_cnt, idx);
            let mut shard_pre = pre.clone();
            shard_pre.comm = Some(CommPassData::new(CommOper::PrepareInput, split));
            let mut shard_after = after.clone();
            shard_after.comm = Some(CommPassData::new(CommOper::CopyOutput, split));

            let fragments = [
                template_fragment(&shard_pre, &pre_name, &self.active_pipeline),
                request_fragment(&request, pass.pass_class(), &self.active_pipeline),
                template_fragment(&shard_after, &after_name, &self.active_pipeline),
            ];
            let frame = Frame::pass_graph(ticket, split, &fragments)?;
            log::debug!(
                "[dist] pass graph for split {idx}: {} bytes, ticket {ticket}",
                frame.encoded_len()
            );
            self.shared.dump("pack", &frame);
            self.shared.channels.send_pass_graph(frame);
            sent += 1;
        }
        Ok(sent)
    }

    #[allow(clippy::too_many_arguments)]
    fn mirror_triplet(
        &mut self,
        sys: &mut dyn PassSystem,
        root: PassId,
        pre: &PassTemplate,
        pre_name: &str,
        request: &PassRequest,
        after: &PassTemplate,
        after_name: &str,
    ) -> Result<()> {
        let pre_id = self.create_from_template(sys, pre.clone(), pre_name)?;
        self.requests.push(request.clone());
        let dist_id = sys.create_pass_from_request(request)?;
        let after_id = self.create_from_template(sys, after.clone(), after_name)?;
        for id in [pre_id, dist_id, after_id] {
            sys.add_child(root, id)?;
        }
        sys.build(root, false)
    }

    fn rewrite_replicate(
        &mut self,
        sys: &mut dyn PassSystem,
        id: PassId,
        leaves: &BTreeMap<String, PassId>,
    ) -> Result<PassDistNode> {
        let pass = ensure_built(sys, id)?;
        crate::dist::show_connections(sys, id);

        let input = pass
            .input_binding(0)
            .with_context(|| format!("{} has no input slot", pass.name))?;
        let upstream = pass
            .connection(&input.name)
            .cloned()
            .with_context(|| format!("{}.{} is not connected", pass.name, input.name))?;
        let output = pass
            .output_binding(0)
            .and_then(|b| b.attachment.clone())
            .with_context(|| format!("{} has no bound output", pass.name))?;

        let rep_name = format!("{}_rep", pass.name);
        let replica = format!("{}Replica", output.name);
        let mut rep = PassTemplate::new(format!("{}RepTemplate", pass.name), COMM_PASS_CLASS);
        rep.slots.push(PassSlot::new("Input", PassSlotType::Input));
        rep.slots.push(PassSlot::new("Output", PassSlotType::Output));
        rep.connections.push(PassConnection {
            local_slot: "Input".to_string(),
            attachment_ref: upstream.attachment_ref,
        });
        rep.connections
            .push(PassConnection::new("Output", THIS_PASS, &replica));
        push_attachment_desc(&mut rep, &replica, &output);
        rep.comm = Some(CommPassData::new(
            CommOper::CopyOutput,
            SplitInfo::local(self.shared.split_cnt()),
        ));
        let rep_id = self.create_from_template(sys, rep, &rep_name)?;

        let mut node = PassDistNode::new(rep_id, id, None);
        for (name, follower) in leaves {
            if *follower == id {
                continue;
            }
            let Some(consumer) = sys.pass(*follower) else { continue };
            let retargets: Vec<ConnectionEdit> = consumer
                .connections
                .iter()
                .filter(|c| c.attachment_ref.pass == pass.name)
                .map(|c| ConnectionEdit::Set {
                    pass: *follower,
                    conn: PassConnection::new(&c.local_slot, &rep_name, "Output"),
                })
                .collect();
            if !retargets.is_empty() {
                log::debug!("[dist] {name} follows {rep_name}");
                node.edits.extend(retargets);
                node.follows.push(*follower);
            }
        }
        node.edits.push(ConnectionEdit::Clear { pass: id });
        Ok(node)
    }
}
