use anyhow::{Context, Result};

use crate::{
    pass_graph::{PassId, PassSystem},
    protocol::{Frame, PassCreateType, PassGraphFragment},
};

use super::{
    encode::{fragment_request, fragment_template},
    system::PassDistSystem,
    ticket::TickContext,
};

impl PassDistSystem {
    /// Follower side of a frame: applies at most one received pass-graph message under
    /// `root`. Returns the number of passes created, or `None` when nothing arrived and
    /// the previous graph stays in place.
    pub fn build_dist_pass_graph(
        &mut self,
        sys: &mut dyn PassSystem,
        root: PassId,
        tick: &mut TickContext,
    ) -> Result<Option<usize>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(frame) = self.shared.channels.pass_in.try_pop() else {
            return Ok(None);
        };
        tick.activate();
        let created = self.apply_pass_graph(sys, root, &frame)?;
        Ok(Some(created))
    }

    /// Replaces every child of `root` with the passes carried by `frame`.
    pub fn apply_pass_graph(
        &mut self,
        sys: &mut dyn PassSystem,
        root: PassId,
        frame: &Frame,
    ) -> Result<usize> {
        sys.remove_children(root)
            .with_context(|| format!("failed to clear {:?}", sys.pass_name(root)))?;
        self.templates.clear();
        self.requests.clear();
        self.change_list.clear();

        self.shared.ticket.set(frame.ticket);
        self.split_info = frame.split;
        self.shared.dump("recv", frame);
        log::info!(
            "[dist] applying pass graph ticket={} split={}/{} ({} bytes)",
            frame.ticket,
            frame.split.split_idx,
            frame.split.split_cnt,
            frame.body.len()
        );

        let created = self.parse_pass_create_msg(sys, root, frame)?;
        Ok(created.len())
    }

    /// Creates, attaches and builds one pass per well-formed fragment, in order.
    pub fn parse_pass_create_msg(
        &mut self,
        sys: &mut dyn PassSystem,
        root: PassId,
        frame: &Frame,
    ) -> Result<Vec<PassId>> {
        let mut created = Vec::new();
        let mut fragments = frame.fragments()?;
        while let Some(fragment) = fragments.next() {
            let fragment = match fragment {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("[dist] bad fragment near offset {}: {e}", fragments.offset());
                    continue;
                }
            };
            if fragment.pipeline != self.active_pipeline {
                log::debug!(
                    "[dist] {} targets pipeline {:?}, active is {:?}",
                    fragment.name,
                    fragment.pipeline,
                    self.active_pipeline
                );
            }

            let id = match fragment.create_type {
                PassCreateType::Template => self.pass_create_from_template_msg(sys, &fragment),
                PassCreateType::Request => self.pass_create_from_request_msg(sys, &fragment),
            };
            let id = match id {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("[dist] cannot create {}: {e:#}", fragment.name);
                    continue;
                }
            };

            sys.add_child(root, id)?;
            if let Err(e) = sys.build(id, false) {
                log::warn!("[dist] build of {} failed: {e:#}", fragment.name);
            }
            log::debug!("[dist] created {} ({})", fragment.name, fragment.pass_class);
            created.push(id);
        }
        Ok(created)
    }

    pub fn pass_create_from_template_msg(
        &mut self,
        sys: &mut dyn PassSystem,
        fragment: &PassGraphFragment,
    ) -> Result<PassId> {
        let template = self.register_template(fragment_template(fragment));
        sys.register_template(template.clone());
        sys.create_pass_from_template(template, &fragment.name)
    }

    pub fn pass_create_from_request_msg(
        &mut self,
        sys: &mut dyn PassSystem,
        fragment: &PassGraphFragment,
    ) -> Result<PassId> {
        let request = fragment_request(fragment);
        sys.find_template(&request.template_name).with_context(|| {
            format!(
                "template {:?} is not available on this node",
                request.template_name
            )
        })?;
        let id = sys.create_pass_from_request(&request)?;
        self.requests.push(request);
        Ok(id)
    }
}
