//! In-memory pass tree: an arena of passes addressed by `PassId`, with a template
//! library and a name index.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};

use super::{
    PassSystem,
    types::{
        AttachmentKind, CommPassData, PassAttachment, PassAttachmentBinding, PassConnection,
        PassRequest, PassSlotType, PassTemplate, THIS_PASS,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u32);

impl PassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct Pass {
    pub name: String,
    /// `None` for parent passes.
    pub template: Option<Arc<PassTemplate>>,
    pub connections: Vec<PassConnection>,
    pub parent: Option<PassId>,
    /// `Some` for parent passes, which own an ordered child list.
    pub children: Option<Vec<PassId>>,
    pub attachments: Vec<Arc<PassAttachment>>,
    pub bindings: Vec<PassAttachmentBinding>,
    pub comm: Option<CommPassData>,
    pub build_count: u32,
    pub needs_build: bool,
}

impl Pass {
    fn leaf(name: &str, template: Arc<PassTemplate>, request: Option<&PassRequest>) -> Self {
        let mut connections = template.connections.clone();
        let mut images = template.image_attachments.clone();
        let mut buffers = template.buffer_attachments.clone();
        let mut comm = template.comm;

        if let Some(req) = request {
            for conn in &req.connections {
                upsert_connection(&mut connections, conn.clone());
            }
            for img in &req.image_overrides {
                match images.iter_mut().find(|i| i.name == img.name) {
                    Some(slot) => *slot = img.clone(),
                    None => images.push(img.clone()),
                }
            }
            for buf in &req.buffer_overrides {
                match buffers.iter_mut().find(|b| b.name == buf.name) {
                    Some(slot) => *slot = buf.clone(),
                    None => buffers.push(buf.clone()),
                }
            }
            if req.comm.is_some() {
                comm = req.comm;
            }
        }

        let attachments = images
            .into_iter()
            .map(|i| PassAttachment {
                name: i.name,
                owner: name.to_string(),
                kind: AttachmentKind::Image(i.image),
            })
            .chain(buffers.into_iter().map(|b| PassAttachment {
                name: b.name,
                owner: name.to_string(),
                kind: AttachmentKind::Buffer(b.buffer),
            }))
            .map(Arc::new)
            .collect();

        Self {
            name: name.to_string(),
            template: Some(template),
            connections,
            parent: None,
            children: None,
            attachments,
            bindings: Vec::new(),
            comm,
            build_count: 0,
            needs_build: false,
        }
    }

    fn parent_pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            template: None,
            connections: Vec::new(),
            parent: None,
            children: Some(Vec::new()),
            attachments: Vec::new(),
            bindings: Vec::new(),
            comm: None,
            build_count: 0,
            needs_build: false,
        }
    }

    pub fn is_parent(&self) -> bool {
        self.children.is_some()
    }

    pub fn is_built(&self) -> bool {
        self.build_count > 0
    }

    pub fn pass_class(&self) -> &str {
        self.template.as_ref().map_or("Parent", |t| t.pass_class.as_str())
    }

    pub fn template_name(&self) -> &str {
        self.template.as_ref().map_or("", |t| t.name.as_str())
    }

    pub fn children(&self) -> &[PassId] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Replaces the connection on `conn.local_slot`, or adds it.
    pub fn set_connection(&mut self, conn: PassConnection) {
        upsert_connection(&mut self.connections, conn);
    }

    pub fn connection(&self, local_slot: &str) -> Option<&PassConnection> {
        self.connections.iter().find(|c| c.local_slot == local_slot)
    }

    pub fn clear_connections(&mut self) {
        self.connections.clear();
    }

    pub fn attachment(&self, name: &str) -> Option<&Arc<PassAttachment>> {
        self.attachments.iter().find(|a| a.name == name)
    }

    pub fn binding(&self, slot: &str) -> Option<&PassAttachmentBinding> {
        self.bindings.iter().find(|b| b.name == slot)
    }

    pub fn input_binding(&self, i: usize) -> Option<&PassAttachmentBinding> {
        self.bindings.iter().filter(|b| b.slot_type.is_input()).nth(i)
    }

    pub fn output_binding(&self, i: usize) -> Option<&PassAttachmentBinding> {
        self.bindings.iter().filter(|b| b.slot_type.is_output()).nth(i)
    }
}

fn upsert_connection(list: &mut Vec<PassConnection>, conn: PassConnection) {
    match list.iter_mut().find(|c| c.local_slot == conn.local_slot) {
        Some(slot) => *slot = conn,
        None => list.push(conn),
    }
}

#[derive(Default)]
pub struct PassTree {
    passes: Vec<Option<Pass>>,
    free: Vec<u32>,
    by_name: HashMap<String, PassId>,
    templates: HashMap<String, Arc<PassTemplate>>,
}

impl PassTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn alloc(&mut self, pass: Pass) -> Result<PassId> {
        if self.by_name.contains_key(&pass.name) {
            bail!("pass {:?} already exists", pass.name);
        }
        let name = pass.name.clone();
        let id = match self.free.pop() {
            Some(slot) => {
                self.passes[slot as usize] = Some(pass);
                PassId(slot)
            }
            None => {
                self.passes.push(Some(pass));
                PassId((self.passes.len() - 1) as u32)
            }
        };
        self.by_name.insert(name, id);
        Ok(id)
    }

    fn get(&self, id: PassId) -> Result<&Pass> {
        self.passes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("stale pass id {id:?}"))
    }

    fn get_mut(&mut self, id: PassId) -> Result<&mut Pass> {
        self.passes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| anyhow!("stale pass id {id:?}"))
    }

    fn free_subtree(&mut self, id: PassId) {
        let Some(pass) = self.passes.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        self.by_name.remove(&pass.name);
        self.free.push(id.0);
        for child in pass.children.unwrap_or_default() {
            self.free_subtree(child);
        }
    }

    fn children_mut(&mut self, parent: PassId) -> Result<&mut Vec<PassId>> {
        let pass = self.get_mut(parent)?;
        let name = pass.name.clone();
        pass.children
            .as_mut()
            .ok_or_else(|| anyhow!("pass {name:?} is not a parent pass"))
    }

    fn detach(&mut self, child: PassId) -> Result<()> {
        if let Some(old_parent) = self.get(child)?.parent {
            self.children_mut(old_parent)?.retain(|c| *c != child);
        }
        Ok(())
    }

    /// Resolves one connection to the attachment it names, if it exists yet.
    fn resolve(&self, owner: &Pass, conn: &PassConnection) -> Option<Arc<PassAttachment>> {
        let target = &conn.attachment_ref;
        if target.pass == THIS_PASS || target.pass == owner.name {
            return owner.attachment(&target.attachment).cloned();
        }
        let other = self.by_name.get(&target.pass).and_then(|id| self.get(*id).ok())?;
        other
            .attachment(&target.attachment)
            .or_else(|| other.binding(&target.attachment)?.attachment.as_ref())
            .cloned()
    }

    fn build_leaf(&mut self, id: PassId) -> Result<()> {
        let pass = self.get(id)?;
        let Some(template) = pass.template.clone() else {
            return Ok(());
        };

        for conn in &pass.connections {
            if template.slot(&conn.local_slot).is_none() {
                bail!(
                    "pass {:?} connects unknown slot {:?} (template {:?})",
                    pass.name,
                    conn.local_slot,
                    template.name
                );
            }
        }

        let bindings = template
            .slots
            .iter()
            .map(|slot| {
                let attachment = pass
                    .connection(&slot.name)
                    .and_then(|conn| self.resolve(pass, conn));
                if attachment.is_none() && slot.slot_type != PassSlotType::Uninitialized {
                    log::debug!("[pass] {}.{} is unbound", pass.name, slot.name);
                }
                PassAttachmentBinding {
                    name: slot.name.clone(),
                    slot_type: slot.slot_type,
                    attachment,
                }
            })
            .collect();

        let pass = self.get_mut(id)?;
        pass.bindings = bindings;
        pass.build_count += 1;
        pass.needs_build = false;
        Ok(())
    }

    /// Builds every pass marked by a deferred build.
    pub fn flush_deferred(&mut self) -> Result<usize> {
        let pending: Vec<PassId> = self
            .passes
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().filter(|p| p.needs_build).map(|_| PassId(i as u32)))
            .collect();
        for id in &pending {
            self.build(*id, false)?;
        }
        Ok(pending.len())
    }

    /// Depth-first leaf collection under `root`.
    pub fn leaves(&self, root: PassId) -> Vec<PassId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Ok(pass) = self.get(id) else { continue };
            match &pass.children {
                Some(children) => stack.extend(children.iter().rev()),
                None => out.push(id),
            }
        }
        out
    }
}

impl PassSystem for PassTree {
    fn register_template(&mut self, template: Arc<PassTemplate>) {
        self.templates.insert(template.name.clone(), template);
    }

    fn find_template(&self, name: &str) -> Option<Arc<PassTemplate>> {
        self.templates.get(name).cloned()
    }

    fn create_pass_from_template(
        &mut self,
        template: Arc<PassTemplate>,
        name: &str,
    ) -> Result<PassId> {
        self.alloc(Pass::leaf(name, template, None))
    }

    fn create_pass_from_request(&mut self, request: &PassRequest) -> Result<PassId> {
        let template = self
            .find_template(&request.template_name)
            .with_context(|| {
                format!(
                    "pass {:?} requests unknown template {:?}",
                    request.pass_name, request.template_name
                )
            })?;
        self.alloc(Pass::leaf(&request.pass_name, template, Some(request)))
    }

    fn create_parent_pass(&mut self, name: &str) -> Result<PassId> {
        self.alloc(Pass::parent_pass(name))
    }

    fn build(&mut self, id: PassId, deferred: bool) -> Result<()> {
        if deferred {
            self.get_mut(id)?.needs_build = true;
            return Ok(());
        }
        let children = self.get(id)?.children.clone();
        match children {
            Some(children) => {
                for child in children {
                    self.build(child, false)?;
                }
                let pass = self.get_mut(id)?;
                pass.build_count += 1;
                pass.needs_build = false;
                Ok(())
            }
            None => self.build_leaf(id),
        }
    }

    fn add_child(&mut self, parent: PassId, child: PassId) -> Result<()> {
        self.detach(child)?;
        self.children_mut(parent)?.push(child);
        self.get_mut(child)?.parent = Some(parent);
        Ok(())
    }

    fn insert_child(&mut self, parent: PassId, child: PassId, index: usize) -> Result<()> {
        self.detach(child)?;
        let children = self.children_mut(parent)?;
        let index = index.min(children.len());
        children.insert(index, child);
        self.get_mut(child)?.parent = Some(parent);
        Ok(())
    }

    fn remove_children(&mut self, parent: PassId) -> Result<()> {
        let removed = std::mem::take(self.children_mut(parent)?);
        for child in removed {
            self.free_subtree(child);
        }
        Ok(())
    }

    fn pass(&self, id: PassId) -> Option<&Pass> {
        self.get(id).ok()
    }

    fn pass_mut(&mut self, id: PassId) -> Option<&mut Pass> {
        self.get_mut(id).ok()
    }

    fn find_pass(&self, name: &str) -> Option<PassId> {
        self.by_name.get(name).copied()
    }
}
