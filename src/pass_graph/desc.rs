//! JSON description of a pass graph, as loaded by the binary.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::{
    PassId, PassSystem,
    types::{
        ImageDescriptor, PassConnection, PassImageAttachmentDesc, PassRequest, PassSlot,
        PassSlotType, PassTemplate, THIS_PASS,
    },
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassDesc {
    pub name: String,
    /// Empty for parent passes.
    pub template: String,
    pub connections: Vec<PassConnection>,
    pub children: Vec<PassDesc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphDesc {
    pub templates: Vec<PassTemplate>,
    pub root: PassDesc,
}

impl GraphDesc {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read graph {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse graph {}", path.display()))
    }

    /// Registers the templates and creates the tree; returns the root pass.
    pub fn instantiate(&self, sys: &mut dyn PassSystem) -> Result<PassId> {
        for template in &self.templates {
            sys.register_template(Arc::new(template.clone()));
        }
        let root = instantiate_pass(sys, &self.root)?;
        sys.build(root, false)
            .with_context(|| format!("failed to build {:?}", self.root.name))?;
        Ok(root)
    }

    /// A forward pipeline with one fullscreen shadow pass between a depth producer and
    /// a lighting consumer.
    pub fn shadow_pipeline() -> Self {
        let image = ImageDescriptor {
            bind_flags: 3,
            width: 64,
            height: 64,
            depth: 1,
            array_size: 1,
            format: 28,
        };

        let mut depth = PassTemplate::new("DepthPrePassTemplate", "Raster");
        depth.slots.push(PassSlot::new("Depth", PassSlotType::Output));
        depth
            .connections
            .push(PassConnection::new("Depth", THIS_PASS, "DepthImage"));
        depth.image_attachments.push(PassImageAttachmentDesc {
            name: "DepthImage".to_string(),
            image,
        });

        let mut shadow = PassTemplate::new("FullscreenShadowTemplate", "FullscreenShadowPass");
        shadow.slots.push(PassSlot::new("Depth", PassSlotType::Input));
        shadow.slots.push(PassSlot::new("Output", PassSlotType::Output));
        shadow
            .connections
            .push(PassConnection::new("Output", THIS_PASS, "ShadowImage"));
        shadow.image_attachments.push(PassImageAttachmentDesc {
            name: "ShadowImage".to_string(),
            image,
        });

        let mut light = PassTemplate::new("LightingTemplate", "Raster");
        light.slots.push(PassSlot::new("Shadow", PassSlotType::Input));

        Self {
            templates: vec![depth, shadow, light],
            root: PassDesc {
                name: "MainPipeline".to_string(),
                children: vec![
                    PassDesc {
                        name: "DepthPrePass".to_string(),
                        template: "DepthPrePassTemplate".to_string(),
                        ..Default::default()
                    },
                    PassDesc {
                        name: "SunFullscreenShadowPass".to_string(),
                        template: "FullscreenShadowTemplate".to_string(),
                        connections: vec![PassConnection::new("Depth", "DepthPrePass", "Depth")],
                        ..Default::default()
                    },
                    PassDesc {
                        name: "LightingPass".to_string(),
                        template: "LightingTemplate".to_string(),
                        connections: vec![PassConnection::new(
                            "Shadow",
                            "SunFullscreenShadowPass",
                            "Output",
                        )],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        }
    }
}

fn instantiate_pass(sys: &mut dyn PassSystem, desc: &PassDesc) -> Result<PassId> {
    if desc.template.is_empty() {
        if !desc.connections.is_empty() {
            bail!("parent pass {:?} cannot carry connections", desc.name);
        }
        let id = sys.create_parent_pass(&desc.name)?;
        for child in &desc.children {
            let child_id = instantiate_pass(sys, child)?;
            sys.add_child(id, child_id)?;
        }
        return Ok(id);
    }

    if !desc.children.is_empty() {
        bail!("leaf pass {:?} cannot have children", desc.name);
    }
    sys.create_pass_from_request(&PassRequest {
        pass_name: desc.name.clone(),
        template_name: desc.template.clone(),
        connections: desc.connections.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass_graph::PassTree;

    #[test]
    fn shadow_pipeline_builds_and_round_trips_json() {
        let desc = GraphDesc::shadow_pipeline();
        let text = serde_json::to_string_pretty(&desc).unwrap();
        let back: GraphDesc = serde_json::from_str(&text).unwrap();
        assert_eq!(back, desc);

        let mut tree = PassTree::new();
        let root = back.instantiate(&mut tree).unwrap();
        assert_eq!(tree.children(root).len(), 3);

        let light = tree.find_pass("LightingPass").unwrap();
        let shadow_img = tree
            .pass(tree.find_pass("SunFullscreenShadowPass").unwrap())
            .unwrap()
            .attachment("ShadowImage")
            .cloned();
        assert_eq!(
            tree.pass(light).unwrap().input_binding(0).unwrap().attachment,
            shadow_img
        );
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let desc: GraphDesc = serde_json::from_str(
            r#"{ "templates": [ { "name": "T", "slots": [ { "name": "In" } ] } ],
                 "root": { "name": "Root", "children": [ { "name": "P", "template": "T" } ] } }"#,
        )
        .unwrap();
        assert_eq!(desc.templates[0].slots[0].slot_type, PassSlotType::InputOutput);
        let mut tree = PassTree::new();
        desc.instantiate(&mut tree).unwrap();
        assert!(tree.find_pass("P").is_some());
    }
}
