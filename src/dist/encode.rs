//! Conversions between pass descriptions and pass-graph fragments.

use crate::{
    pass_graph::{PassRequest, PassTemplate},
    protocol::{CommInfo, PassCreateType, PassGraphFragment},
};

pub fn template_fragment(template: &PassTemplate, name: &str, pipeline: &str) -> PassGraphFragment {
    PassGraphFragment {
        create_type: PassCreateType::Template,
        pipeline: pipeline.to_string(),
        name: name.to_string(),
        pass_template: template.name.clone(),
        pass_class: template.pass_class.clone(),
        slots: template.slots.clone(),
        connections: template.connections.clone(),
        images: template.image_attachments.clone(),
        buffers: template.buffer_attachments.clone(),
        comm: template.comm.iter().map(CommInfo::from_data).collect(),
    }
}

pub fn request_fragment(request: &PassRequest, pass_class: &str, pipeline: &str) -> PassGraphFragment {
    PassGraphFragment {
        create_type: PassCreateType::Request,
        pipeline: pipeline.to_string(),
        name: request.pass_name.clone(),
        pass_template: request.template_name.clone(),
        pass_class: pass_class.to_string(),
        slots: Vec::new(),
        connections: request.connections.clone(),
        images: request.image_overrides.clone(),
        buffers: request.buffer_overrides.clone(),
        comm: request.comm.iter().map(CommInfo::from_data).collect(),
    }
}

pub fn fragment_template(fragment: &PassGraphFragment) -> PassTemplate {
    PassTemplate {
        name: fragment.pass_template.clone(),
        pass_class: fragment.pass_class.clone(),
        slots: fragment.slots.clone(),
        connections: fragment.connections.clone(),
        image_attachments: fragment.images.clone(),
        buffer_attachments: fragment.buffers.clone(),
        comm: fragment.comm_data(),
    }
}

pub fn fragment_request(fragment: &PassGraphFragment) -> PassRequest {
    PassRequest {
        pass_name: fragment.name.clone(),
        template_name: fragment.pass_template.clone(),
        connections: fragment.connections.clone(),
        image_overrides: fragment.images.clone(),
        buffer_overrides: fragment.buffers.clone(),
        comm: fragment.comm_data(),
    }
}
