//! Value types shared by the pass graph, the wire codec and the distribution engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::protocol::{MAX_MESSAGE_LEN, SplitInfo};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassSlotType {
    Input,
    Output,
    #[default]
    InputOutput,
    Uninitialized,
}

impl PassSlotType {
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::InputOutput => 2,
            Self::Uninitialized => 3,
        }
    }

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            2 => Some(Self::InputOutput),
            3 => Some(Self::Uninitialized),
            _ => None,
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Self::Output | Self::InputOutput)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Output => "Output",
            Self::InputOutput => "InputOutput",
            Self::Uninitialized => "Unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSlot {
    pub name: String,
    #[serde(default)]
    pub slot_type: PassSlotType,
}

impl PassSlot {
    pub fn new(name: impl Into<String>, slot_type: PassSlotType) -> Self {
        Self {
            name: name.into(),
            slot_type,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassAttachmentRef {
    pub pass: String,
    pub attachment: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassConnection {
    pub local_slot: String,
    pub attachment_ref: PassAttachmentRef,
}

impl PassConnection {
    pub fn new(
        local_slot: impl Into<String>,
        pass: impl Into<String>,
        attachment: impl Into<String>,
    ) -> Self {
        Self {
            local_slot: local_slot.into(),
            attachment_ref: PassAttachmentRef {
                pass: pass.into(),
                attachment: attachment.into(),
            },
        }
    }
}

/// Attachment reference meaning "an attachment declared by this pass".
pub const THIS_PASS: &str = "This";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDescriptor {
    pub bind_flags: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub format: u32,
}

impl ImageDescriptor {
    /// Host staging size, assuming four bytes per texel when the format is opaque to us.
    /// `None` when the extent overflows or would not fit in one message.
    pub fn byte_size(&self) -> Option<usize> {
        let texel = match self.format {
            0 => 4,
            f => format_texel_size(f),
        };
        [self.width, self.height, self.depth, self.array_size]
            .into_iter()
            .try_fold(texel, |acc, dim| acc.checked_mul(dim.max(1) as usize))
            .filter(|&size| size <= MAX_MESSAGE_LEN as usize)
    }
}

fn format_texel_size(format: u32) -> usize {
    // Coarse buckets of the engine's format enum; precise sizes live in the GPU layer.
    match format {
        1..=8 => 1,
        9..=20 => 2,
        21..=40 => 4,
        41..=60 => 8,
        _ => 16,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferDescriptor {
    pub byte_count: u64,
    pub alignment: u64,
    pub bind_flags: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassImageAttachmentDesc {
    pub name: String,
    #[serde(default)]
    pub image: ImageDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassBufferAttachmentDesc {
    pub name: String,
    #[serde(default)]
    pub buffer: BufferDescriptor,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommOper {
    #[default]
    None,
    CopyInput,
    PrepareInput,
    CopyOutput,
    MergeOutput,
}

impl CommOper {
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::CopyInput => 1,
            Self::PrepareInput => 2,
            Self::CopyOutput => 3,
            Self::MergeOutput => 4,
        }
    }

    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::CopyInput),
            2 => Some(Self::PrepareInput),
            3 => Some(Self::CopyOutput),
            4 => Some(Self::MergeOutput),
            _ => None,
        }
    }

    /// Drains the inbound data queue before the pass runs.
    pub fn drains(self) -> bool {
        matches!(self, Self::MergeOutput | Self::PrepareInput)
    }

    /// Pushes a payload to the outbound data queue after the pass runs.
    pub fn sends(self) -> bool {
        matches!(self, Self::CopyInput | Self::CopyOutput)
    }
}

/// Per-pass configuration of a comm pass. Fixed when the pass is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommPassData {
    pub oper: CommOper,
    pub split: SplitInfo,
    pub use_copy_queue: bool,
    pub submit: bool,
}

impl Default for CommPassData {
    fn default() -> Self {
        Self {
            oper: CommOper::None,
            split: SplitInfo::default(),
            use_copy_queue: false,
            submit: true,
        }
    }
}

impl CommPassData {
    pub fn new(oper: CommOper, split: SplitInfo) -> Self {
        Self {
            oper,
            split,
            ..Default::default()
        }
    }
}

pub const COMM_PASS_CLASS: &str = "CommPass";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassTemplate {
    pub name: String,
    pub pass_class: String,
    pub slots: Vec<PassSlot>,
    pub connections: Vec<PassConnection>,
    pub image_attachments: Vec<PassImageAttachmentDesc>,
    pub buffer_attachments: Vec<PassBufferAttachmentDesc>,
    pub comm: Option<CommPassData>,
}

impl PassTemplate {
    pub fn new(name: impl Into<String>, pass_class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pass_class: pass_class.into(),
            ..Default::default()
        }
    }

    pub fn slot(&self, name: &str) -> Option<&PassSlot> {
        self.slots.iter().find(|s| s.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassRequest {
    pub pass_name: String,
    pub template_name: String,
    pub connections: Vec<PassConnection>,
    pub image_overrides: Vec<PassImageAttachmentDesc>,
    pub buffer_overrides: Vec<PassBufferAttachmentDesc>,
    pub comm: Option<CommPassData>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    Image(ImageDescriptor),
    Buffer(BufferDescriptor),
}

impl AttachmentKind {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }

    pub fn byte_size(&self) -> Option<usize> {
        match self {
            Self::Image(image) => image.byte_size(),
            Self::Buffer(buffer) => usize::try_from(buffer.byte_count)
                .ok()
                .filter(|&size| size <= MAX_MESSAGE_LEN as usize),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassAttachment {
    pub name: String,
    /// Name of the pass that declared the attachment.
    pub owner: String,
    pub kind: AttachmentKind,
}

impl PassAttachment {
    /// Globally unique key, used to address host-visible memory.
    pub fn key(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }

    pub fn image(&self) -> Option<ImageDescriptor> {
        match self.kind {
            AttachmentKind::Image(image) => Some(image),
            AttachmentKind::Buffer(_) => None,
        }
    }

    pub fn buffer(&self) -> Option<BufferDescriptor> {
        match self.kind {
            AttachmentKind::Buffer(buffer) => Some(buffer),
            AttachmentKind::Image(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassAttachmentBinding {
    pub name: String,
    pub slot_type: PassSlotType,
    pub attachment: Option<Arc<PassAttachment>>,
}

impl PassAttachmentBinding {
    pub fn attachment_kind(&self) -> Option<&AttachmentKind> {
        self.attachment.as_ref().map(|a| &a.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_counts_every_dimension() {
        let image = ImageDescriptor {
            width: 64,
            height: 32,
            depth: 0,
            array_size: 2,
            format: 28,
            ..Default::default()
        };
        assert_eq!(image.byte_size(), Some(64 * 32 * 2 * 4));
    }

    #[test]
    fn corrupt_image_extent_has_no_size() {
        let image = ImageDescriptor {
            bind_flags: 0,
            width: u32::MAX,
            height: u32::MAX,
            depth: u32::MAX,
            array_size: u32::MAX,
            format: 100,
        };
        assert_eq!(image.byte_size(), None);

        let wide = ImageDescriptor {
            width: 1 << 20,
            height: 1 << 10,
            ..Default::default()
        };
        assert_eq!(AttachmentKind::Image(wide).byte_size(), None);

        let huge = BufferDescriptor {
            byte_count: u64::MAX,
            ..Default::default()
        };
        assert_eq!(AttachmentKind::Buffer(huge).byte_size(), None);
    }
}
