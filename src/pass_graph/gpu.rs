//! Copy submission surface and a host-memory stand-in for GPU resources.

use std::collections::HashMap;

use anyhow::Result;

use crate::protocol::SplitInfo;

use super::types::{AttachmentKind, ImageDescriptor, PassAttachment};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyItem {
    Buffer {
        src: String,
        dst: String,
        size: u64,
    },
    Image {
        src: String,
        dst: String,
        image: ImageDescriptor,
    },
    BufferToImage {
        src: String,
        dst: String,
        image: ImageDescriptor,
    },
    ImageToBuffer {
        src: String,
        dst: String,
        image: ImageDescriptor,
    },
}

impl CopyItem {
    /// Picks the copy kind from the two attachment kinds.
    pub fn between(src: &PassAttachment, dst: &PassAttachment) -> Self {
        let (s, d) = (src.key(), dst.key());
        match (&src.kind, &dst.kind) {
            (AttachmentKind::Buffer(a), AttachmentKind::Buffer(b)) => Self::Buffer {
                src: s,
                dst: d,
                size: a.byte_count.min(b.byte_count),
            },
            (AttachmentKind::Image(image), AttachmentKind::Image(_)) => Self::Image {
                src: s,
                dst: d,
                image: *image,
            },
            (AttachmentKind::Buffer(_), AttachmentKind::Image(image)) => Self::BufferToImage {
                src: s,
                dst: d,
                image: *image,
            },
            (AttachmentKind::Image(image), AttachmentKind::Buffer(_)) => Self::ImageToBuffer {
                src: s,
                dst: d,
                image: *image,
            },
        }
    }

    pub fn src(&self) -> &str {
        match self {
            Self::Buffer { src, .. }
            | Self::Image { src, .. }
            | Self::BufferToImage { src, .. }
            | Self::ImageToBuffer { src, .. } => src,
        }
    }

    pub fn dst(&self) -> &str {
        match self {
            Self::Buffer { dst, .. }
            | Self::Image { dst, .. }
            | Self::BufferToImage { dst, .. }
            | Self::ImageToBuffer { dst, .. } => dst,
        }
    }

    pub fn byte_size(&self) -> Option<usize> {
        match self {
            Self::Buffer { size, .. } => usize::try_from(*size).ok(),
            Self::Image { image, .. }
            | Self::BufferToImage { image, .. }
            | Self::ImageToBuffer { image, .. } => image.byte_size(),
        }
    }
}

pub trait CommandList {
    fn submit(&mut self, item: &CopyItem) -> Result<()>;
}

/// Keeps every submitted copy; used where no device is attached.
#[derive(Debug, Default)]
pub struct RecordingCommandList {
    pub submitted: Vec<CopyItem>,
}

impl CommandList for RecordingCommandList {
    fn submit(&mut self, item: &CopyItem) -> Result<()> {
        self.submitted.push(item.clone());
        Ok(())
    }
}

/// Host-visible memory keyed by attachment key (`owner.name`).
#[derive(Debug, Default)]
pub struct HostMemory {
    regions: HashMap<String, Vec<u8>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, key: &str, bytes: &[u8]) {
        self.regions.insert(key.to_string(), bytes.to_vec());
    }

    pub fn read(&self, key: &str) -> Option<&[u8]> {
        self.regions.get(key).map(Vec::as_slice)
    }

    /// Places one shard's payload at band `split_idx` of a region of `size` bytes.
    /// Bands are `size / split_cnt` wide, the last one takes the remainder; a payload
    /// longer than its band is cut.
    pub fn merge_split(&mut self, key: &str, size: usize, split: SplitInfo, bytes: &[u8]) {
        let bands = usize::from(split.split_cnt.max(1));
        let idx = usize::from(split.split_idx);
        if idx >= bands {
            log::warn!("[gpu] merge into {key}: band {idx} of {bands} out of range");
            return;
        }
        let band = size / bands;
        let start = band * idx;
        let end = if idx + 1 == bands { size } else { start + band };

        let region = self.regions.entry(key.to_string()).or_default();
        region.resize(size, 0);
        let n = bytes.len().min(end - start);
        region[start..start + n].copy_from_slice(&bytes[..n]);
    }
}

/// Performs copies directly between host regions.
impl CommandList for HostMemory {
    fn submit(&mut self, item: &CopyItem) -> Result<()> {
        let Some(src) = self.regions.get(item.src()) else {
            log::trace!("[gpu] copy {} -> {}: source empty", item.src(), item.dst());
            return Ok(());
        };
        let bytes = src.clone();
        self.regions.insert(item.dst().to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass_graph::BufferDescriptor;

    fn att(owner: &str, name: &str, kind: AttachmentKind) -> PassAttachment {
        PassAttachment {
            name: name.to_string(),
            owner: owner.to_string(),
            kind,
        }
    }

    #[test]
    fn copy_kind_follows_attachment_kinds() {
        let img = att("A", "Color", AttachmentKind::Image(ImageDescriptor::default()));
        let buf = att(
            "B",
            "Staging",
            AttachmentKind::Buffer(BufferDescriptor {
                byte_count: 64,
                ..Default::default()
            }),
        );
        assert!(matches!(CopyItem::between(&img, &buf), CopyItem::ImageToBuffer { .. }));
        assert!(matches!(CopyItem::between(&buf, &img), CopyItem::BufferToImage { .. }));
        assert!(matches!(CopyItem::between(&img, &img), CopyItem::Image { .. }));
        let item = CopyItem::between(&buf, &buf);
        assert_eq!(item.byte_size(), Some(64));
        assert_eq!(item.src(), "B.Staging");
    }

    #[test]
    fn merge_places_bands_by_split_index() {
        let mut mem = HostMemory::new();
        mem.merge_split("Out", 6, SplitInfo::new(3, 2), &[3, 3]);
        mem.merge_split("Out", 6, SplitInfo::new(3, 1), &[2, 2]);
        assert_eq!(mem.read("Out").unwrap(), &[0, 0, 2, 2, 3, 3]);
    }

    #[test]
    fn merge_keeps_the_declared_size() {
        let mut mem = HostMemory::new();
        mem.write("Out", &[1; 10]);
        // Full-size shard payloads only contribute their own band.
        mem.merge_split("Out", 10, SplitInfo::new(3, 1), &[7; 10]);
        mem.merge_split("Out", 10, SplitInfo::new(3, 2), &[8; 10]);
        assert_eq!(mem.read("Out").unwrap(), &[1, 1, 1, 7, 7, 7, 8, 8, 8, 8]);

        mem.merge_split("Out", 10, SplitInfo::new(3, 5), &[9; 10]);
        assert_eq!(mem.read("Out").unwrap().len(), 10);
    }

    #[test]
    fn host_copy_moves_bytes() {
        let mut mem = HostMemory::new();
        mem.write("A.Color", &[9, 8, 7]);
        mem.submit(&CopyItem::Image {
            src: "A.Color".to_string(),
            dst: "B.Color".to_string(),
            image: ImageDescriptor::default(),
        })
        .unwrap();
        assert_eq!(mem.read("B.Color").unwrap(), &[9, 8, 7]);
    }
}
