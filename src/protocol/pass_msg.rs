//! Pass-graph fragment records.
//!
//! A fragment is one `MsgPassGraph` header followed by its slot, connection, image,
//! buffer and comm-info arrays, in that order. Several fragments may sit back to back in
//! one `PassGraph` message body.

use crate::pass_graph::{
    BufferDescriptor, CommOper, CommPassData, ImageDescriptor, PassBufferAttachmentDesc,
    PassConnection, PassImageAttachmentDesc, PassSlot, PassSlotType,
};

use super::{
    cursor::{WireReader, WireWriter},
    error::ProtocolError,
    wire::{
        MsgPassAttBuf, MsgPassAttImg, MsgPassCommInfo, MsgPassConn, MsgPassGraph, MsgPassSlot,
        PassCreateType, SplitInfo, decode_name, encode_name,
    },
};

/// Counts are single bytes on the wire.
pub const MAX_FRAGMENT_ENTRIES: usize = u8::MAX as usize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommInfo {
    pub is_comm_pass: bool,
    pub oper: CommOper,
    pub split: SplitInfo,
}

impl CommInfo {
    pub fn from_data(data: &CommPassData) -> Self {
        Self {
            is_comm_pass: true,
            oper: data.oper,
            split: data.split,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassGraphFragment {
    pub create_type: PassCreateType,
    pub pipeline: String,
    pub name: String,
    pub pass_template: String,
    pub pass_class: String,
    pub slots: Vec<PassSlot>,
    pub connections: Vec<PassConnection>,
    pub images: Vec<PassImageAttachmentDesc>,
    pub buffers: Vec<PassBufferAttachmentDesc>,
    pub comm: Vec<CommInfo>,
}

fn count_u8(what: &'static str, count: usize) -> Result<u8, ProtocolError> {
    u8::try_from(count).map_err(|_| ProtocolError::TooMany {
        what,
        count,
        max: MAX_FRAGMENT_ENTRIES,
    })
}

impl PassGraphFragment {
    pub fn new(create_type: PassCreateType, name: impl Into<String>) -> Self {
        Self {
            create_type,
            pipeline: String::new(),
            name: name.into(),
            pass_template: String::new(),
            pass_class: String::new(),
            slots: Vec::new(),
            connections: Vec::new(),
            images: Vec::new(),
            buffers: Vec::new(),
            comm: Vec::new(),
        }
    }

    /// First entry flagged as a comm pass, as the pass configuration it describes.
    pub fn comm_data(&self) -> Option<CommPassData> {
        self.comm
            .iter()
            .find(|c| c.is_comm_pass)
            .map(|c| CommPassData::new(c.oper, c.split))
    }

    pub fn entry_count(&self) -> usize {
        self.slots.len()
            + self.connections.len()
            + self.images.len()
            + self.buffers.len()
            + self.comm.len()
    }

    fn header(&self) -> Result<MsgPassGraph, ProtocolError> {
        let mut head = MsgPassGraph {
            pass_len: 0,
            create_type: self.create_type as u32,
            slot_cnt: count_u8("slots", self.slots.len())?,
            conn_cnt: count_u8("connections", self.connections.len())?,
            img_cnt: count_u8("image attachments", self.images.len())?,
            buf_cnt: count_u8("buffer attachments", self.buffers.len())?,
            comm_cnt: count_u8("comm infos", self.comm.len())?,
            reserved: [0; 3],
            pipeline: encode_name("pipeline", &self.pipeline)?,
            name: encode_name("name", &self.name)?,
            pass_temp: encode_name("pass template", &self.pass_template)?,
            pass_class: encode_name("pass class", &self.pass_class)?,
        };
        head.pass_len = head.calc_body_len();
        Ok(head)
    }

    pub fn calc_body_len(&self) -> Result<u32, ProtocolError> {
        Ok(self.header()?.pass_len)
    }

    /// Appends the record and returns the number of bytes written.
    pub fn encode_into(&self, w: &mut WireWriter) -> Result<u32, ProtocolError> {
        let head = self.header()?;
        let start = w.len();
        w.put_pod(&head);

        for slot in &self.slots {
            w.put_pod(&MsgPassSlot {
                slot_type: slot.slot_type.as_u32(),
                pad: 0,
                slot_name: encode_name("slot name", &slot.name)?,
            });
        }
        for conn in &self.connections {
            w.put_pod(&MsgPassConn {
                local_slot: encode_name("local slot", &conn.local_slot)?,
                ref_pass_name: encode_name("ref pass", &conn.attachment_ref.pass)?,
                ref_att_name: encode_name("ref attachment", &conn.attachment_ref.attachment)?,
            });
        }
        for img in &self.images {
            w.put_pod(&MsgPassAttImg {
                bind_flags: img.image.bind_flags,
                width: img.image.width,
                height: img.image.height,
                depth: img.image.depth,
                array_size: img.image.array_size,
                format: img.image.format,
                name: encode_name("image attachment", &img.name)?,
            });
        }
        for buf in &self.buffers {
            w.put_pod(&MsgPassAttBuf {
                size: buf.buffer.byte_count,
                align: buf.buffer.alignment,
                bind_flags: buf.buffer.bind_flags,
                pad: 0,
                name: encode_name("buffer attachment", &buf.name)?,
            });
        }
        for comm in &self.comm {
            w.put_pod(&MsgPassCommInfo {
                is_comm_pass: comm.is_comm_pass as u16,
                comm_oper: comm.oper.as_u16(),
                split_cnt: comm.split.split_cnt,
                split_idx: comm.split.split_idx,
            });
        }

        let written = (w.len() - start) as u32;
        debug_assert_eq!(written, head.pass_len);
        Ok(written)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = WireWriter::new();
        self.encode_into(&mut w)?;
        Ok(w.into_inner())
    }

    /// Decodes exactly one record. The reader must hold the record and nothing else
    /// the caller cares about; trailing bytes are left unread.
    pub fn decode_record(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let head: MsgPassGraph = r.read_pod("pass graph header")?;
        let create_type = PassCreateType::from_u32(head.create_type)
            .ok_or(ProtocolError::UnknownCreateType(head.create_type))?;

        let slots = r
            .read_array::<MsgPassSlot>("slots", head.slot_cnt as usize)?
            .iter()
            .map(|s| {
                Ok(PassSlot {
                    name: decode_name("slot name", &s.slot_name)?,
                    slot_type: PassSlotType::from_u32(s.slot_type)
                        .ok_or(ProtocolError::UnknownSlotType(s.slot_type))?,
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let connections = r
            .read_array::<MsgPassConn>("connections", head.conn_cnt as usize)?
            .iter()
            .map(|c| {
                Ok(PassConnection::new(
                    decode_name("local slot", &c.local_slot)?,
                    decode_name("ref pass", &c.ref_pass_name)?,
                    decode_name("ref attachment", &c.ref_att_name)?,
                ))
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let images = r
            .read_array::<MsgPassAttImg>("image attachments", head.img_cnt as usize)?
            .iter()
            .map(|i| {
                Ok(PassImageAttachmentDesc {
                    name: decode_name("image attachment", &i.name)?,
                    image: ImageDescriptor {
                        bind_flags: i.bind_flags,
                        width: i.width,
                        height: i.height,
                        depth: i.depth,
                        array_size: i.array_size,
                        format: i.format,
                    },
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let buffers = r
            .read_array::<MsgPassAttBuf>("buffer attachments", head.buf_cnt as usize)?
            .iter()
            .map(|b| {
                Ok(PassBufferAttachmentDesc {
                    name: decode_name("buffer attachment", &b.name)?,
                    buffer: BufferDescriptor {
                        byte_count: b.size,
                        alignment: b.align,
                        bind_flags: b.bind_flags,
                    },
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let comm = r
            .read_array::<MsgPassCommInfo>("comm infos", head.comm_cnt as usize)?
            .iter()
            .map(|c| {
                Ok(CommInfo {
                    is_comm_pass: c.is_comm_pass != 0,
                    oper: CommOper::from_u16(c.comm_oper)
                        .ok_or(ProtocolError::UnknownCommOper(c.comm_oper))?,
                    split: SplitInfo::new(c.split_cnt, c.split_idx),
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        Ok(Self {
            create_type,
            pipeline: decode_name("pipeline", &head.pipeline)?,
            name: decode_name("name", &head.name)?,
            pass_template: decode_name("pass template", &head.pass_temp)?,
            pass_class: decode_name("pass class", &head.pass_class)?,
            slots,
            connections,
            images,
            buffers,
            comm,
        })
    }
}

pub fn encode_fragments(fragments: &[PassGraphFragment]) -> Result<Vec<u8>, ProtocolError> {
    let mut w = WireWriter::new();
    for fragment in fragments {
        fragment.encode_into(&mut w)?;
    }
    Ok(w.into_inner())
}

/// Walks a `PassGraph` body fragment by fragment.
///
/// A fragment whose header is intact but whose contents are bad (unknown create type,
/// bad name) yields an error and the walk continues at the next record. A header whose
/// `pass_len` disagrees with its counts, or runs past the body, makes every following
/// offset untrustworthy: the error is yielded and iteration stops.
pub struct FragmentIter<'a> {
    reader: WireReader<'a>,
    done: bool,
}

pub fn decode_fragments(body: &[u8]) -> FragmentIter<'_> {
    FragmentIter {
        reader: WireReader::new(body),
        done: false,
    }
}

impl FragmentIter<'_> {
    /// Offset of the next unread record.
    pub fn offset(&self) -> usize {
        self.reader.position()
    }
}

impl Iterator for FragmentIter<'_> {
    type Item = Result<PassGraphFragment, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.reader.is_empty() {
            return None;
        }

        let head: MsgPassGraph = match self.reader.peek_pod("pass graph header") {
            Ok(h) => h,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let computed = head.calc_body_len();
        if head.pass_len != computed {
            self.done = true;
            return Some(Err(ProtocolError::LengthMismatch {
                declared: head.pass_len,
                computed,
            }));
        }

        let declared = head.pass_len as usize;
        let mut record = match self.reader.take("pass graph record", declared) {
            Ok(r) => r,
            Err(_) => {
                self.done = true;
                return Some(Err(ProtocolError::RecordOverrun {
                    declared,
                    remaining: self.reader.remaining(),
                }));
            }
        };

        Some(PassGraphFragment::decode_record(&mut record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shadow_pre_fragment() -> PassGraphFragment {
        let mut f = PassGraphFragment::new(PassCreateType::Template, "Shadow_DistPre");
        f.pass_template = "FullscreenShadowPassDistPreTemplate".to_string();
        f.pass_class = "CommPass".to_string();
        for name in ["DirectionalShadowmaps", "Depth"] {
            f.slots.push(PassSlot::new(name, PassSlotType::InputOutput));
            f.connections
                .push(PassConnection::new(name, "This", format!("{name}Att")));
            f.images.push(PassImageAttachmentDesc {
                name: format!("{name}Att"),
                image: ImageDescriptor {
                    bind_flags: 3,
                    width: 1920,
                    height: 1080,
                    depth: 1,
                    array_size: 4,
                    format: 28,
                },
            });
        }
        f.buffers.push(PassBufferAttachmentDesc {
            name: "Params".to_string(),
            buffer: BufferDescriptor {
                byte_count: 256,
                alignment: 16,
                bind_flags: 1,
            },
        });
        f.comm.push(CommInfo {
            is_comm_pass: true,
            oper: CommOper::PrepareInput,
            split: SplitInfo::new(3, 2),
        });
        f
    }

    #[test]
    fn calc_body_len_matches_consumed_span() {
        let f = shadow_pre_fragment();
        let bytes = f.encode().unwrap();
        assert_eq!(f.calc_body_len().unwrap() as usize, bytes.len());

        let mut r = WireReader::new(&bytes);
        let back = PassGraphFragment::decode_record(&mut r).unwrap();
        assert_eq!(r.position(), bytes.len());
        assert_eq!(back, f);
        assert_eq!(back.entry_count(), 2 + 2 + 2 + 1 + 1);
        assert_eq!(
            back.comm_data(),
            Some(CommPassData::new(CommOper::PrepareInput, SplitInfo::new(3, 2)))
        );
    }

    #[test]
    fn unknown_create_type_skips_only_that_fragment() {
        let good = shadow_pre_fragment();
        let mut body = good.encode().unwrap();
        // create_type lives right after pass_len.
        body[4..8].copy_from_slice(&7u32.to_ne_bytes());
        body.extend(good.encode().unwrap());

        let results: Vec<_> = decode_fragments(&body).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Err(ProtocolError::UnknownCreateType(7)));
        assert_eq!(results[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn inflated_slot_count_stops_without_overrun() {
        let f = shadow_pre_fragment();
        let mut body = f.encode().unwrap();
        // slot_cnt is the first count byte after pass_len/create_type.
        body[8] = 200;

        let results: Vec<_> = decode_fragments(&body).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ProtocolError::LengthMismatch { .. })));

        // Even when pass_len is forged to agree with the counts, the record is rejected
        // before any slot is read.
        let mut head: MsgPassGraph = bytemuck::pod_read_unaligned(&body[..size_of::<MsgPassGraph>()]);
        head.pass_len = head.calc_body_len();
        body[..size_of::<MsgPassGraph>()].copy_from_slice(bytemuck::bytes_of(&head));
        let results: Vec<_> = decode_fragments(&body).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ProtocolError::RecordOverrun { .. })));
    }

    #[test]
    fn too_many_entries_rejected_on_encode() {
        let mut f = PassGraphFragment::new(PassCreateType::Request, "Big");
        f.slots = (0..256)
            .map(|i| PassSlot::new(format!("s{i}"), PassSlotType::Input))
            .collect();
        assert!(matches!(
            f.encode(),
            Err(ProtocolError::TooMany { count: 256, .. })
        ));
    }
}
