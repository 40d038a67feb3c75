//! Fixed-layout wire records.
//!
//! Every record is `#[repr(C)]` + `Pod` so its in-memory image is exactly the bytes
//! on the socket (native endian). Layouts must not contain implicit padding; where the
//! native C layout would pad, the bytes are spelled out as named fields.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use super::error::ProtocolError;

/// Size of every fixed string field on the wire.
pub const PASS_NAME_MAX: usize = 128;

/// Upper bound for a single envelope. Anything larger is treated as a corrupt header.
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024 * 1024;

pub type WireName = [u8; PASS_NAME_MAX];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct SplitInfo {
    pub split_cnt: u16,
    pub split_idx: u16,
}

impl SplitInfo {
    pub const fn new(split_cnt: u16, split_idx: u16) -> Self {
        Self {
            split_cnt,
            split_idx,
        }
    }

    /// The unindexed split used by the authority for its own shard.
    pub const fn local(split_cnt: u16) -> Self {
        Self::new(split_cnt, 0)
    }

    /// `split_idx < split_cnt` whenever `split_cnt > 0`.
    pub fn is_valid(&self) -> bool {
        self.split_cnt == 0 || self.split_idx < self.split_cnt
    }

    pub fn is_local(&self) -> bool {
        self.split_idx == 0
    }

    /// Remote shard indices, highest first.
    pub fn remote_indices(split_cnt: u16) -> impl Iterator<Item = u16> {
        (1..split_cnt).rev()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DistMsgType {
    PassGraph = 0,
    PassData = 1,
    Debug = 2,
}

impl DistMsgType {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::PassGraph),
            1 => Some(Self::PassData),
            2 => Some(Self::Debug),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PassCreateType {
    Template = 0,
    Request = 1,
}

impl PassCreateType {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Template),
            1 => Some(Self::Request),
            _ => None,
        }
    }
}

/// Envelope header. `seq` sits where the C layout has tail padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgHead {
    pub msg_len: u32,
    pub msg_type: u32,
    pub ticket: u64,
    pub split_info: SplitInfo,
    pub seq: u32,
}

pub const MSG_HEAD_LEN: usize = size_of::<MsgHead>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassGraph {
    pub pass_len: u32,
    pub create_type: u32,
    pub slot_cnt: u8,
    pub conn_cnt: u8,
    pub img_cnt: u8,
    pub buf_cnt: u8,
    pub comm_cnt: u8,
    pub reserved: [u8; 3],
    pub pipeline: WireName,
    pub name: WireName,
    pub pass_temp: WireName,
    pub pass_class: WireName,
}

impl MsgPassGraph {
    /// Byte span of the record (header plus every trailing array) implied by the counts.
    pub fn calc_body_len(&self) -> u32 {
        (size_of::<MsgPassGraph>()
            + size_of::<MsgPassSlot>() * self.slot_cnt as usize
            + size_of::<MsgPassConn>() * self.conn_cnt as usize
            + size_of::<MsgPassAttImg>() * self.img_cnt as usize
            + size_of::<MsgPassAttBuf>() * self.buf_cnt as usize
            + size_of::<MsgPassCommInfo>() * self.comm_cnt as usize) as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassSlot {
    pub slot_type: u32,
    pub pad: u32,
    pub slot_name: WireName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassConn {
    pub local_slot: WireName,
    pub ref_pass_name: WireName,
    pub ref_att_name: WireName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassAttImg {
    pub bind_flags: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub format: u32,
    pub name: WireName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassAttBuf {
    pub size: u64,
    pub align: u64,
    pub bind_flags: u32,
    pub pad: u32,
    pub name: WireName,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassCommInfo {
    pub is_comm_pass: u16,
    pub comm_oper: u16,
    pub split_cnt: u16,
    pub split_idx: u16,
}

/// Chunk header inside a `PassData` body. `data_len` includes this header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgPassData {
    pub data_len: u32,
    pub node_id: u32,
}

/// Chunk header inside a `Debug` body. `info_len` includes this header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MsgDebugInfo {
    pub info_len: u32,
    pub node_id: u32,
}

pub fn encode_name(field: &'static str, value: &str) -> Result<WireName, ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() > PASS_NAME_MAX {
        return Err(ProtocolError::NameTooLong {
            field,
            len: bytes.len(),
        });
    }
    let mut out = [0u8; PASS_NAME_MAX];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Reads a NUL-padded field. A field that fills all 128 bytes has no terminator.
pub fn decode_name(field: &'static str, raw: &WireName) -> Result<String, ProtocolError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(PASS_NAME_MAX);
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidName { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_native_layout() {
        assert_eq!(size_of::<MsgHead>(), 24);
        assert_eq!(size_of::<MsgPassGraph>(), 528);
        assert_eq!(size_of::<MsgPassSlot>(), 136);
        assert_eq!(size_of::<MsgPassConn>(), 384);
        assert_eq!(size_of::<MsgPassAttImg>(), 152);
        assert_eq!(size_of::<MsgPassAttBuf>(), 152);
        assert_eq!(size_of::<MsgPassCommInfo>(), 8);
        assert_eq!(size_of::<MsgPassData>(), 8);
    }

    #[test]
    fn name_fields_are_nul_padded() {
        let raw = encode_name("name", "Depth").unwrap();
        assert_eq!(&raw[..5], b"Depth");
        assert!(raw[5..].iter().all(|b| *b == 0));
        assert_eq!(decode_name("name", &raw).unwrap(), "Depth");
    }

    #[test]
    fn full_width_name_has_no_terminator() {
        let long = "x".repeat(PASS_NAME_MAX);
        let raw = encode_name("name", &long).unwrap();
        assert_eq!(decode_name("name", &raw).unwrap(), long);

        let too_long = "x".repeat(PASS_NAME_MAX + 1);
        assert!(matches!(
            encode_name("name", &too_long),
            Err(ProtocolError::NameTooLong { len: 129, .. })
        ));
    }

    #[test]
    fn remote_indices_descend_and_skip_local() {
        let got: Vec<u16> = SplitInfo::remote_indices(4).collect();
        assert_eq!(got, vec![3, 2, 1]);
        assert_eq!(SplitInfo::remote_indices(1).count(), 0);
    }
}
