//! Frame-data and debug bodies: `{len, node_id}` headed chunks repeated until the body ends.

use super::{
    cursor::{WireReader, WireWriter},
    error::ProtocolError,
    wire::{MsgDebugInfo, MsgPassData},
};

/// Debug record sent by a follower after every (re)connect.
pub const HELLO_NODE_ID: u32 = 0xFFFF_FFF0;
/// Debug record sent by a follower after applying a pass-graph message.
pub const ACK_NODE_ID: u32 = 0xFFFF_FFF1;

const CHUNK_HEAD_LEN: usize = size_of::<MsgPassData>();
const _: () = assert!(size_of::<MsgDebugInfo>() == CHUNK_HEAD_LEN);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChunk {
    pub node_id: u32,
    pub bytes: Vec<u8>,
}

impl DataChunk {
    pub fn new(node_id: u32, bytes: Vec<u8>) -> Self {
        Self { node_id, bytes }
    }
}

fn chunk_len(payload: usize) -> Result<u32, ProtocolError> {
    u32::try_from(payload + CHUNK_HEAD_LEN).map_err(|_| ProtocolError::TooMany {
        what: "chunk bytes",
        count: payload,
        max: u32::MAX as usize - CHUNK_HEAD_LEN,
    })
}

fn decode_chunk_seq<'a>(
    body: &'a [u8],
    what: &'static str,
) -> Result<Vec<(u32, &'a [u8])>, ProtocolError> {
    let mut r = WireReader::new(body);
    let mut out = Vec::new();
    while !r.is_empty() {
        let head: MsgPassData = r.read_pod(what)?;
        if (head.data_len as usize) < CHUNK_HEAD_LEN {
            return Err(ProtocolError::BadChunkLen(head.data_len));
        }
        let bytes = r.read_bytes(what, head.data_len as usize - CHUNK_HEAD_LEN)?;
        out.push((head.node_id, bytes));
    }
    Ok(out)
}

pub fn encode_chunks(chunks: &[DataChunk]) -> Result<Vec<u8>, ProtocolError> {
    let total = chunks.iter().map(|c| c.bytes.len() + CHUNK_HEAD_LEN).sum();
    let mut w = WireWriter::with_capacity(total);
    for chunk in chunks {
        w.put_pod(&MsgPassData {
            data_len: chunk_len(chunk.bytes.len())?,
            node_id: chunk.node_id,
        });
        w.put_bytes(&chunk.bytes);
    }
    Ok(w.into_inner())
}

pub fn decode_chunks(body: &[u8]) -> Result<Vec<DataChunk>, ProtocolError> {
    Ok(decode_chunk_seq(body, "data chunk")?
        .into_iter()
        .map(|(node_id, bytes)| DataChunk::new(node_id, bytes.to_vec()))
        .collect())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugRecord {
    pub node_id: u32,
    pub text: String,
}

impl DebugRecord {
    pub fn new(node_id: u32, text: impl Into<String>) -> Self {
        Self {
            node_id,
            text: text.into(),
        }
    }

    pub fn hello() -> Self {
        Self::new(HELLO_NODE_ID, "hello")
    }

    pub fn ack() -> Self {
        Self::new(ACK_NODE_ID, "ack")
    }

    pub fn is_hello(&self) -> bool {
        self.node_id == HELLO_NODE_ID
    }

    pub fn is_ack(&self) -> bool {
        self.node_id == ACK_NODE_ID
    }
}

pub fn encode_debug(records: &[DebugRecord]) -> Result<Vec<u8>, ProtocolError> {
    let mut w = WireWriter::new();
    for record in records {
        w.put_pod(&MsgDebugInfo {
            info_len: chunk_len(record.text.len())?,
            node_id: record.node_id,
        });
        w.put_bytes(record.text.as_bytes());
    }
    Ok(w.into_inner())
}

/// Non UTF-8 text is replaced lossily; debug records are diagnostics only.
pub fn decode_debug(body: &[u8]) -> Result<Vec<DebugRecord>, ProtocolError> {
    Ok(decode_chunk_seq(body, "debug record")?
        .into_iter()
        .map(|(node_id, bytes)| DebugRecord::new(node_id, String::from_utf8_lossy(bytes)))
        .collect())
}
