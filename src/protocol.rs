//! Binary wire protocol shared by the authority and its followers.

mod cursor;
mod data_msg;
mod dump;
mod error;
mod message;
mod pass_msg;
pub mod wire;

pub use cursor::{WireReader, WireWriter};
pub use data_msg::{
    ACK_NODE_ID, DataChunk, DebugRecord, HELLO_NODE_ID, decode_chunks, decode_debug,
    encode_chunks, encode_debug,
};
pub use dump::{dump_msg, hex_dump};
pub use error::ProtocolError;
pub use message::Frame;
pub use pass_msg::{
    CommInfo, FragmentIter, MAX_FRAGMENT_ENTRIES, PassGraphFragment, decode_fragments,
    encode_fragments,
};
pub use wire::{
    DistMsgType, MAX_MESSAGE_LEN, MSG_HEAD_LEN, MsgHead, PASS_NAME_MAX, PassCreateType, SplitInfo,
};
