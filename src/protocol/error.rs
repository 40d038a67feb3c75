use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated {what}: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        what: &'static str,
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("unknown message type {0}")]
    UnknownMsgType(u32),

    #[error("unknown pass create type {0}")]
    UnknownCreateType(u32),

    #[error("unknown comm operation {0}")]
    UnknownCommOper(u16),

    #[error("unknown slot type {0}")]
    UnknownSlotType(u32),

    #[error("message length {declared} out of range (header {header}, max {max})")]
    BadMessageLen {
        declared: u32,
        header: usize,
        max: u32,
    },

    #[error("record length mismatch: declared {declared}, computed {computed}")]
    LengthMismatch { declared: u32, computed: u32 },

    #[error("record length {declared} exceeds remaining {remaining} bytes")]
    RecordOverrun { declared: usize, remaining: usize },

    #[error("chunk length {0} smaller than its header")]
    BadChunkLen(u32),

    #[error("too many {what}: {count} (max {max})")]
    TooMany {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("{field} is {len} bytes, exceeds the fixed field width")]
    NameTooLong { field: &'static str, len: usize },

    #[error("{field} is not valid utf-8")]
    InvalidName { field: &'static str },

    #[error("expected a {expected:?} message, got {got:?}")]
    WrongMsgType {
        expected: super::DistMsgType,
        got: super::DistMsgType,
    },
}
