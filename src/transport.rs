//! Unix-socket transport between the authority and its followers.
//!
//! Every connection runs a reader thread and a writer thread. They only touch the
//! engine through `DistShared`: the queues and the ticket counter.

mod client;
mod server;
mod shard;

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::protocol::{Frame, MSG_HEAD_LEN, MsgHead, ProtocolError};

pub use client::{FollowerHandle, spawn_follower};
pub use server::{AuthorityHandle, spawn_authority};
pub use shard::{Dedup, Route, ShardRegistry};

/// Live connections the authority keeps; further connections are refused.
pub const MAX_CONNECTIONS: usize = 16;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket i/o: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("peer closed the connection")]
    Closed,
}

impl TransportError {
    /// The stream is still aligned on a message boundary after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::UnknownMsgType(_)))
    }
}

/// Reads the fixed header, then exactly the body it announces.
pub fn read_frame(r: &mut impl Read) -> Result<Frame, TransportError> {
    let mut head = [0u8; MSG_HEAD_LEN];
    r.read_exact(&mut head).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(e),
    })?;
    let head: MsgHead = bytemuck::pod_read_unaligned(&head);
    let mut body = vec![0u8; Frame::body_len(&head)?];
    r.read_exact(&mut body)?;
    Ok(Frame::from_parts(head, body)?)
}

pub fn write_frame(w: &mut impl Write, frame: &Frame) -> Result<(), TransportError> {
    let bytes = frame.encode()?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataChunk, DistMsgType, SplitInfo};

    #[test]
    fn frames_survive_a_byte_stream() {
        let a = Frame::pass_data(3, SplitInfo::new(2, 1), &[DataChunk::new(0, vec![1; 10])])
            .unwrap()
            .with_seq(9);
        let b = Frame::new(DistMsgType::PassGraph, 3, SplitInfo::new(2, 1), Vec::new());
        let mut buf = Vec::new();
        write_frame(&mut buf, &a).unwrap();
        write_frame(&mut buf, &b).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_frame(&mut r).unwrap(), a);
        assert_eq!(read_frame(&mut r).unwrap(), b);
        assert!(matches!(read_frame(&mut r), Err(TransportError::Closed)));
    }

    #[test]
    fn unknown_type_keeps_stream_aligned() {
        let good = Frame::new(DistMsgType::Debug, 1, SplitInfo::default(), vec![0; 4]);
        let mut bytes = good.encode().unwrap();
        bytes[4] = 9;
        bytes.extend(good.encode().unwrap());

        let mut r = bytes.as_slice();
        let err = read_frame(&mut r).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(read_frame(&mut r).unwrap(), good);
    }

    #[test]
    fn short_body_is_terminal() {
        let frame = Frame::new(DistMsgType::PassData, 1, SplitInfo::default(), vec![0; 16]);
        let bytes = frame.encode().unwrap();
        let mut r = &bytes[..bytes.len() - 3];
        let err = read_frame(&mut r).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
