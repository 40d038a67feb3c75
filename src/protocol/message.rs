//! The framed envelope: `MsgHead` followed by `msg_len - 24` body bytes.

use super::{
    cursor::{WireReader, WireWriter},
    data_msg::{DataChunk, DebugRecord, decode_chunks, decode_debug, encode_chunks, encode_debug},
    error::ProtocolError,
    pass_msg::{FragmentIter, PassGraphFragment, decode_fragments, encode_fragments},
    wire::{DistMsgType, MAX_MESSAGE_LEN, MSG_HEAD_LEN, MsgHead, SplitInfo},
};

/// One message as it travels through the queues: typed kind plus owned body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: DistMsgType,
    pub ticket: u64,
    pub split: SplitInfo,
    /// Sender-assigned sequence number, 0 when unsequenced.
    pub seq: u32,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(kind: DistMsgType, ticket: u64, split: SplitInfo, body: Vec<u8>) -> Self {
        Self {
            kind,
            ticket,
            split,
            seq: 0,
            body,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn pass_graph(
        ticket: u64,
        split: SplitInfo,
        fragments: &[PassGraphFragment],
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            DistMsgType::PassGraph,
            ticket,
            split,
            encode_fragments(fragments)?,
        ))
    }

    pub fn pass_data(
        ticket: u64,
        split: SplitInfo,
        chunks: &[DataChunk],
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            DistMsgType::PassData,
            ticket,
            split,
            encode_chunks(chunks)?,
        ))
    }

    pub fn debug(
        ticket: u64,
        split: SplitInfo,
        records: &[DebugRecord],
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            DistMsgType::Debug,
            ticket,
            split,
            encode_debug(records)?,
        ))
    }

    pub fn encoded_len(&self) -> usize {
        MSG_HEAD_LEN + self.body.len()
    }

    pub fn head(&self) -> Result<MsgHead, ProtocolError> {
        let len = self.encoded_len();
        if len > MAX_MESSAGE_LEN as usize {
            return Err(ProtocolError::BadMessageLen {
                declared: u32::try_from(len).unwrap_or(u32::MAX),
                header: MSG_HEAD_LEN,
                max: MAX_MESSAGE_LEN,
            });
        }
        Ok(MsgHead {
            msg_len: len as u32,
            msg_type: self.kind.as_u32(),
            ticket: self.ticket,
            split_info: self.split,
            seq: self.seq,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let head = self.head()?;
        let mut w = WireWriter::with_capacity(self.encoded_len());
        w.put_pod(&head);
        w.put_bytes(&self.body);
        Ok(w.into_inner())
    }

    /// Validates a received header and returns the number of body bytes that follow.
    pub fn body_len(head: &MsgHead) -> Result<usize, ProtocolError> {
        if (head.msg_len as usize) < MSG_HEAD_LEN || head.msg_len > MAX_MESSAGE_LEN {
            return Err(ProtocolError::BadMessageLen {
                declared: head.msg_len,
                header: MSG_HEAD_LEN,
                max: MAX_MESSAGE_LEN,
            });
        }
        Ok(head.msg_len as usize - MSG_HEAD_LEN)
    }

    /// Builds a frame from a header and the body read after it. The body has already
    /// been consumed from the stream, so an unknown type only loses this message.
    pub fn from_parts(head: MsgHead, body: Vec<u8>) -> Result<Self, ProtocolError> {
        let kind =
            DistMsgType::from_u32(head.msg_type).ok_or(ProtocolError::UnknownMsgType(head.msg_type))?;
        Ok(Self {
            kind,
            ticket: head.ticket,
            split: head.split_info,
            seq: head.seq,
            body,
        })
    }

    /// Decodes one complete envelope; `msg_len` must cover exactly `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(bytes);
        let head: MsgHead = r.read_pod("message header")?;
        let body_len = Self::body_len(&head)?;
        if body_len != r.remaining() {
            return Err(ProtocolError::LengthMismatch {
                declared: head.msg_len,
                computed: bytes.len() as u32,
            });
        }
        let body = r.read_bytes("message body", body_len)?.to_vec();
        Self::from_parts(head, body)
    }

    fn expect(&self, expected: DistMsgType) -> Result<(), ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::WrongMsgType {
                expected,
                got: self.kind,
            });
        }
        Ok(())
    }

    pub fn fragments(&self) -> Result<FragmentIter<'_>, ProtocolError> {
        self.expect(DistMsgType::PassGraph)?;
        Ok(decode_fragments(&self.body))
    }

    pub fn chunks(&self) -> Result<Vec<DataChunk>, ProtocolError> {
        self.expect(DistMsgType::PassData)?;
        decode_chunks(&self.body)
    }

    pub fn debug_records(&self) -> Result<Vec<DebugRecord>, ProtocolError> {
        self.expect(DistMsgType::Debug)?;
        decode_debug(&self.body)
    }

    pub fn is_hello(&self) -> bool {
        self.kind == DistMsgType::Debug
            && self
                .debug_records()
                .is_ok_and(|records| records.iter().any(DebugRecord::is_hello))
    }

    pub fn is_ack(&self) -> bool {
        self.kind == DistMsgType::Debug
            && self
                .debug_records()
                .is_ok_and(|records| records.iter().any(DebugRecord::is_ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_len_bounds_whole_envelope() {
        let frame = Frame::pass_data(
            7,
            SplitInfo::new(3, 1),
            &[DataChunk::new(0, vec![1, 2, 3, 4])],
        )
        .unwrap()
        .with_seq(11);
        let bytes = frame.encode().unwrap();
        let head: MsgHead = bytemuck::pod_read_unaligned(&bytes[..MSG_HEAD_LEN]);
        assert_eq!(head.msg_len as usize, bytes.len());
        assert_eq!(head.msg_type, DistMsgType::PassData.as_u32());
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn header_shorter_than_itself_is_rejected() {
        let head = MsgHead {
            msg_len: 10,
            ..Default::default()
        };
        assert!(matches!(
            Frame::body_len(&head),
            Err(ProtocolError::BadMessageLen { declared: 10, .. })
        ));
    }

    #[test]
    fn unknown_type_reported_after_body() {
        let head = MsgHead {
            msg_len: MSG_HEAD_LEN as u32,
            msg_type: 9,
            ..Default::default()
        };
        assert_eq!(
            Frame::from_parts(head, Vec::new()),
            Err(ProtocolError::UnknownMsgType(9))
        );
    }

    #[test]
    fn typed_accessors_check_kind() {
        let frame = Frame::debug(1, SplitInfo::default(), &[DebugRecord::ack()]).unwrap();
        assert!(frame.is_ack());
        assert!(!frame.is_hello());
        assert!(matches!(
            frame.chunks(),
            Err(ProtocolError::WrongMsgType { .. })
        ));
    }
}
