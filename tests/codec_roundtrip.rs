use pass_dist_server::{
    pass_graph::{
        BufferDescriptor, CommOper, ImageDescriptor, PassBufferAttachmentDesc, PassConnection,
        PassImageAttachmentDesc, PassSlot, PassSlotType,
    },
    protocol::{
        CommInfo, DataChunk, DistMsgType, Frame, PassCreateType, PassGraphFragment, ProtocolError,
        SplitInfo, WireReader, decode_fragments,
    },
};
use proptest::prelude::*;

fn name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_]{0,48}"
}

fn slot() -> impl Strategy<Value = PassSlot> {
    (name(), 0u32..4).prop_map(|(n, t)| PassSlot::new(n, PassSlotType::from_u32(t).unwrap()))
}

fn conn() -> impl Strategy<Value = PassConnection> {
    (name(), name(), name()).prop_map(|(s, p, a)| PassConnection::new(s, p, a))
}

fn image() -> impl Strategy<Value = PassImageAttachmentDesc> {
    (name(), any::<[u32; 6]>()).prop_map(|(name, v)| PassImageAttachmentDesc {
        name,
        image: ImageDescriptor {
            bind_flags: v[0],
            width: v[1],
            height: v[2],
            depth: v[3],
            array_size: v[4],
            format: v[5],
        },
    })
}

fn buffer() -> impl Strategy<Value = PassBufferAttachmentDesc> {
    (name(), any::<u64>(), any::<u64>(), any::<u32>()).prop_map(|(name, size, align, flags)| {
        PassBufferAttachmentDesc {
            name,
            buffer: BufferDescriptor {
                byte_count: size,
                alignment: align,
                bind_flags: flags,
            },
        }
    })
}

fn comm_info() -> impl Strategy<Value = CommInfo> {
    (any::<bool>(), 0u16..5, 1u16..8).prop_flat_map(|(is_comm, oper, cnt)| {
        (0..cnt).prop_map(move |idx| CommInfo {
            is_comm_pass: is_comm,
            oper: CommOper::from_u16(oper).unwrap(),
            split: SplitInfo::new(cnt, idx),
        })
    })
}

prop_compose! {
    fn fragment()(
        request in any::<bool>(),
        pipeline in name(),
        pass_name in name(),
        template in name(),
        class in name(),
        slots in prop::collection::vec(slot(), 0..6),
        connections in prop::collection::vec(conn(), 0..6),
        images in prop::collection::vec(image(), 0..4),
        buffers in prop::collection::vec(buffer(), 0..4),
        comm in prop::collection::vec(comm_info(), 0..2),
    ) -> PassGraphFragment {
        let create_type = if request { PassCreateType::Request } else { PassCreateType::Template };
        PassGraphFragment {
            create_type,
            pipeline,
            name: pass_name,
            pass_template: template,
            pass_class: class,
            slots,
            connections,
            images,
            buffers,
            comm,
        }
    }
}

proptest! {
    #[test]
    fn fragment_round_trip_consumes_exactly_calc_body_len(f in fragment()) {
        let bytes = f.encode().unwrap();
        prop_assert_eq!(f.calc_body_len().unwrap() as usize, bytes.len());

        let mut r = WireReader::new(&bytes);
        let back = PassGraphFragment::decode_record(&mut r).unwrap();
        prop_assert_eq!(r.position(), bytes.len());
        prop_assert_eq!(back, f);
    }

    #[test]
    fn concatenated_fragments_decode_in_order(fs in prop::collection::vec(fragment(), 1..4)) {
        let frame = Frame::pass_graph(9, SplitInfo::new(4, 3), &fs).unwrap();
        let wire = frame.encode().unwrap();
        let back = Frame::decode(&wire).unwrap();
        prop_assert_eq!(back.kind, DistMsgType::PassGraph);
        prop_assert_eq!(back.ticket, 9);
        let decoded: Vec<PassGraphFragment> =
            back.fragments().unwrap().collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(decoded, fs);
    }

    #[test]
    fn corrupt_counts_never_overrun(f in fragment(), idx in 8usize..13, value in any::<u8>()) {
        let mut body = f.encode().unwrap();
        body[idx] = value;
        // Any outcome is fine as long as decoding stays inside the buffer and the
        // damaged record is not returned as if it were intact.
        let results: Vec<_> = decode_fragments(&body).collect();
        prop_assert!(results.len() <= 1);
        if let Some(Ok(back)) = results.first() {
            prop_assert_eq!(back.entry_count(), f.entry_count());
        }
    }

    #[test]
    fn data_chunks_keep_payload_and_node(
        chunks in prop::collection::vec((any::<u32>(), prop::collection::vec(any::<u8>(), 0..64)), 0..5)
    ) {
        let chunks: Vec<DataChunk> = chunks.into_iter().map(|(id, b)| DataChunk::new(id, b)).collect();
        let frame = Frame::pass_data(1, SplitInfo::new(2, 1), &chunks).unwrap();
        let back = Frame::decode(&frame.encode().unwrap()).unwrap();
        prop_assert_eq!(back.chunks().unwrap(), chunks);
    }
}

#[test]
fn truncated_envelope_is_rejected() {
    let frame = Frame::pass_data(1, SplitInfo::new(2, 1), &[DataChunk::new(3, vec![7; 32])]).unwrap();
    let wire = frame.encode().unwrap();
    assert!(matches!(
        Frame::decode(&wire[..wire.len() - 1]),
        Err(ProtocolError::LengthMismatch { .. })
    ));
    assert!(matches!(
        Frame::decode(&wire[..10]),
        Err(ProtocolError::Truncated { .. })
    ));
}
