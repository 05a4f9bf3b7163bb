//! Wire-format exactness tests (`spec.md` §6, §8 round-trip laws).

use basp_broker::net::codec::{Header, MessageKind, PayloadBag};
use basp_broker::net::types::{ActorId, HEADER_SIZE};

fn sample_header() -> Header {
    Header {
        kind: MessageKind::Dispatch,
        flags: 0b0000_0001,
        payload_len: 17,
        operation_id: 0x1122_3344_5566_7788,
        source_actor: ActorId(42),
        dest_actor: ActorId(u32::MAX - 1),
    }
}

#[test]
fn header_encodes_at_fixed_size_and_big_endian() {
    let header = sample_header();
    let mut buf = Vec::new();
    header.encode(&mut buf);
    assert_eq!(buf.len(), HEADER_SIZE);

    assert_eq!(buf[0], MessageKind::Dispatch as u8);
    assert_eq!(buf[1], 0b0000_0001);
    assert_eq!(&buf[2..6], &17u32.to_be_bytes());
    assert_eq!(&buf[6..14], &0x1122_3344_5566_7788u64.to_be_bytes());
    assert_eq!(&buf[14..18], &42u32.to_be_bytes());
    assert_eq!(&buf[18..22], &(u32::MAX - 1).to_be_bytes());
}

#[test]
fn header_round_trips() {
    let header = sample_header();
    let mut buf = Vec::new();
    header.encode(&mut buf);
    let decoded = Header::decode(&buf).unwrap();
    assert_eq!(decoded.kind, header.kind);
    assert_eq!(decoded.flags, header.flags);
    assert_eq!(decoded.payload_len, header.payload_len);
    assert_eq!(decoded.operation_id, header.operation_id);
    assert_eq!(decoded.source_actor, header.source_actor);
    assert_eq!(decoded.dest_actor, header.dest_actor);
    assert!(decoded.dest_is_named());
}

#[test]
fn oversize_payload_length_is_rejected() {
    let mut buf = Vec::new();
    sample_header().encode(&mut buf);
    // Bump the payload-length field past MAX_PAYLOAD_SIZE.
    buf[2..6].copy_from_slice(&u32::MAX.to_be_bytes());
    assert!(Header::decode(&buf).is_err());
}

#[test]
fn unknown_message_kind_is_rejected() {
    let mut buf = Vec::new();
    sample_header().encode(&mut buf);
    buf[0] = 0xFF;
    assert!(Header::decode(&buf).is_err());
}

#[test]
fn payload_bag_round_trips_through_encode_decode() {
    let mut bag = PayloadBag::new();
    bag.push(1, b"hello".to_vec());
    bag.push(2, Vec::new());
    bag.push(3, vec![0u8; 256]);

    let mut buf = Vec::new();
    bag.encode(&mut buf);
    let decoded = PayloadBag::decode(&buf).unwrap();
    assert_eq!(decoded, bag);
}

#[test]
fn truncated_payload_bag_fails_to_decode() {
    let mut bag = PayloadBag::new();
    bag.push(1, b"hello".to_vec());
    let mut buf = Vec::new();
    bag.encode(&mut buf);
    buf.truncate(buf.len() - 1);
    assert!(PayloadBag::decode(&buf).is_err());
}
