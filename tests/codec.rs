//! Integration tests for the packet codec
//!
//! These tests pin the wire format byte for byte and check that framing is
//! unaffected by how the input is chunked.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use devtools_transport::core::codec::{Frame, PacketCodec};
use devtools_transport::core::packet::{BulkHeader, FramingLimits};
use devtools_transport::error::ProtocolError;
use serde_json::json;
use tokio_util::codec::{Decoder, Encoder};

fn decode_all(codec: &mut PacketCodec, bytes: &[u8], chunk: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut buf = BytesMut::new();
    for piece in bytes.chunks(chunk) {
        buf.extend_from_slice(piece);
        while let Some(frame) = codec.decode(&mut buf).expect("decode failed") {
            frames.push(frame);
        }
    }
    frames
}

#[test]
fn test_json_wire_bytes() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(&json!({"a": 1, "b": "x"}), &mut buf).unwrap();
    assert_eq!(&buf[..], br#"15:{"a":1,"b":"x"}"#);

    let frame = codec.decode(&mut buf).unwrap().expect("complete packet");
    assert_eq!(frame, Frame::Json(json!({"a": 1, "b": "x"})));
    assert!(buf.is_empty());
}

#[test]
fn test_length_counts_utf8_bytes() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(&json!("é"), &mut buf).unwrap();
    // "é" is two bytes plus two quotes
    assert_eq!(&buf[..], "4:\"é\"".as_bytes());
}

#[test]
fn test_bulk_header_wire_bytes() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(&BulkHeader::new("server1.conn0.a5", "screenshot", 1024), &mut buf)
        .unwrap();
    assert_eq!(&buf[..], b"bulk server1.conn0.a5 screenshot 1024:");
}

#[test]
fn test_one_byte_chunks() {
    let wire = b"2:{}bulk c.a1 blob 3:xyz7:{\"a\":1}";
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    // Bulk bodies bypass the codec
    let mut skip = 0usize;
    for byte in wire {
        if skip > 0 {
            skip -= 1;
            continue;
        }
        buf.extend_from_slice(&[*byte]);
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            if let Frame::Bulk(header) = &frame {
                skip = header.length as usize;
            }
            frames.push(frame);
        }
    }
    assert_eq!(
        frames,
        vec![
            Frame::Json(json!({})),
            Frame::Bulk(BulkHeader::new("c.a1", "blob", 3)),
            Frame::Json(json!({"a": 1})),
        ]
    );
}

#[test]
fn test_bulk_followed_by_json() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&b"bulk c.a1 blob 3:xyz7:{\"a\":1}"[..]);
    let header = match codec.decode(&mut buf).unwrap() {
        Some(Frame::Bulk(header)) => header,
        other => panic!("expected bulk header, got {other:?}"),
    };
    assert_eq!(header.length, 3);
    assert_eq!(&buf.split_to(3)[..], b"xyz");
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Json(json!({"a": 1})))
    );
}

#[test]
fn test_short_packets_decode() {
    // Shorter than the four-byte type peek
    let frames = decode_all(&mut PacketCodec::default(), b"1:1", 1);
    assert_eq!(frames, vec![Frame::Json(json!(1))]);

    let frames = decode_all(&mut PacketCodec::default(), b"2:{}2:[]", 3);
    assert_eq!(frames, vec![Frame::Json(json!({})), Frame::Json(json!([]))]);
}

#[test]
fn test_chunking_does_not_change_frames() {
    let mut wire = BytesMut::new();
    let mut codec = PacketCodec::default();
    let packets = [
        json!({"to": "root", "type": "listTabs"}),
        json!({"from": "root", "tabs": [{"actor": "c.tab1", "title": "日本"}]}),
        json!({"to": "c.tab1", "type": "attach"}),
    ];
    for packet in &packets {
        codec.encode(packet, &mut wire).unwrap();
    }

    for chunk in [1, 2, 3, 5, 17, wire.len()] {
        let frames = decode_all(&mut PacketCodec::default(), &wire, chunk);
        let decoded: Vec<_> = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Json(value) => value,
                Frame::Bulk(header) => panic!("unexpected bulk {header:?}"),
            })
            .collect();
        assert_eq!(decoded, packets, "chunk size {chunk}");
    }
}

#[test]
fn test_invalid_length_field() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&b"1x:{}"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, ProtocolError::Framing(_)));
}

#[test]
fn test_delimiter_scan_limit() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&b"123456789012345678901234567890"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, ProtocolError::DelimiterLimit { delimiter: ':', limit: 20 }));
}

#[test]
fn test_oversized_declared_length() {
    let limits = FramingLimits {
        max_payload_size: 64,
        ..FramingLimits::default()
    };
    let mut codec = PacketCodec::new(limits);
    let mut buf = BytesMut::from(&b"65:"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, ProtocolError::OversizedPacket(65)));
}

#[test]
fn test_invalid_json_body() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&b"3:{x}"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, ProtocolError::Json(_)));
}

#[test]
fn test_bulk_keyword_needs_space() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&b"bulkc.a1 blob 3:xyz"[..]);
    assert!(codec.decode(&mut buf).is_err());
}

#[test]
fn test_truncated_packet_at_eof() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&b"5:{\"a"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert!(codec.decode_eof(&mut buf).is_err());
}
