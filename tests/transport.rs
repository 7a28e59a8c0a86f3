//! Integration tests for the stream transport
//!
//! Two transports talk over an in-memory duplex. A duplex with a one-byte
//! buffer forces every read and write to be partial.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use devtools_transport::error::{CloseReason, ProtocolError};
use devtools_transport::transport::stream::DebuggerTransport;
use devtools_transport::transport::{BulkHeader, IncomingBulk, PacketHooks, SharedPacket, Transport};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug)]
enum Event {
    Packet(Value),
    Bulk(IncomingBulk),
    Closed(CloseReason),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl PacketHooks for Recorder {
    fn on_packet(&self, packet: SharedPacket) {
        let _ = self.events.send(Event::Packet((*packet).clone()));
    }

    fn on_bulk_packet(&self, packet: IncomingBulk) {
        let _ = self.events.send(Event::Bulk(packet));
    }

    fn on_closed(&self, reason: &CloseReason) {
        let _ = self.events.send(Event::Closed(reason.clone()));
    }
}

fn record(transport: &impl Transport) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.set_hooks(Some(Arc::new(Recorder { events: tx })));
    rx
}

async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn connected(buffer: usize) -> (DebuggerTransport, DebuggerTransport) {
    let (a, b) = tokio::io::duplex(buffer);
    (DebuggerTransport::from_stream(a), DebuggerTransport::from_stream(b))
}

#[tokio::test]
async fn test_fifo_with_one_byte_writes() {
    let (client, server) = connected(1);
    let mut events = record(&server);
    let _client_events = record(&client);
    client.ready().unwrap();
    server.ready().unwrap();

    let sent = [
        json!({"to": "root", "type": "listTabs"}),
        json!({"to": "c.tab1", "type": "attach", "options": {"x": [1, 2, 3]}}),
        json!({"to": "c.tab1", "type": "detach"}),
    ];
    for packet in &sent {
        client.send(packet.clone()).unwrap();
    }

    for expected in &sent {
        match next(&mut events).await {
            Event::Packet(packet) => assert_eq!(&packet, expected),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_packets_sent_before_ready_are_queued() {
    let (client, server) = connected(1024);
    let mut events = record(&server);
    client.send(json!({"n": 1})).unwrap();
    client.send(json!({"n": 2})).unwrap();
    client.ready().unwrap();
    server.ready().unwrap();

    for n in 1..=2 {
        match next(&mut events).await {
            Event::Packet(packet) => assert_eq!(packet, json!({"n": n})),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_exact_wire_bytes() {
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let transport = DebuggerTransport::from_stream(ours);
    let _events = record(&transport);
    transport.ready().unwrap();
    transport.send(json!({"a": 1, "b": "x"})).unwrap();

    let expected = br#"15:{"a":1,"b":"x"}"#;
    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), theirs.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, expected);
}

#[tokio::test]
async fn test_truncated_packet_never_delivered() {
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let transport = DebuggerTransport::from_stream(ours);
    let mut events = record(&transport);
    transport.ready().unwrap();

    theirs.write_all(b"5:{\"a").await.unwrap();
    theirs.shutdown().await.unwrap();
    drop(theirs);

    match next(&mut events).await {
        Event::Closed(CloseReason::StreamClosed) => {}
        other => panic!("expected close, got {other:?}"),
    }
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_framing_error_closes_transport() {
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let transport = DebuggerTransport::from_stream(ours);
    let mut events = record(&transport);
    transport.ready().unwrap();

    theirs.write_all(b"2:{}abc:{}").await.unwrap();
    match next(&mut events).await {
        Event::Packet(packet) => assert_eq!(packet, json!({})),
        other => panic!("unexpected event {other:?}"),
    }
    match next(&mut events).await {
        Event::Closed(CloseReason::Framing(_)) => {}
        other => panic!("expected framing close, got {other:?}"),
    }
    assert!(matches!(
        transport.send(json!({})),
        Err(ProtocolError::Closed(_))
    ));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (client, server) = connected(1024);
    let mut events = record(&client);
    let _server_events = record(&server);
    client.ready().unwrap();
    server.ready().unwrap();

    client.close(CloseReason::Requested);
    client.close(CloseReason::Reset);

    match next(&mut events).await {
        Event::Closed(CloseReason::Requested) => {}
        other => panic!("unexpected event {other:?}"),
    }
    // The hooks were released after the first close
    assert!(matches!(
        timeout(Duration::from_millis(100), events.recv()).await,
        Ok(None) | Err(_)
    ));
    assert!(client.send(json!({})).is_err());
}

#[tokio::test]
async fn test_peer_close_is_reported() {
    let (client, server) = connected(1024);
    let mut events = record(&server);
    let _client_events = record(&client);
    client.ready().unwrap();
    server.ready().unwrap();

    client.close(CloseReason::Requested);
    drop(client);
    match next(&mut events).await {
        Event::Closed(CloseReason::StreamClosed) => {}
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_bulk_exactness_and_ordering() {
    let (client, server) = connected(7);
    let mut events = record(&server);
    let _client_events = record(&client);
    client.ready().unwrap();
    server.ready().unwrap();

    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    client.send(json!({"n": 1})).unwrap();
    let bulk = client
        .start_bulk_send(BulkHeader::new("c.actor1", "blob", body.len() as u64))
        .await
        .unwrap();
    client.send(json!({"n": 2})).unwrap();
    let writer = tokio::spawn({
        let body = body.clone();
        async move { bulk.write_all(&body).await }
    });

    match next(&mut events).await {
        Event::Packet(packet) => assert_eq!(packet, json!({"n": 1})),
        other => panic!("unexpected event {other:?}"),
    }
    let incoming = match next(&mut events).await {
        Event::Bulk(incoming) => incoming,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(incoming.actor(), "c.actor1");
    assert_eq!(incoming.kind(), "blob");
    assert_eq!(incoming.read_to_vec().await.unwrap(), body);
    writer.await.unwrap().unwrap();

    match next(&mut events).await {
        Event::Packet(packet) => assert_eq!(packet, json!({"n": 2})),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_abandoned_bulk_closes_transport() {
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let transport = DebuggerTransport::from_stream(ours);
    let mut events = record(&transport);
    transport.ready().unwrap();

    theirs.write_all(b"bulk c.a1 blob 4:abcd2:{}").await.unwrap();
    match next(&mut events).await {
        Event::Bulk(incoming) => drop(incoming),
        other => panic!("unexpected event {other:?}"),
    }
    match next(&mut events).await {
        Event::Closed(CloseReason::Bulk(_)) => {}
        other => panic!("expected bulk close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_short_bulk_input_closes_sender() {
    let (client, server) = connected(1024);
    let mut events = record(&client);
    let _server_events = record(&server);
    client.ready().unwrap();
    server.ready().unwrap();

    let bulk = client
        .start_bulk_send(BulkHeader::new("c.a1", "blob", 10))
        .await
        .unwrap();
    let mut input: &[u8] = b"short";
    let err = bulk.copy_from(&mut input).await.unwrap_err();
    assert!(matches!(err, ProtocolError::BulkShortInput { copied: 5, expected: 10 }));

    match next(&mut events).await {
        Event::Closed(CloseReason::Bulk(_)) => {}
        other => panic!("expected bulk close, got {other:?}"),
    }
}
