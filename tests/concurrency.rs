#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use devtools_transport::error::CloseReason;
use devtools_transport::transport::local::LocalTransport;
use devtools_transport::transport::stream::DebuggerTransport;
use devtools_transport::transport::{PacketHooks, SharedPacket, Transport};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

struct Collector {
    packets: mpsc::UnboundedSender<SharedPacket>,
}

impl PacketHooks for Collector {
    fn on_packet(&self, packet: SharedPacket) {
        let _ = self.packets.send(packet);
    }

    fn on_closed(&self, _reason: &CloseReason) {}
}

fn collect(transport: &impl Transport) -> mpsc::UnboundedReceiver<SharedPacket> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.set_hooks(Some(Arc::new(Collector { packets: tx })));
    rx
}

/// Spawn `senders` tasks that each send `per_sender` numbered packets, then
/// check that every packet arrived and each sender's packets stayed in order.
async fn hammer<T: Transport + Clone + 'static>(
    sender: T,
    mut received: mpsc::UnboundedReceiver<SharedPacket>,
    senders: u64,
    per_sender: u64,
) {
    let mut tasks = JoinSet::new();
    for task in 0..senders {
        let sender = sender.clone();
        tasks.spawn(async move {
            for seq in 0..per_sender {
                sender.send(json!({"task": task, "seq": seq})).unwrap();
                if seq % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    let mut next_seq: HashMap<u64, u64> = HashMap::new();
    for _ in 0..senders * per_sender {
        let packet = timeout(Duration::from_secs(10), received.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        let task = packet["task"].as_u64().unwrap();
        let seq = packet["seq"].as_u64().unwrap();
        let expected = next_seq.entry(task).or_insert(0);
        assert_eq!(seq, *expected, "task {task} out of order");
        *expected += 1;
    }
    assert!(next_seq.values().all(|seq| *seq == per_sender));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_senders_on_stream_transport() {
    let (a, b) = tokio::io::duplex(4096);
    let client = DebuggerTransport::from_stream(a);
    let server = DebuggerTransport::from_stream(b);
    let received = collect(&server);
    let _client_events = collect(&client);
    client.ready().unwrap();
    server.ready().unwrap();

    hammer(client, received, 8, 2_000).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_senders_on_local_transport() {
    let (a, b) = LocalTransport::pair();
    let received = collect(&b);
    let _a_events = collect(&a);
    a.ready().unwrap();
    b.ready().unwrap();

    hammer(a, received, 8, 5_000).await;
}
