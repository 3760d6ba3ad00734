//! Back-pressure: a slow peer loses the oldest frames, never the newest,
//! and the publisher sees no error.

use felix_client::{
    ChannelKind, ChannelKindMask, MasterProxy, NodeInfo, Publisher, PublisherSettings, Status,
};
use felix_test_utils::{init_test_logging, set_master_env, MockMaster, RawSubscriber};
use std::time::Duration;

/// Larger than any socket buffering the kernel will do on loopback, so
/// the peer's writer stays blocked mid-frame while the test queues more.
const STALL_LEN: usize = 48 * 1024 * 1024;
const SMALL_LEN: usize = 1024;

fn payload(marker: u8, len: usize) -> Vec<u8> {
    let mut bytes = vec![marker];
    bytes.resize(len, 0x5A);
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_subscriber_drops_oldest_keeps_newest() {
    init_test_logging();
    let master = MockMaster::start().await.expect("mock master");
    set_master_env(master.addr());

    let status = tokio::task::spawn_blocking(|| MasterProxy::instance().start())
        .await
        .unwrap();
    assert!(status.is_ok(), "start failed: {status}");
    let client_id = MasterProxy::instance().client_info().id;

    let node_info = NodeInfo {
        client_id,
        name: "bp-pub".into(),
        watermark: None,
    };

    let publisher = Publisher::new("test_msgs/Blob");
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    publisher.request_publish(
        node_info,
        "bulk",
        ChannelKindMask::single(ChannelKind::Tcp),
        PublisherSettings {
            queue_size: 2,
            is_dynamic_buffer: true,
            ..PublisherSettings::default()
        },
        Box::new(move |status| done_tx.send(status).unwrap()),
    );
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());

    // Connect a wire-level subscriber that does not read yet.
    let advertised = &master.topics()[0].topic_source[0];
    let mut slow_peer = RawSubscriber::connect(advertised).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (send_tx, send_rx) = std::sync::mpsc::channel::<Status>();
    let on_each: felix_client::SendDoneCallback = std::sync::Arc::new(move |_kind, status| {
        send_tx.send(status).ok();
    });

    // The stall frame jams the peer writer; the peer is not reading.
    let status = publisher.publish(payload(b'a', STALL_LEN), Some(on_each.clone()));
    assert!(status.is_ok(), "publish(a) failed: {status}");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // b..e pile up behind the stalled send; queue_size = 2 keeps d, e.
    for marker in [b'b', b'c', b'd', b'e'] {
        let status = publisher.publish(payload(marker, SMALL_LEN), Some(on_each.clone()));
        assert!(status.is_ok(), "publish({marker}) failed: {status}");
    }

    // Resume reads and collect everything the peer eventually gets.
    let mut markers = Vec::new();
    while let Ok(Ok(frame)) =
        tokio::time::timeout(Duration::from_secs(5), slow_peer.read_frame()).await
    {
        markers.push(frame[0]);
    }

    // The newest frames always survive; b and c were dropped from the
    // head of the queue while the peer was stalled.
    assert!(markers.contains(&b'd'), "received: {markers:?}");
    assert!(markers.contains(&b'e'), "received: {markers:?}");
    assert!(!markers.contains(&b'b'), "oldest must drop: {markers:?}");
    assert!(!markers.contains(&b'c'), "oldest must drop: {markers:?}");
    assert_eq!(markers.last(), Some(&b'e'), "order preserved: {markers:?}");

    // Every completed send attempt reported OK: a slow peer is not an
    // error the publisher hears about.
    while let Ok(status) = send_rx.try_recv() {
        assert!(status.is_ok(), "send-done surfaced {status}");
    }
}
