//! A corrupt frame closes the channel, surfaces `CorruptedHeader`, and
//! the registration survives to reconnect on the next NEW_TOPIC.

use felix_client::{
    ChannelKind, ChannelKindMask, MasterProxy, NodeInfo, Notification, Status, StatusCode,
    Subscriber, SubscriberSettings, TopicInfo,
};
use felix_test_utils::{init_test_logging, set_master_env, MockMaster, RawTopicEndpoint};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_header_breaks_channel_but_not_registration() {
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
        name: "sub".into(),
        watermark: None,
    };

    // A wire-level "publisher" the test fully controls.
    let mut endpoint = RawTopicEndpoint::bind().await.expect("bind endpoint");
    let advert = TopicInfo {
        topic: "fragile".into(),
        type_name: "test_msgs/String".into(),
        topic_source: vec![endpoint.channel_source()],
        impl_type: felix_client::ImplType::Native,
    };

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));
    let (msg_tx, msg_rx) = std::sync::mpsc::channel();
    let (err_tx, err_rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let received2 = received.clone();
    let errors2 = errors.clone();
    let subscriber = Subscriber::new();
    subscriber.request_subscribe(
        node_info,
        "fragile",
        ChannelKindMask::single(ChannelKind::Tcp),
        Box::new(move |payload| {
            received2.lock().unwrap().push(payload);
            msg_tx.send(()).unwrap();
        }),
        Box::new(move |status| {
            errors2.lock().unwrap().push(status);
            err_tx.send(()).unwrap();
        }),
        SubscriberSettings {
            queue_size: 8,
            ..SubscriberSettings::default()
        },
        Box::new(move |status| done_tx.send(status).unwrap()),
    );
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());

    // Advertise the fake publisher; the subscriber dials it.
    master.notify_all(&Notification::NewTopic(advert.clone())).await;
    endpoint.accept().await.expect("subscriber dials in");

    endpoint.send_frame(b"good").await.expect("send good frame");
    msg_rx.recv_timeout(Duration::from_secs(5)).expect("good frame delivered");
    assert_eq!(received.lock().unwrap().as_slice(), [b"good".to_vec()]);

    // Inject a frame declaring a 0xFFFFFFFF-byte body.
    endpoint
        .send_raw(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0])
        .await
        .expect("send corrupt header");

    err_rx.recv_timeout(Duration::from_secs(5)).expect("error surfaced");
    assert_eq!(errors.lock().unwrap()[0].code, StatusCode::CorruptedHeader);
    assert!(subscriber.is_registered(), "registration must survive");
    endpoint.disconnect();

    // A fresh NEW_TOPIC triggers the reconnect (same address, so the
    // subscriber backs off first).
    master.notify_all(&Notification::NewTopic(advert)).await;
    endpoint.accept().await.expect("subscriber reconnects");

    endpoint.send_frame(b"again").await.expect("send after reconnect");
    msg_rx.recv_timeout(Duration::from_secs(5)).expect("frame after reconnect");
    assert_eq!(
        received.lock().unwrap().as_slice(),
        [b"good".to_vec(), b"again".to_vec()]
    );
}
