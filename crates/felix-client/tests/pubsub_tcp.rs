//! End-to-end: one publisher, one subscriber, TCP, via the mock master.

use felix_client::{
    ChannelKind, ChannelKindMask, MasterProxy, NodeInfo, NodeLifecycle, Publisher,
    PublisherSettings, Status, Subscriber, SubscriberSettings,
};
use felix_test_utils::{init_test_logging, set_master_env, MockMaster};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

struct TestNode {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl NodeLifecycle for TestNode {
    fn on_did_create(&mut self, node_info: NodeInfo) {
        assert!(MasterProxy::instance().is_bound_to_current_thread());
        assert!(node_info.watermark.is_some(), "master assigns the watermark");
        self.events.lock().unwrap().push(format!("{}:did_create", self.name));
    }

    fn on_init(&mut self) {
        self.events.lock().unwrap().push(format!("{}:init", self.name));
    }

    fn on_error(&mut self, status: Status) {
        self.events.lock().unwrap().push(format!("{}:error:{status}", self.name));
    }
}

fn wait_status(rx: &std::sync::mpsc::Receiver<Status>) -> Status {
    rx.recv_timeout(Duration::from_secs(5)).expect("callback fired")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_publisher_single_subscriber_over_tcp() {
    init_test_logging();
    let master = MockMaster::start().await.expect("mock master");
    set_master_env(master.addr());

    let proxy = MasterProxy::instance();
    let status = tokio::task::spawn_blocking(|| MasterProxy::instance().start())
        .await
        .unwrap();
    assert!(status.is_ok(), "start failed: {status}");
    let client_info = proxy.client_info();
    assert!(client_info.is_valid());

    // Register the two nodes and wait for their lifecycle callbacks.
    let events = Arc::new(Mutex::new(Vec::new()));
    for name in ["pub", "sub"] {
        let events = events.clone();
        proxy.request_register_node(NodeInfo::new(name), move || TestNode { name, events });
    }
    timeout(Duration::from_secs(5), async {
        loop {
            if events.lock().unwrap().len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node lifecycle callbacks");
    {
        let events = events.lock().unwrap();
        for name in ["pub", "sub"] {
            let did_create = events.iter().position(|e| e == &format!("{name}:did_create"));
            let init = events.iter().position(|e| e == &format!("{name}:init"));
            assert!(did_create.is_some() && init.is_some(), "events: {events:?}");
            assert!(did_create < init, "did_create precedes init: {events:?}");
        }
    }
    assert_eq!(master.registered_nodes().len(), 2);

    let pub_info = NodeInfo {
        client_id: client_info.id,
        name: "pub".into(),
        watermark: None,
    };
    let sub_info = NodeInfo {
        client_id: client_info.id,
        name: "sub".into(),
        watermark: None,
    };

    // Publisher on "chatter".
    let publisher = Publisher::new("test_msgs/String");
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    publisher.request_publish(
        pub_info.clone(),
        "chatter",
        ChannelKindMask::single(ChannelKind::Tcp),
        PublisherSettings {
            queue_size: 10,
            period: Duration::ZERO,
            ..PublisherSettings::default()
        },
        Box::new(move |status| done_tx.send(status).unwrap()),
    );
    assert!(wait_status(&done_rx).is_ok());
    assert!(publisher.is_registered());

    // A second registration must fail without touching the first.
    let (dup_tx, dup_rx) = std::sync::mpsc::channel();
    publisher.request_publish(
        pub_info.clone(),
        "chatter",
        ChannelKindMask::single(ChannelKind::Tcp),
        PublisherSettings::default(),
        Box::new(move |status| dup_tx.send(status).unwrap()),
    );
    let dup = wait_status(&dup_rx);
    assert_eq!(dup.code, felix_client::StatusCode::AlreadyExists);
    assert!(publisher.is_registered());

    // Subscriber on "chatter".
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let (msg_tx, msg_rx) = std::sync::mpsc::channel();
    let (sub_done_tx, sub_done_rx) = std::sync::mpsc::channel();
    let subscriber = Subscriber::new();
    subscriber.request_subscribe(
        sub_info.clone(),
        "chatter",
        ChannelKindMask::single(ChannelKind::Tcp),
        Box::new(move |payload| {
            assert!(MasterProxy::instance().is_bound_to_current_thread());
            received2.lock().unwrap().push(payload);
            msg_tx.send(()).unwrap();
        }),
        Box::new(|status| panic!("unexpected subscriber error: {status}")),
        SubscriberSettings {
            queue_size: 10,
            ..SubscriberSettings::default()
        },
        Box::new(move |status| sub_done_tx.send(status).unwrap()),
    );
    assert!(wait_status(&sub_done_rx).is_ok());
    assert!(subscriber.is_registered());

    // Give the subscriber time to dial and the publisher to accept.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for payload in [b"hello\0".to_vec(), b"world\0".to_vec()] {
        let status = publisher.publish(payload, None);
        assert!(status.is_ok(), "publish failed: {status}");
    }

    for _ in 0..2 {
        msg_rx.recv_timeout(Duration::from_secs(5)).expect("message delivered");
    }
    assert_eq!(
        *received.lock().unwrap(),
        vec![b"hello\0".to_vec(), b"world\0".to_vec()],
        "delivery preserves publish order"
    );

    // Orderly teardown.
    let (unpub_tx, unpub_rx) = std::sync::mpsc::channel();
    publisher.request_unpublish(pub_info, "chatter", Box::new(move |s| unpub_tx.send(s).unwrap()));
    assert!(wait_status(&unpub_rx).is_ok());
    assert!(publisher.is_unregistered());
    assert!(master.topics().is_empty());

    let (unsub_tx, unsub_rx) = std::sync::mpsc::channel();
    subscriber.request_unsubscribe(sub_info, "chatter", Box::new(move |s| unsub_tx.send(s).unwrap()));
    assert!(wait_status(&unsub_rx).is_ok());
    assert!(subscriber.is_unregistered());
}
