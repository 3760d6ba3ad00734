//! Notification fan-out through the real watcher channel, plus topic
//! re-advertisement when the master re-attaches.

use felix_client::{
    notification_callback, ChannelKind, ChannelKindMask, MasterProxy, NodeInfo, Notification,
    Publisher, PublisherSettings, ServiceInfo, SubscribeTopicRequest, TopicInfo,
};
use felix_test_utils::{init_test_logging, set_master_env, MockMaster};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watcher_fan_out_and_republish_on_reattach() {
    init_test_logging();
    let master = MockMaster::start().await.expect("mock master");
    set_master_env(master.addr());

    let proxy = MasterProxy::instance();
    let status = tokio::task::spawn_blocking(|| MasterProxy::instance().start())
        .await
        .unwrap();
    assert!(status.is_ok(), "start failed: {status}");
    let client_id = proxy.client_info().id;
    let node_info = NodeInfo {
        client_id,
        name: "watcher-node".into(),
        watermark: None,
    };

    // Three callbacks under one topic key, via the subscribe
    // pass-through; the master must see exactly three subscribe calls and
    // each callback must fire exactly once per notification, in
    // registration order.
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3u32 {
        let order = order.clone();
        let proxy_in_callback = proxy;
        let (tx, rx) = std::sync::mpsc::channel();
        proxy.subscribe_topic_async(
            SubscribeTopicRequest {
                node_info: node_info.clone(),
                topic: "announcements".into(),
            },
            notification_callback(move |notification| {
                assert!(proxy_in_callback.is_bound_to_current_thread());
                if matches!(notification, Notification::NewTopic(_)) {
                    order.lock().unwrap().push(i);
                }
            }),
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }

    let advert = TopicInfo {
        topic: "announcements".into(),
        type_name: "test_msgs/String".into(),
        topic_source: vec![],
        impl_type: felix_client::ImplType::Native,
    };
    master.notify_all(&Notification::NewTopic(advert.clone())).await;

    wait_until(|| order.lock().unwrap().len() == 3).await;
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2], "registration order");

    // A second notification fires all three again, once each.
    master.notify_all(&Notification::NewTopic(advert)).await;
    wait_until(|| order.lock().unwrap().len() == 6).await;
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);

    // Service notifications use the service map.
    let service_seen = Arc::new(Mutex::new(0u32));
    let service_seen2 = service_seen.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    proxy.register_service_client_async(
        felix_client::RegisterServiceClientRequest {
            node_info: node_info.clone(),
            service: "add_two_ints".into(),
        },
        notification_callback(move |notification| {
            if matches!(notification, Notification::NewService(_)) {
                *service_seen2.lock().unwrap() += 1;
            }
        }),
        Box::new(move |result| tx.send(result).unwrap()),
    );
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());

    master
        .notify_all(&Notification::NewService(ServiceInfo {
            service: "add_two_ints".into(),
            type_name: "test_msgs/AddTwoInts".into(),
            service_source: vec![],
            signature_hash: 0xfeed,
        }))
        .await;
    wait_until(|| *service_seen.lock().unwrap() == 1).await;

    // Register a real topic, then emulate a master restart by opening a
    // fresh connection to the watcher endpoint: the proxy re-advertises.
    let publisher = Publisher::new("test_msgs/String");
    let (pub_tx, pub_rx) = std::sync::mpsc::channel();
    publisher.request_publish(
        node_info,
        "durable",
        ChannelKindMask::single(ChannelKind::Tcp),
        PublisherSettings::default(),
        Box::new(move |status| pub_tx.send(status).unwrap()),
    );
    assert!(pub_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
    let publishes_before = master.publish_calls();

    let watcher_source = proxy
        .client_info()
        .master_notification_watcher_source
        .expect("watcher advertised");
    let felix_client::ChannelSource::Tcp { addr } = watcher_source else {
        panic!("watcher speaks tcp");
    };
    let _reattached = tokio::net::TcpStream::connect(addr).await.expect("re-attach");

    wait_until(|| master.publish_calls() > publishes_before).await;
    assert_eq!(master.topics().len(), 1, "topic re-advertised, not duplicated");
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
