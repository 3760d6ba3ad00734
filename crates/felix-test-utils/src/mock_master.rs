//! A mock master server.
//!
//! Speaks the framed-TCP RPC protocol on a random (or caller-chosen)
//! port, connects back to each registered client's heart-beat and
//! notification endpoints, and applies the registration semantics the
//! real master implements: id assignment, duplicate detection, and
//! NEW_TOPIC/TOPIC_GONE fan-out to subscribed clients.

use felix_channel::tcp::{TcpChannel, TcpChannelListener};
use felix_channel::udp::UdpChannel;
use felix_channel::ChannelConfig;
use felix_protocol::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct MockMaster {
    addr: SocketAddr,
    state: Arc<Mutex<MasterState>>,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct MasterState {
    next_client_id: u32,
    next_watermark: u64,
    clients: HashMap<u32, ClientEntry>,
    nodes: Vec<NodeInfo>,
    /// topic name → (owning node, advertisement)
    topics: HashMap<String, (NodeInfo, TopicInfo)>,
    /// topic name → subscribed client ids
    topic_subs: HashMap<String, Vec<u32>>,
    services: HashMap<String, (NodeInfo, ServiceInfo)>,
    service_subs: HashMap<String, Vec<u32>>,
    heartbeats: Vec<(Instant, HeartBeat)>,
    publish_calls: usize,
}

struct ClientEntry {
    info: ClientInfo,
    notifier: Option<Arc<TcpChannel>>,
}

impl MockMaster {
    /// Start on a random port.
    pub async fn start() -> std::io::Result<MockMaster> {
        Self::start_on("127.0.0.1:0".parse().expect("literal addr")).await
    }

    /// Start on a specific address (used to emulate a master restart on
    /// the same endpoint).
    pub async fn start_on(addr: SocketAddr) -> std::io::Result<MockMaster> {
        let listener = TcpChannelListener::listen(&ChannelSource::Tcp { addr })
            .await
            .map_err(|s| std::io::Error::other(s.to_string()))?;
        let ChannelSource::Tcp { addr } = listener.channel_source() else {
            unreachable!("tcp listener advertises a tcp source");
        };
        info!(addr = %addr, "mock master listening");

        let state = Arc::new(Mutex::new(MasterState {
            next_client_id: 1,
            next_watermark: 1,
            ..MasterState::default()
        }));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            let config = ChannelConfig {
                dynamic_send_buffer: true,
                dynamic_receive_buffer: true,
                ..ChannelConfig::default()
            };
            loop {
                match listener.accept(&config).await {
                    Ok(channel) => {
                        tokio::spawn(serve_client(Arc::new(channel), accept_state.clone()));
                    }
                    Err(status) => {
                        debug!(status = %status, "mock master accept stopped");
                        break;
                    }
                }
            }
        });

        Ok(MockMaster { addr, state, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Heart-beat pulses received so far, with arrival times.
    pub fn heartbeats(&self) -> Vec<(Instant, HeartBeat)> {
        self.state.lock().expect("master state poisoned").heartbeats.clone()
    }

    pub fn topics(&self) -> Vec<TopicInfo> {
        self.state
            .lock()
            .expect("master state poisoned")
            .topics
            .values()
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub fn registered_nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().expect("master state poisoned").nodes.clone()
    }

    pub fn registered_client_count(&self) -> usize {
        self.state.lock().expect("master state poisoned").clients.len()
    }

    /// Total `PublishTopic` calls, including re-advertisements.
    pub fn publish_calls(&self) -> usize {
        self.state.lock().expect("master state poisoned").publish_calls
    }

    /// Push a notification to every client that holds a watcher
    /// connection, regardless of subscriptions.  Tests use this to drive
    /// the watcher directly.
    pub async fn notify_all(&self, notification: &Notification) {
        let bytes = notification.encode().expect("encodable notification");
        let notifiers: Vec<Arc<TcpChannel>> = self
            .state
            .lock()
            .expect("master state poisoned")
            .clients
            .values()
            .filter_map(|entry| entry.notifier.clone())
            .collect();
        for notifier in notifiers {
            if let Err(status) = notifier.send_message(&bytes).await {
                warn!(status = %status, "mock master notify failed");
            }
        }
    }

    /// Stop accepting; existing connections die with the task.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for MockMaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Per-connection RPC service
// ---------------------------------------------------------------------------

async fn serve_client(channel: Arc<TcpChannel>, state: Arc<Mutex<MasterState>>) {
    loop {
        let body = match channel.receive_message().await {
            Ok(body) => body,
            Err(status) => {
                debug!(status = %status, "mock master client connection closed");
                return;
            }
        };
        if body.len() < 4 {
            warn!("request shorter than a method tag");
            return;
        }
        // Byte 0-3: method tag (redundant with the envelope kind).
        let envelope: RpcRequestEnvelope = match serde_json::from_slice(&body[4..]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable request envelope");
                return;
            }
        };

        let (status, response) = handle_request(&state, envelope.request).await;
        let reply = RpcResponseEnvelope {
            id: envelope.id,
            status,
            response,
        };
        let bytes = serde_json::to_vec(&reply).expect("response envelope serializes");
        if channel.send_message(&bytes).await.is_err() {
            return;
        }
    }
}

async fn handle_request(
    state: &Arc<Mutex<MasterState>>,
    request: MasterRpcRequest,
) -> (Status, Option<MasterRpcResponse>) {
    match request {
        MasterRpcRequest::RegisterClient(request) => register_client(state, request).await,
        MasterRpcRequest::UnregisterClient(request) => {
            state
                .lock()
                .expect("master state poisoned")
                .clients
                .remove(&request.id);
            ok(MasterRpcResponse::UnregisterClient(UnregisterClientResponse {}))
        }
        MasterRpcRequest::ListClients(_) => {
            let client_infos = state
                .lock()
                .expect("master state poisoned")
                .clients
                .values()
                .map(|entry| entry.info.clone())
                .collect();
            ok(MasterRpcResponse::ListClients(ListClientsResponse { client_infos }))
        }
        MasterRpcRequest::RegisterNode(request) => {
            let mut locked = state.lock().expect("master state poisoned");
            let exists = locked.nodes.iter().any(|n| {
                n.client_id == request.node_info.client_id && n.name == request.node_info.name
            });
            if exists {
                return (
                    Status::already_exists(format!("node {}", request.node_info.name)),
                    None,
                );
            }
            let mut node_info = request.node_info;
            node_info.watermark = Some(locked.next_watermark);
            locked.next_watermark += 1;
            locked.nodes.push(node_info.clone());
            ok(MasterRpcResponse::RegisterNode(RegisterNodeResponse { node_info }))
        }
        MasterRpcRequest::UnregisterNode(request) => {
            state
                .lock()
                .expect("master state poisoned")
                .nodes
                .retain(|n| {
                    n.client_id != request.node_info.client_id || n.name != request.node_info.name
                });
            ok(MasterRpcResponse::UnregisterNode(UnregisterNodeResponse {}))
        }
        MasterRpcRequest::ListNodes(_) => {
            let node_infos = state.lock().expect("master state poisoned").nodes.clone();
            ok(MasterRpcResponse::ListNodes(ListNodesResponse { node_infos }))
        }
        MasterRpcRequest::PublishTopic(request) => publish_topic(state, request).await,
        MasterRpcRequest::UnpublishTopic(request) => unpublish_topic(state, request).await,
        MasterRpcRequest::SubscribeTopic(request) => subscribe_topic(state, request).await,
        MasterRpcRequest::UnsubscribeTopic(request) => {
            let mut locked = state.lock().expect("master state poisoned");
            if let Some(subs) = locked.topic_subs.get_mut(&request.topic) {
                subs.retain(|id| *id != request.node_info.client_id);
            }
            ok(MasterRpcResponse::UnsubscribeTopic(UnsubscribeTopicResponse {}))
        }
        MasterRpcRequest::ListTopics(_) => {
            let topic_infos = state
                .lock()
                .expect("master state poisoned")
                .topics
                .values()
                .map(|(_, info)| info.clone())
                .collect();
            ok(MasterRpcResponse::ListTopics(ListTopicsResponse { topic_infos }))
        }
        MasterRpcRequest::RegisterServiceClient(request) => {
            let announce = {
                let mut locked = state.lock().expect("master state poisoned");
                locked
                    .service_subs
                    .entry(request.service.clone())
                    .or_default()
                    .push(request.node_info.client_id);
                locked
                    .services
                    .get(&request.service)
                    .map(|(_, info)| Notification::NewService(info.clone()))
            };
            if let Some(notification) = announce {
                notify_client(state, request.node_info.client_id, &notification).await;
            }
            ok(MasterRpcResponse::RegisterServiceClient(RegisterServiceClientResponse {}))
        }
        MasterRpcRequest::UnregisterServiceClient(request) => {
            let mut locked = state.lock().expect("master state poisoned");
            if let Some(subs) = locked.service_subs.get_mut(&request.service) {
                subs.retain(|id| *id != request.node_info.client_id);
            }
            ok(MasterRpcResponse::UnregisterServiceClient(UnregisterServiceClientResponse {}))
        }
        MasterRpcRequest::RegisterServiceServer(request) => {
            {
                let mut locked = state.lock().expect("master state poisoned");
                let service = request.service_info.service.clone();
                if locked.services.contains_key(&service) {
                    return (Status::already_exists(format!("service {service}")), None);
                }
                locked
                    .services
                    .insert(service, (request.node_info.clone(), request.service_info.clone()));
            }
            let service_name = request.service_info.service.clone();
            notify_subscribed(
                state,
                &service_name,
                true,
                &Notification::NewService(request.service_info),
            )
            .await;
            ok(MasterRpcResponse::RegisterServiceServer(RegisterServiceServerResponse {}))
        }
        MasterRpcRequest::UnregisterServiceServer(request) => {
            state
                .lock()
                .expect("master state poisoned")
                .services
                .remove(&request.service);
            notify_subscribed(
                state,
                &request.service,
                true,
                &Notification::ServiceGone(request.service.clone()),
            )
            .await;
            ok(MasterRpcResponse::UnregisterServiceServer(UnregisterServiceServerResponse {}))
        }
        MasterRpcRequest::ListServices(_) => {
            let service_infos = state
                .lock()
                .expect("master state poisoned")
                .services
                .values()
                .map(|(_, info)| info.clone())
                .collect();
            ok(MasterRpcResponse::ListServices(ListServicesResponse { service_infos }))
        }
    }
}

fn ok(response: MasterRpcResponse) -> (Status, Option<MasterRpcResponse>) {
    (Status::ok(), Some(response))
}

async fn register_client(
    state: &Arc<Mutex<MasterState>>,
    request: RegisterClientRequest,
) -> (Status, Option<MasterRpcResponse>) {
    let id = {
        let mut locked = state.lock().expect("master state poisoned");
        let id = locked.next_client_id;
        locked.next_client_id += 1;
        let mut info = request.client_info.clone();
        info.id = id;
        locked.clients.insert(id, ClientEntry { info, notifier: None });
        id
    };

    let config = ChannelConfig {
        dynamic_send_buffer: true,
        dynamic_receive_buffer: true,
        ..ChannelConfig::default()
    };

    // Attach to the client's heart-beat endpoint and record pulses.
    if let Some(source) = &request.client_info.heart_beat_signaller_source {
        match UdpChannel::connect(source, &config).await {
            Ok(channel) => {
                let pulse_state = state.clone();
                tokio::spawn(async move {
                    loop {
                        match channel.receive_message().await {
                            Ok(bytes) => match HeartBeat::decode(&bytes) {
                                Ok(pulse) => pulse_state
                                    .lock()
                                    .expect("master state poisoned")
                                    .heartbeats
                                    .push((Instant::now(), pulse)),
                                Err(status) => {
                                    warn!(status = %status, "undecodable heart-beat");
                                }
                            },
                            Err(_) => return,
                        }
                    }
                });
            }
            Err(status) => warn!(status = %status, "mock master could not reach signaller"),
        }
    }

    // Open the long-lived notification connection.
    if let Some(source) = &request.client_info.master_notification_watcher_source {
        match TcpChannel::connect(source, &config).await {
            Ok(channel) => {
                state
                    .lock()
                    .expect("master state poisoned")
                    .clients
                    .get_mut(&id)
                    .expect("client just inserted")
                    .notifier = Some(Arc::new(channel));
            }
            Err(status) => warn!(status = %status, "mock master could not reach watcher"),
        }
    }

    ok(MasterRpcResponse::RegisterClient(RegisterClientResponse { id }))
}

async fn publish_topic(
    state: &Arc<Mutex<MasterState>>,
    request: PublishTopicRequest,
) -> (Status, Option<MasterRpcResponse>) {
    let topic = request.topic_info.topic.clone();
    {
        let mut locked = state.lock().expect("master state poisoned");
        locked.publish_calls += 1;
        if let Some((owner, _)) = locked.topics.get(&topic) {
            let same_owner = owner.client_id == request.node_info.client_id
                && owner.name == request.node_info.name;
            if !same_owner {
                return (Status::already_exists(format!("topic {topic}")), None);
            }
        }
        locked
            .topics
            .insert(topic.clone(), (request.node_info, request.topic_info.clone()));
    }
    notify_subscribed(state, &topic, false, &Notification::NewTopic(request.topic_info)).await;
    ok(MasterRpcResponse::PublishTopic(PublishTopicResponse {}))
}

async fn unpublish_topic(
    state: &Arc<Mutex<MasterState>>,
    request: UnpublishTopicRequest,
) -> (Status, Option<MasterRpcResponse>) {
    let removed = state
        .lock()
        .expect("master state poisoned")
        .topics
        .remove(&request.topic)
        .is_some();
    if !removed {
        return (Status::not_found(format!("topic {}", request.topic)), None);
    }
    notify_subscribed(
        state,
        &request.topic,
        false,
        &Notification::TopicGone(request.topic.clone()),
    )
    .await;
    ok(MasterRpcResponse::UnpublishTopic(UnpublishTopicResponse {}))
}

async fn subscribe_topic(
    state: &Arc<Mutex<MasterState>>,
    request: SubscribeTopicRequest,
) -> (Status, Option<MasterRpcResponse>) {
    let announce = {
        let mut locked = state.lock().expect("master state poisoned");
        locked
            .topic_subs
            .entry(request.topic.clone())
            .or_default()
            .push(request.node_info.client_id);
        locked
            .topics
            .get(&request.topic)
            .map(|(_, info)| Notification::NewTopic(info.clone()))
    };
    // A topic that is already live is announced to the new subscriber
    // right away.
    if let Some(notification) = announce {
        notify_client(state, request.node_info.client_id, &notification).await;
    }
    ok(MasterRpcResponse::SubscribeTopic(SubscribeTopicResponse {}))
}

/// Send `notification` to every client subscribed to `key`.
async fn notify_subscribed(
    state: &Arc<Mutex<MasterState>>,
    key: &str,
    service: bool,
    notification: &Notification,
) {
    let (subscribed, notifiers) = {
        let locked = state.lock().expect("master state poisoned");
        let subs = if service {
            locked.service_subs.get(key).cloned().unwrap_or_default()
        } else {
            locked.topic_subs.get(key).cloned().unwrap_or_default()
        };
        let notifiers: Vec<(u32, Arc<TcpChannel>)> = locked
            .clients
            .iter()
            .filter_map(|(id, entry)| entry.notifier.clone().map(|n| (*id, n)))
            .collect();
        (subs, notifiers)
    };
    let bytes = notification.encode().expect("encodable notification");
    for (id, notifier) in notifiers {
        if !subscribed.contains(&id) {
            continue;
        }
        if let Err(status) = notifier.send_message(&bytes).await {
            debug!(client_id = id, status = %status, "notify failed");
        }
    }
}

async fn notify_client(state: &Arc<Mutex<MasterState>>, client_id: u32, notification: &Notification) {
    let notifier = state
        .lock()
        .expect("master state poisoned")
        .clients
        .get(&client_id)
        .and_then(|entry| entry.notifier.clone());
    let Some(notifier) = notifier else { return };
    let bytes = notification.encode().expect("encodable notification");
    if let Err(status) = notifier.send_message(&bytes).await {
        debug!(client_id, status = %status, "notify failed");
    }
}
