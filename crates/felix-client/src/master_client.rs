//! Master client stub.
//!
//! One typed asynchronous method per master operation, over a pluggable
//! [`MasterTransport`].  The built-in transport speaks the direct framed
//! protocol: each request is sent as one channel frame whose payload is a
//! 4-byte method tag followed by the JSON request envelope; responses are
//! correlated by envelope id and may return out of order.  A single
//! outbound queue preserves per-caller submission order for state-mutating
//! requests.
//!
//! If the master connection drops (e.g. a master restart), the next call
//! re-establishes it; requests in flight at the time of the drop fail
//! with `Unavailable`.

use byteorder::{ByteOrder, LittleEndian};
use felix_channel::tcp::TcpChannel;
use felix_channel::ChannelConfig;
use felix_protocol::*;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Transport seam: the framed-TCP implementation below and any
/// grpc-style implementation both conform to this.
pub trait MasterTransport: Send + Sync {
    fn call(
        &self,
        request: MasterRpcRequest,
    ) -> BoxFuture<'static, Result<MasterRpcResponse, Status>>;
}

/// Typed facade over a [`MasterTransport`].
#[derive(Clone)]
pub struct MasterClient {
    transport: Arc<dyn MasterTransport>,
}

macro_rules! client_method {
    ($name:ident, $variant:ident, $request:ty, $response:ty) => {
        pub async fn $name(&self, request: $request) -> Result<$response, Status> {
            match self.transport.call(MasterRpcRequest::$variant(request)).await? {
                MasterRpcResponse::$variant(response) => Ok(response),
                other => Err(Status::internal(format!(
                    concat!("master answered ", stringify!($name), " with {:?}"),
                    other
                ))),
            }
        }
    };
}

impl MasterClient {
    pub fn new(transport: Arc<dyn MasterTransport>) -> Self {
        MasterClient { transport }
    }

    /// Connect the built-in framed-TCP transport.  Fails fast if the
    /// master is unreachable.
    pub async fn connect_tcp(
        source: &ChannelSource,
        connect_timeout: Duration,
    ) -> Result<Self, Status> {
        let transport = TcpMasterTransport::connect(source, connect_timeout).await?;
        Ok(MasterClient::new(transport))
    }

    client_method!(register_client, RegisterClient, RegisterClientRequest, RegisterClientResponse);
    client_method!(unregister_client, UnregisterClient, UnregisterClientRequest, UnregisterClientResponse);
    client_method!(list_clients, ListClients, ListClientsRequest, ListClientsResponse);
    client_method!(register_node, RegisterNode, RegisterNodeRequest, RegisterNodeResponse);
    client_method!(unregister_node, UnregisterNode, UnregisterNodeRequest, UnregisterNodeResponse);
    client_method!(list_nodes, ListNodes, ListNodesRequest, ListNodesResponse);
    client_method!(publish_topic, PublishTopic, PublishTopicRequest, PublishTopicResponse);
    client_method!(unpublish_topic, UnpublishTopic, UnpublishTopicRequest, UnpublishTopicResponse);
    client_method!(subscribe_topic, SubscribeTopic, SubscribeTopicRequest, SubscribeTopicResponse);
    client_method!(unsubscribe_topic, UnsubscribeTopic, UnsubscribeTopicRequest, UnsubscribeTopicResponse);
    client_method!(list_topics, ListTopics, ListTopicsRequest, ListTopicsResponse);
    client_method!(register_service_client, RegisterServiceClient, RegisterServiceClientRequest, RegisterServiceClientResponse);
    client_method!(unregister_service_client, UnregisterServiceClient, UnregisterServiceClientRequest, UnregisterServiceClientResponse);
    client_method!(register_service_server, RegisterServiceServer, RegisterServiceServerRequest, RegisterServiceServerResponse);
    client_method!(unregister_service_server, UnregisterServiceServer, UnregisterServiceServerRequest, UnregisterServiceServerResponse);
    client_method!(list_services, ListServices, ListServicesRequest, ListServicesResponse);
}

// ---------------------------------------------------------------------------
// Framed-TCP transport
// ---------------------------------------------------------------------------

type PendingMap = HashMap<u64, oneshot::Sender<Result<MasterRpcResponse, Status>>>;

pub struct TcpMasterTransport {
    shared: Arc<TransportShared>,
}

struct TransportShared {
    source: ChannelSource,
    config: ChannelConfig,
    /// Current connection; replaced when a call finds it broken.
    conn: Mutex<Option<ConnState>>,
    /// Outbound queue: writes are serialized, preserving submission order.
    send_lock: Mutex<()>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct ConnState {
    channel: Arc<TcpChannel>,
    /// `None` once the connection is known broken.
    pending: Arc<StdMutex<Option<PendingMap>>>,
}

impl TcpMasterTransport {
    /// Connect eagerly and start the response reader.  Must be called
    /// from within the proxy runtime.
    pub async fn connect(
        source: &ChannelSource,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>, Status> {
        let shared = Arc::new(TransportShared {
            source: source.clone(),
            config: ChannelConfig {
                dynamic_send_buffer: true,
                dynamic_receive_buffer: true,
                connect_timeout,
                ..ChannelConfig::default()
            },
            conn: Mutex::new(None),
            send_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        });
        ensure_conn(&shared).await?;
        Ok(Arc::new(TcpMasterTransport { shared }))
    }
}

/// Return the live connection, dialing a fresh one if the previous broke.
async fn ensure_conn(shared: &Arc<TransportShared>) -> Result<ConnState, Status> {
    let mut guard = shared.conn.lock().await;
    if let Some(state) = guard.as_ref() {
        if !state.channel.is_broken() {
            return Ok(state.clone());
        }
        debug!("master connection broken, redialing");
    }

    let channel = Arc::new(
        TcpChannel::connect(&shared.source, &shared.config)
            .await
            .map_err(|s| s.with_context("master"))?,
    );
    let pending = Arc::new(StdMutex::new(Some(HashMap::new())));
    tokio::task::spawn_local(read_responses(channel.clone(), pending.clone()));

    let state = ConnState { channel, pending };
    *guard = Some(state.clone());
    Ok(state)
}

fn fail_all(pending: &StdMutex<Option<PendingMap>>, status: &Status) {
    let map = pending.lock().expect("pending map poisoned").take();
    if let Some(map) = map {
        for (_, tx) in map {
            let _ = tx.send(Err(status.clone()));
        }
    }
}

async fn read_responses(channel: Arc<TcpChannel>, pending: Arc<StdMutex<Option<PendingMap>>>) {
    loop {
        match channel.receive_message().await {
            Ok(body) => {
                let envelope: RpcResponseEnvelope = match serde_json::from_slice(&body) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "dropping unparseable master response");
                        continue;
                    }
                };
                let waiter = pending
                    .lock()
                    .expect("pending map poisoned")
                    .as_mut()
                    .and_then(|map| map.remove(&envelope.id));
                let Some(waiter) = waiter else {
                    debug!(id = envelope.id, "response for unknown request id");
                    continue;
                };
                let result = if envelope.status.is_ok() {
                    envelope.response.ok_or_else(|| {
                        Status::internal("master sent an OK envelope with no payload")
                    })
                } else {
                    Err(envelope.status)
                };
                let _ = waiter.send(result);
            }
            Err(status) => {
                debug!(status = %status, "master connection reader stopped");
                fail_all(&pending, &status.with_context("master connection"));
                return;
            }
        }
    }
}

impl MasterTransport for TcpMasterTransport {
    fn call(
        &self,
        request: MasterRpcRequest,
    ) -> BoxFuture<'static, Result<MasterRpcResponse, Status>> {
        let shared = self.shared.clone();
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let tag = request.method_tag();
        let envelope = RpcRequestEnvelope { id, request };

        async move {
            let conn = ensure_conn(&shared).await?;

            let body = serde_json::to_vec(&envelope).map_err(|e| {
                Status::new(StatusCode::FailedToSerialize, format!("rpc envelope: {e}"))
            })?;
            let mut payload = Vec::with_capacity(4 + body.len());
            let mut tag_bytes = [0u8; 4];
            LittleEndian::write_u32(&mut tag_bytes, tag);
            payload.extend_from_slice(&tag_bytes);
            payload.extend_from_slice(&body);

            let (tx, rx) = oneshot::channel();
            {
                let mut map = conn.pending.lock().expect("pending map poisoned");
                match map.as_mut() {
                    Some(map) => {
                        map.insert(id, tx);
                    }
                    None => return Err(Status::unavailable("master connection is closed")),
                }
            }

            {
                let _outbound = shared.send_lock.lock().await;
                if let Err(status) = conn.channel.send_message(&payload).await {
                    let _ = conn
                        .pending
                        .lock()
                        .expect("pending map poisoned")
                        .as_mut()
                        .and_then(|map| map.remove(&id));
                    return Err(status.with_context("master request"));
                }
            }

            rx.await
                .unwrap_or_else(|_| Err(Status::unavailable("master connection dropped")))
        }
        .boxed()
    }
}
