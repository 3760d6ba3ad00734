//! The master proxy.
//!
//! Process-wide runtime handle: owns the proxy task runner, the master
//! client connection, the notification watcher and the heart-beat
//! signaller, and the node registry.  Created lazily on first access;
//! lives until process exit.
//!
//! Lifecycle: UNINITIALISED → STARTING → RUNNING → STOPPING → STOPPED,
//! one-way.  `start` from anything but UNINITIALISED fails with
//! `AlreadyExists`; `stop` is idempotent.

use crate::config::{load_config, ClientConfig};
use crate::heartbeat::HeartBeatSignaller;
use crate::master_client::MasterClient;
use crate::node::NodeLifecycle;
use crate::task_runner::{SharedOnce, TaskRunner};
use crate::watcher::{NotificationCallback, NotificationWatcher};
use felix_protocol::{
    ChannelSource, ClientInfo, ListClientsRequest, ListClientsResponse, ListNodesRequest,
    ListNodesResponse, ListServicesRequest, ListServicesResponse, ListTopicsRequest,
    ListTopicsResponse, NodeInfo, PublishTopicRequest, PublishTopicResponse,
    RegisterClientRequest, RegisterNodeRequest, RegisterServiceClientRequest,
    RegisterServiceClientResponse, RegisterServiceServerRequest, RegisterServiceServerResponse,
    Status, SubscribeTopicRequest, SubscribeTopicResponse, TopicInfo, UnpublishTopicRequest,
    UnpublishTopicResponse, UnregisterClientRequest, UnregisterNodeRequest,
    UnregisterNodeResponse, UnregisterServiceClientRequest, UnregisterServiceClientResponse,
    UnregisterServiceServerRequest, UnregisterServiceServerResponse, UnsubscribeTopicRequest,
    UnsubscribeTopicResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Uninitialised,
    Starting,
    Running,
    Stopping,
    Stopped,
}

static BACKGROUND: AtomicBool = AtomicBool::new(false);
static INSTANCE: OnceLock<MasterProxy> = OnceLock::new();

pub struct MasterProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    runner: TaskRunner,
    state: StdMutex<ProxyState>,
    config: ClientConfig,
    client_info: Arc<StdMutex<ClientInfo>>,
    master: StdMutex<Option<MasterClient>>,
    watcher: NotificationWatcher,
    /// Owned by the proxy; mutated only on the proxy thread.
    nodes: StdMutex<Vec<Box<dyn NodeLifecycle>>>,
    /// Topics to re-advertise when the master re-attaches.
    republish: StdMutex<HashMap<String, (NodeInfo, TopicInfo)>>,
    quit_tx: watch::Sender<bool>,
}

impl MasterProxy {
    /// The process-wide instance, created lazily.
    pub fn instance() -> &'static MasterProxy {
        INSTANCE.get_or_init(|| {
            let config = load_config().unwrap_or_else(|e| {
                warn!(error = %e, "client config unusable, falling back to defaults");
                ClientConfig::default()
            });
            let client_info = ClientInfo {
                id: 0,
                heart_beat_duration_ms: config.heart_beat_duration_ms,
                heart_beat_signaller_source: None,
                master_notification_watcher_source: None,
            };
            let (quit_tx, _) = watch::channel(false);
            MasterProxy {
                inner: Arc::new(ProxyInner {
                    runner: TaskRunner::spawn(),
                    state: StdMutex::new(ProxyState::Uninitialised),
                    config,
                    client_info: Arc::new(StdMutex::new(client_info)),
                    master: StdMutex::new(None),
                    watcher: NotificationWatcher::new(),
                    nodes: StdMutex::new(Vec::new()),
                    republish: StdMutex::new(HashMap::new()),
                    quit_tx,
                }),
            }
        })
    }

    /// Run the task runner on an internal worker even for `run()`; callers
    /// of `run()` get control back immediately.
    pub fn set_background() {
        BACKGROUND.store(true, Ordering::Release);
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.lock().expect("proxy state poisoned")
    }

    pub fn client_info(&self) -> ClientInfo {
        self.inner
            .client_info
            .lock()
            .expect("client info poisoned")
            .clone()
    }

    /// Adjust the declared liveness interval.  Only meaningful before
    /// `start`.
    pub fn set_heart_beat_duration(&self, duration: Duration) {
        self.inner
            .client_info
            .lock()
            .expect("client info poisoned")
            .heart_beat_duration_ms = duration.as_millis() as u64;
    }

    pub fn is_bound_to_current_thread(&self) -> bool {
        self.inner.runner.is_bound_to_current_thread()
    }

    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.inner.runner.post(task)
    }

    pub fn post_delayed_task(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        self.inner.runner.post_delayed(delay, task)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect to the master, start the watcher and the signaller, and
    /// register this client.  Synchronous: returns once the master has
    /// assigned the client id (populated into [`Self::client_info`]).
    pub fn start(&self) -> Status {
        {
            let mut state = self.inner.state.lock().expect("proxy state poisoned");
            if *state != ProxyState::Uninitialised {
                return Status::already_exists(format!(
                    "master proxy cannot start from {:?}",
                    *state
                ));
            }
            *state = ProxyState::Starting;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let inner = self.inner.clone();
        let cancel_tx = tx.clone();
        self.inner.runner.post_cancellable(
            move || {
                tokio::task::spawn_local(async move {
                    let result = startup(inner).await;
                    let _ = tx.send(result);
                });
            },
            move || {
                let _ = cancel_tx.send(Err(Status::cancelled()));
            },
        );

        let status = match rx.recv_timeout(Duration::from_secs(60)) {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(status)) => status,
            Err(_) => Status::deadline_exceeded("startup did not complete"),
        };

        let mut state = self.inner.state.lock().expect("proxy state poisoned");
        *state = if status.is_ok() {
            ProxyState::Running
        } else {
            ProxyState::Stopped
        };
        status
    }

    /// Cancel outstanding work, stop the signaller and watcher, tell the
    /// master goodbye, and quit the task runner.  Idempotent.
    pub fn stop(&self) -> Status {
        {
            let mut state = self.inner.state.lock().expect("proxy state poisoned");
            match *state {
                ProxyState::Stopping | ProxyState::Stopped => return Status::ok(),
                ProxyState::Uninitialised => {
                    *state = ProxyState::Stopped;
                    self.inner.runner.quit();
                    return Status::ok();
                }
                ProxyState::Starting | ProxyState::Running => *state = ProxyState::Stopping,
            }
        }

        let inner = self.inner.clone();
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let wait_here = !self.inner.runner.is_bound_to_current_thread();
        self.inner.runner.post(move || {
            tokio::task::spawn_local(async move {
                shutdown(inner).await;
                let _ = ack_tx.send(());
            });
        });
        if wait_here {
            let _ = ack_rx.recv_timeout(Duration::from_secs(10));
            self.inner.runner.join();
        }
        Status::ok()
    }

    /// Install SIGINT/SIGTERM/SIGHUP handlers that post `stop`, then block
    /// the calling thread on the task runner.  In background mode this
    /// returns immediately.
    pub fn run(&self) {
        self.inner.runner.post(|| {
            tokio::task::spawn_local(handle_signals());
        });
        if BACKGROUND.load(Ordering::Acquire) {
            return;
        }
        self.inner.runner.join();
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Construct a node on the proxy thread via `factory`, register it
    /// with the master, and deliver `on_did_create` + `on_init` (or
    /// `on_error` on failure, dropping the node).
    pub fn request_register_node<N, F>(&self, node_info: NodeInfo, factory: F)
    where
        N: NodeLifecycle + 'static,
        F: FnOnce() -> N + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.runner.post_cancellable(
            move || {
                tokio::task::spawn_local(async move {
                    debug_assert!(inner.runner.is_bound_to_current_thread());
                    let mut request_info = node_info;
                    request_info.client_id = inner
                        .client_info
                        .lock()
                        .expect("client info poisoned")
                        .id;

                    let mut node: Box<dyn NodeLifecycle> = Box::new(factory());
                    let master = inner.master.lock().expect("master slot poisoned").clone();
                    let Some(master) = master else {
                        node.on_error(Status::unavailable("runtime not started"));
                        return;
                    };
                    match master
                        .register_node(RegisterNodeRequest {
                            node_info: request_info,
                        })
                        .await
                    {
                        Ok(response) => {
                            info!(node = %response.node_info.name, "node registered");
                            node.on_did_create(response.node_info);
                            node.on_init();
                            inner.nodes.lock().expect("node registry poisoned").push(node);
                        }
                        Err(status) => {
                            node.on_error(status.with_context("failed to register node"));
                            // Node drops here.
                        }
                    }
                });
            },
            || {},
        );
    }

    // -----------------------------------------------------------------------
    // Master stub pass-throughs
    // -----------------------------------------------------------------------

    /// Register the per-topic notification callback, then subscribe on
    /// the master.
    pub fn subscribe_topic_async(
        &self,
        request: SubscribeTopicRequest,
        topic_info_callback: NotificationCallback,
        done: ResultCallback<SubscribeTopicResponse>,
    ) {
        self.inner
            .watcher
            .register_topic_callback(&request.topic, PASSTHROUGH_TOKEN, topic_info_callback);
        self.call_master(request.topic.clone(), done, move |master| async move {
            master.subscribe_topic(request).await
        });
    }

    /// Remove the per-topic notification callback, then unsubscribe on
    /// the master.
    pub fn unsubscribe_topic_async(
        &self,
        request: UnsubscribeTopicRequest,
        done: ResultCallback<UnsubscribeTopicResponse>,
    ) {
        self.inner
            .watcher
            .unregister_topic_callback(&request.topic, PASSTHROUGH_TOKEN);
        self.call_master(request.topic.clone(), done, move |master| async move {
            master.unsubscribe_topic(request).await
        });
    }

    /// Register the per-service notification callback, then register the
    /// service client on the master.
    pub fn register_service_client_async(
        &self,
        request: RegisterServiceClientRequest,
        service_info_callback: NotificationCallback,
        done: ResultCallback<RegisterServiceClientResponse>,
    ) {
        self.inner.watcher.register_service_callback(
            &request.service,
            PASSTHROUGH_TOKEN,
            service_info_callback,
        );
        self.call_master(request.service.clone(), done, move |master| async move {
            master.register_service_client(request).await
        });
    }

    /// Remove the per-service notification callback, then unregister the
    /// service client on the master.
    pub fn unregister_service_client_async(
        &self,
        request: UnregisterServiceClientRequest,
        done: ResultCallback<UnregisterServiceClientResponse>,
    ) {
        self.inner
            .watcher
            .unregister_service_callback(&request.service, PASSTHROUGH_TOKEN);
        self.call_master(request.service.clone(), done, move |master| async move {
            master.unregister_service_client(request).await
        });
    }

    pub fn publish_topic_async(
        &self,
        request: PublishTopicRequest,
        done: ResultCallback<PublishTopicResponse>,
    ) {
        self.call_master(request.topic_info.topic.clone(), done, move |master| async move {
            master.publish_topic(request).await
        });
    }

    pub fn unpublish_topic_async(
        &self,
        request: UnpublishTopicRequest,
        done: ResultCallback<UnpublishTopicResponse>,
    ) {
        self.call_master(request.topic.clone(), done, move |master| async move {
            master.unpublish_topic(request).await
        });
    }

    pub fn unregister_node_async(
        &self,
        request: UnregisterNodeRequest,
        done: ResultCallback<UnregisterNodeResponse>,
    ) {
        self.call_master(request.node_info.name.clone(), done, move |master| async move {
            master.unregister_node(request).await
        });
    }

    pub fn register_service_server_async(
        &self,
        request: RegisterServiceServerRequest,
        done: ResultCallback<RegisterServiceServerResponse>,
    ) {
        self.call_master(request.service_info.service.clone(), done, move |master| async move {
            master.register_service_server(request).await
        });
    }

    pub fn unregister_service_server_async(
        &self,
        request: UnregisterServiceServerRequest,
        done: ResultCallback<UnregisterServiceServerResponse>,
    ) {
        self.call_master(request.service.clone(), done, move |master| async move {
            master.unregister_service_server(request).await
        });
    }

    pub fn list_clients_async(&self, done: ResultCallback<ListClientsResponse>) {
        self.call_master(String::new(), done, move |master| async move {
            master.list_clients(ListClientsRequest {}).await
        });
    }

    pub fn list_nodes_async(&self, done: ResultCallback<ListNodesResponse>) {
        self.call_master(String::new(), done, move |master| async move {
            master.list_nodes(ListNodesRequest {}).await
        });
    }

    pub fn list_topics_async(&self, done: ResultCallback<ListTopicsResponse>) {
        self.call_master(String::new(), done, move |master| async move {
            master.list_topics(ListTopicsRequest {}).await
        });
    }

    pub fn list_services_async(&self, done: ResultCallback<ListServicesResponse>) {
        self.call_master(String::new(), done, move |master| async move {
            master.list_services(ListServicesRequest {}).await
        });
    }

    /// Post a master call onto the proxy thread, resolving `done` there.
    fn call_master<R, Fut>(
        &self,
        label: String,
        done: ResultCallback<R>,
        call: impl FnOnce(MasterClient) -> Fut + Send + 'static,
    ) where
        R: Send + 'static,
        Fut: std::future::Future<Output = Result<R, Status>> + 'static,
    {
        let inner = self.inner.clone();
        let done = SharedOnce::new(done);
        let cancel_done = done.clone();
        self.inner.runner.post_cancellable(
            move || {
                let master = inner.master.lock().expect("master slot poisoned").clone();
                match master {
                    Some(master) => {
                        tokio::task::spawn_local(async move {
                            let result = call(master).await;
                            if let Err(status) = &result {
                                debug!(label = %label, status = %status, "master call failed");
                            }
                            done.invoke(result);
                        });
                    }
                    None => done.invoke(Err(Status::unavailable("runtime not started"))),
                }
            },
            move || cancel_done.invoke(Err(Status::cancelled())),
        );
    }

    // -----------------------------------------------------------------------
    // Crate-internal plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    pub(crate) fn master_client(&self) -> Option<MasterClient> {
        self.inner.master.lock().expect("master slot poisoned").clone()
    }

    pub(crate) fn watcher(&self) -> &NotificationWatcher {
        &self.inner.watcher
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.connect_timeout_ms)
    }

    pub(crate) fn add_republish(&self, topic: &str, node_info: NodeInfo, topic_info: TopicInfo) {
        self.inner
            .republish
            .lock()
            .expect("republish map poisoned")
            .insert(topic.to_owned(), (node_info, topic_info));
    }

    pub(crate) fn remove_republish(&self, topic: &str) {
        self.inner
            .republish
            .lock()
            .expect("republish map poisoned")
            .remove(topic);
    }
}

/// Result-typed completion callback, resolved on the proxy thread.
pub type ResultCallback<R> = Box<dyn FnOnce(Result<R, Status>) + Send + 'static>;

/// Opaque token used by the `*_async` pass-throughs, which keep at most
/// one notification callback per key.
const PASSTHROUGH_TOKEN: u64 = 0;

// ---------------------------------------------------------------------------
// Startup / shutdown (proxy thread)
// ---------------------------------------------------------------------------

async fn startup(inner: Arc<ProxyInner>) -> Result<(), Status> {
    let master_source = ChannelSource::Tcp {
        addr: inner.config.master_addr,
    };
    let connect_timeout = Duration::from_millis(inner.config.connect_timeout_ms);
    info!(master = %master_source, "connecting to master");

    let master = MasterClient::connect_tcp(&master_source, connect_timeout)
        .await
        .map_err(|s| s.with_context("connecting to master"))?;
    *inner.master.lock().expect("master slot poisoned") = Some(master.clone());

    let watcher_source = inner.watcher.start(inner.quit_tx.subscribe()).await?;
    let signaller =
        HeartBeatSignaller::start(inner.client_info.clone(), inner.quit_tx.subscribe()).await?;
    {
        let mut client_info = inner.client_info.lock().expect("client info poisoned");
        client_info.master_notification_watcher_source = Some(watcher_source);
        client_info.heart_beat_signaller_source = Some(signaller.channel_source().clone());
    }

    let request = RegisterClientRequest {
        client_info: inner.client_info.lock().expect("client info poisoned").clone(),
    };
    let response = master
        .register_client(request)
        .await
        .map_err(|s| s.with_context("registering client"))?;
    if response.id == 0 {
        return Err(Status::internal("master assigned a zero client id"));
    }
    inner.client_info.lock().expect("client info poisoned").id = response.id;
    info!(client_id = response.id, "client registered with master");

    // After a master restart the watcher sees a fresh connection; all
    // registered topics are advertised again.
    let hook_inner = inner.clone();
    inner.watcher.add_reconnect_hook(move || {
        let entries: Vec<(NodeInfo, TopicInfo)> = hook_inner
            .republish
            .lock()
            .expect("republish map poisoned")
            .values()
            .cloned()
            .collect();
        let master = hook_inner.master.lock().expect("master slot poisoned").clone();
        let Some(master) = master else { return };
        for (node_info, topic_info) in entries {
            let master = master.clone();
            tokio::task::spawn_local(async move {
                let topic = topic_info.topic.clone();
                match master
                    .publish_topic(PublishTopicRequest {
                        node_info,
                        topic_info,
                    })
                    .await
                {
                    Ok(_) => info!(topic = %topic, "re-registered topic after master restart"),
                    Err(status) => {
                        warn!(topic = %topic, status = %status, "topic re-registration failed");
                    }
                }
            });
        }
    });

    Ok(())
}

async fn shutdown(inner: Arc<ProxyInner>) {
    info!("stopping master proxy");
    debug_assert!(inner.runner.is_bound_to_current_thread());

    let mut nodes = std::mem::take(&mut *inner.nodes.lock().expect("node registry poisoned"));
    for node in &mut nodes {
        node.on_shutdown();
    }
    drop(nodes);

    let master = inner.master.lock().expect("master slot poisoned").clone();
    let client_id = inner.client_info.lock().expect("client info poisoned").id;
    if let Some(master) = master {
        if client_id != 0 {
            let goodbye = master.unregister_client(UnregisterClientRequest { id: client_id });
            if tokio::time::timeout(Duration::from_secs(2), goodbye).await.is_err() {
                debug!("unregister_client timed out; master will GC on heart-beat expiry");
            }
        }
    }

    let _ = inner.quit_tx.send(true);
    *inner.state.lock().expect("proxy state poisoned") = ProxyState::Stopped;
    inner.runner.quit();
}

async fn handle_signals() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else { return };
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
        let Ok(mut sighup) = signal(SignalKind::hangup()) else { return };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
        info!("signal received, stopping");
        MasterProxy::instance().stop();
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping");
            MasterProxy::instance().stop();
        }
    }
}
