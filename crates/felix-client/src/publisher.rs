//! Per-topic outbound flow.
//!
//! A registered publisher owns one listening channel per advertised kind.
//! Subscribers connect after the master tells them about the topic; each
//! accepted peer gets its own bounded queue and writer task.  At most one
//! send is in flight per peer; when a queue overflows, frames are dropped
//! from the head so the newest always survive.  A failing peer is
//! disconnected on its own — the registration stays.

use crate::proxy::MasterProxy;
use crate::task_runner::{SharedDone, StatusCallback};
use felix_channel::{Channel, ChannelConfig, ChannelListener};
use felix_protocol::{
    ChannelKind, ChannelKindMask, ChannelSource, NodeInfo, PublishTopicRequest, Status, StatusCode,
    TopicInfo, UnpublishTopicRequest,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Registration ring shared by publishers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
}

/// Flow-control knobs for one publisher registration.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Max pending outbound frames per peer; overflow drops the oldest.
    pub queue_size: usize,
    /// Send buffer capacity (fixed), or initial size when dynamic.
    pub buffer_size: usize,
    /// Grow buffers to the frame size on demand.
    pub is_dynamic_buffer: bool,
    /// Minimum interval between successive publishes; zero = no throttle.
    /// Publishes arriving inside the window are coalesced, newest wins.
    pub period: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            queue_size: 100,
            buffer_size: felix_channel::DEFAULT_BUFFER_SIZE,
            is_dynamic_buffer: false,
            period: Duration::ZERO,
        }
    }
}

/// Invoked once per peer send attempt with the peer's kind and outcome.
pub type SendDoneCallback = Arc<dyn Fn(ChannelKind, Status) + Send + Sync>;

enum PubCommand {
    Publish {
        payload: Arc<Vec<u8>>,
        on_each: Option<SendDoneCallback>,
    },
}

pub struct Publisher {
    type_name: String,
    state: Arc<StdMutex<RegistrationState>>,
    command_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<PubCommand>>>>,
    quit_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    registration: Arc<StdMutex<Option<(NodeInfo, String)>>>,
}

impl Publisher {
    /// `type_name` names the message schema both endpoints agree on.
    pub fn new(type_name: impl Into<String>) -> Self {
        Publisher {
            type_name: type_name.into(),
            state: Arc::new(StdMutex::new(RegistrationState::Unregistered)),
            command_tx: Arc::new(StdMutex::new(None)),
            quit_tx: Arc::new(StdMutex::new(None)),
            registration: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_registered(&self) -> bool {
        *self.state.lock().expect("publisher state poisoned") == RegistrationState::Registered
    }

    pub fn is_unregistered(&self) -> bool {
        *self.state.lock().expect("publisher state poisoned") == RegistrationState::Unregistered
    }

    /// Open listening channels for every kind in `kinds`, advertise the
    /// topic to the master, and transition to REGISTERED.  `done` runs on
    /// the proxy task runner.
    ///
    /// A second registration before `request_unpublish` fails with
    /// `AlreadyExists` and leaves the existing registration untouched.
    pub fn request_publish(
        &self,
        node_info: NodeInfo,
        topic: &str,
        kinds: ChannelKindMask,
        settings: PublisherSettings,
        done: StatusCallback,
    ) {
        let proxy = MasterProxy::instance();
        {
            let mut state = self.state.lock().expect("publisher state poisoned");
            if *state != RegistrationState::Unregistered {
                let topic = topic.to_owned();
                proxy.post_task(move || {
                    done(Status::already_exists(format!(
                        "publisher for {topic} already registered"
                    )));
                });
                return;
            }
            if kinds.is_empty() {
                proxy.post_task(move || {
                    done(Status::invalid_argument("no channel kinds selected"));
                });
                return;
            }
            *state = RegistrationState::Registering;
        }
        *self.registration.lock().expect("publisher registration poisoned") =
            Some((node_info.clone(), topic.to_owned()));

        let done = SharedDone::new(done);
        let ctx = RegisterContext {
            state: self.state.clone(),
            command_tx: self.command_tx.clone(),
            quit_tx: self.quit_tx.clone(),
            node_info,
            topic: topic.to_owned(),
            type_name: self.type_name.clone(),
            kinds,
            settings,
        };
        let cancel_state = self.state.clone();
        let cancel_done = done.clone();
        proxy.runner().post_cancellable(
            move || {
                tokio::task::spawn_local(register_flow(ctx, done));
            },
            move || {
                *cancel_state.lock().expect("publisher state poisoned") =
                    RegistrationState::Unregistered;
                cancel_done.invoke(Status::cancelled());
            },
        );
    }

    /// Serialize once, enqueue for every connected peer.  Never blocks;
    /// overflow and throttling are resolved newest-wins.
    pub fn publish(&self, payload: Vec<u8>, on_each: Option<SendDoneCallback>) -> Status {
        if !self.is_registered() {
            return Status::aborted("publisher is not registered");
        }
        let tx = self
            .command_tx
            .lock()
            .expect("publisher command slot poisoned")
            .clone();
        match tx {
            Some(tx) => {
                let sent = tx.send(PubCommand::Publish {
                    payload: Arc::new(payload),
                    on_each,
                });
                if sent.is_err() {
                    return Status::aborted("publisher flow already shut down");
                }
                Status::ok()
            }
            None => Status::aborted("publisher is not registered"),
        }
    }

    /// Withdraw the topic from the master and close all local resources.
    /// If the master is unreachable the local teardown still happens and
    /// the master garbage-collects on heart-beat expiry.
    pub fn request_unpublish(&self, node_info: NodeInfo, topic: &str, done: StatusCallback) {
        let proxy = MasterProxy::instance();
        {
            let mut state = self.state.lock().expect("publisher state poisoned");
            if *state != RegistrationState::Registered {
                let topic = topic.to_owned();
                proxy.post_task(move || {
                    done(Status::aborted(format!("publisher for {topic} is not registered")));
                });
                return;
            }
            *state = RegistrationState::Unregistering;
        }

        let done = SharedDone::new(done);
        let state = self.state.clone();
        let command_tx = self.command_tx.clone();
        let quit_tx = self.quit_tx.clone();
        let registration = self.registration.clone();
        let topic = topic.to_owned();
        let cancel_done = done.clone();
        proxy.runner().post_cancellable(
            move || {
                tokio::task::spawn_local(async move {
                    let status = match MasterProxy::instance().master_client() {
                        Some(master) => master
                            .unpublish_topic(UnpublishTopicRequest {
                                node_info,
                                topic: topic.clone(),
                            })
                            .await
                            .map(|_| Status::ok())
                            .unwrap_or_else(|status| status),
                        None => Status::unavailable("runtime not started"),
                    };
                    if !status.is_ok() {
                        warn!(topic = %topic, status = %status, "unpublish not acknowledged by master");
                    }

                    // Local teardown happens regardless of the master.
                    command_tx.lock().expect("publisher command slot poisoned").take();
                    if let Some(quit) = quit_tx.lock().expect("publisher quit slot poisoned").take()
                    {
                        let _ = quit.send(true);
                    }
                    registration.lock().expect("publisher registration poisoned").take();
                    MasterProxy::instance().remove_republish(&topic);
                    *state.lock().expect("publisher state poisoned") =
                        RegistrationState::Unregistered;
                    done.invoke(status);
                });
            },
            move || cancel_done.invoke(Status::cancelled()),
        );
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let state = *self.state.lock().expect("publisher state poisoned");
        if state == RegistrationState::Unregistered {
            return;
        }
        tracing::error!(
            ?state,
            "publisher dropped while registered; unregistering best-effort"
        );
        if let Some((node_info, topic)) =
            self.registration.lock().expect("publisher registration poisoned").clone()
        {
            let quit_tx = self.quit_tx.clone();
            let command_tx = self.command_tx.clone();
            MasterProxy::instance().post_task(move || {
                command_tx.lock().expect("publisher command slot poisoned").take();
                if let Some(quit) = quit_tx.lock().expect("publisher quit slot poisoned").take() {
                    let _ = quit.send(true);
                }
                let proxy = MasterProxy::instance();
                proxy.remove_republish(&topic);
                if let Some(master) = proxy.master_client() {
                    tokio::task::spawn_local(async move {
                        let _ = master
                            .unpublish_topic(UnpublishTopicRequest { node_info, topic })
                            .await;
                    });
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Registration flow (proxy thread)
// ---------------------------------------------------------------------------

struct RegisterContext {
    state: Arc<StdMutex<RegistrationState>>,
    command_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<PubCommand>>>>,
    quit_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    node_info: NodeInfo,
    topic: String,
    type_name: String,
    kinds: ChannelKindMask,
    settings: PublisherSettings,
}

async fn register_flow(ctx: RegisterContext, done: SharedDone) {
    let proxy = MasterProxy::instance();
    let config = channel_config(&ctx.settings, proxy.connect_timeout());

    let mut listeners = Vec::new();
    for kind in ctx.kinds.iter_preferred() {
        match ChannelListener::listen(&ChannelSource::pick_random(kind)).await {
            Ok(listener) => listeners.push(Rc::new(listener)),
            Err(status) => {
                *ctx.state.lock().expect("publisher state poisoned") =
                    RegistrationState::Unregistered;
                done.invoke(status.with_context("opening topic listener"));
                return;
            }
        }
    }
    let sources: Vec<ChannelSource> = listeners.iter().map(|l| l.channel_source()).collect();

    let topic_info = TopicInfo {
        topic: ctx.topic.clone(),
        type_name: ctx.type_name.clone(),
        topic_source: sources,
        impl_type: felix_protocol::ImplType::Native,
    };

    let Some(master) = proxy.master_client() else {
        *ctx.state.lock().expect("publisher state poisoned") = RegistrationState::Unregistered;
        done.invoke(Status::unavailable("runtime not started"));
        return;
    };

    let request = PublishTopicRequest {
        node_info: ctx.node_info.clone(),
        topic_info: topic_info.clone(),
    };
    if let Err(status) = master.publish_topic(request).await {
        // Listeners drop here; registration reverts untouched.
        *ctx.state.lock().expect("publisher state poisoned") = RegistrationState::Unregistered;
        done.invoke(status.with_context("master refused topic"));
        return;
    }

    let (quit_send, quit) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    *ctx.command_tx.lock().expect("publisher command slot poisoned") = Some(cmd_tx);
    *ctx.quit_tx.lock().expect("publisher quit slot poisoned") = Some(quit_send);

    let flow = Rc::new(FlowState {
        peers: RefCell::new(Vec::new()),
        settings: ctx.settings.clone(),
    });

    for listener in &listeners {
        // SHM has no accept handshake: its writer is a standing peer.
        if let Some(channel) = listener.shm_writer(&config) {
            add_peer(&flow, channel, quit.clone());
        }
    }
    for listener in listeners {
        tokio::task::spawn_local(accept_loop(listener, flow.clone(), config.clone(), quit.clone()));
    }
    tokio::task::spawn_local(pump(cmd_rx, flow, quit));

    proxy.add_republish(&ctx.topic, ctx.node_info.clone(), topic_info);
    *ctx.state.lock().expect("publisher state poisoned") = RegistrationState::Registered;
    info!(topic = %ctx.topic, "topic registered");
    done.invoke(Status::ok());
}

fn channel_config(settings: &PublisherSettings, connect_timeout: Duration) -> ChannelConfig {
    ChannelConfig {
        send_buffer_size: settings.buffer_size,
        receive_buffer_size: settings.buffer_size,
        dynamic_send_buffer: settings.is_dynamic_buffer,
        dynamic_receive_buffer: settings.is_dynamic_buffer,
        connect_timeout,
    }
}

// ---------------------------------------------------------------------------
// Peer flow (proxy thread, `Rc` state inside the local set)
// ---------------------------------------------------------------------------

struct FlowState {
    peers: RefCell<Vec<Rc<Peer>>>,
    settings: PublisherSettings,
}

struct Peer {
    kind: ChannelKind,
    channel: Channel,
    queue: RefCell<VecDeque<(Arc<Vec<u8>>, Option<SendDoneCallback>)>>,
    wake: Notify,
    gone: Cell<bool>,
}

fn add_peer(flow: &Rc<FlowState>, channel: Channel, quit: watch::Receiver<bool>) {
    let peer = Rc::new(Peer {
        kind: channel.kind(),
        channel,
        queue: RefCell::new(VecDeque::new()),
        wake: Notify::new(),
        gone: Cell::new(false),
    });
    flow.peers.borrow_mut().push(peer.clone());
    tokio::task::spawn_local(peer_writer(peer, flow.clone(), quit));
}

async fn accept_loop(
    listener: Rc<ChannelListener>,
    flow: Rc<FlowState>,
    config: ChannelConfig,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept(&config) => match accepted {
                Ok(channel) => {
                    info!(peer = %channel.describe(), "subscriber attached");
                    add_peer(&flow, channel, quit.clone());
                }
                Err(status) => {
                    // E.g. a failed WS handshake; the listener itself is
                    // usually still fine.
                    warn!(status = %status, "peer accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = quit.changed() => break,
        }
    }
}

/// Fans publishes out to per-peer queues, honoring the publish period.
async fn pump(
    mut cmd_rx: mpsc::UnboundedReceiver<PubCommand>,
    flow: Rc<FlowState>,
    mut quit: watch::Receiver<bool>,
) {
    let period = flow.settings.period;
    let mut last_publish: Option<tokio::time::Instant> = None;
    let mut held: Option<(Arc<Vec<u8>>, Option<SendDoneCallback>)> = None;

    loop {
        let deadline = if held.is_some() {
            last_publish.map(|at| at + period)
        } else {
            None
        };
        tokio::select! {
            command = cmd_rx.recv() => match command {
                None => break,
                Some(PubCommand::Publish { payload, on_each }) => {
                    let now = tokio::time::Instant::now();
                    let throttled = period > Duration::ZERO
                        && last_publish.is_some_and(|at| now < at + period);
                    if throttled {
                        // Coalesce inside the window: newest wins.
                        held = Some((payload, on_each));
                    } else {
                        fan_out(&flow, payload, on_each);
                        last_publish = Some(now);
                    }
                }
            },
            () = sleep_until_opt(deadline) => {
                if let Some((payload, on_each)) = held.take() {
                    fan_out(&flow, payload, on_each);
                    last_publish = Some(tokio::time::Instant::now());
                }
            },
            _ = quit.changed() => break,
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn fan_out(flow: &Rc<FlowState>, payload: Arc<Vec<u8>>, on_each: Option<SendDoneCallback>) {
    let peers = flow.peers.borrow().clone();
    for peer in peers {
        if peer.gone.get() {
            continue;
        }
        {
            let mut queue = peer.queue.borrow_mut();
            queue.push_back((payload.clone(), on_each.clone()));
            // Newest wins: drop from the head.
            while queue.len() > flow.settings.queue_size.max(1) {
                queue.pop_front();
                debug!(peer = %peer.channel.describe(), "peer queue overflow, dropping oldest");
            }
        }
        peer.wake.notify_one();
    }
}

/// One in-flight send per peer: a single sequential writer.
async fn peer_writer(peer: Rc<Peer>, flow: Rc<FlowState>, mut quit: watch::Receiver<bool>) {
    loop {
        let (payload, on_each) = loop {
            if *quit.borrow() || peer.gone.get() {
                return;
            }
            let item = peer.queue.borrow_mut().pop_front();
            if let Some(item) = item {
                break item;
            }
            tokio::select! {
                _ = peer.wake.notified() => {}
                _ = quit.changed() => return,
            }
        };

        let status = match peer.channel.send_message(&payload).await {
            Ok(()) => Status::ok(),
            Err(status) => status,
        };
        if let Some(callback) = &on_each {
            callback(peer.kind, status.clone());
        }
        if !status.is_ok() && status.code != StatusCode::NotEnoughBuffer {
            // Disconnect this peer only; the registration stays.
            warn!(peer = %peer.channel.describe(), status = %status, "peer send failed, dropping peer");
            peer.gone.set(true);
            flow.peers.borrow_mut().retain(|p| !Rc::ptr_eq(p, &peer));
            return;
        }
    }
}
