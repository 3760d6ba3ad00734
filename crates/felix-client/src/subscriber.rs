//! Per-topic inbound flow.
//!
//! A registered subscriber learns where the publisher lives from NEW_TOPIC
//! notifications, connects one channel (preferring SHM > TCP > UDP > WS),
//! and runs a receive loop.  Frames are handed to `on_message` through a
//! bounded dispatch queue (newest wins on overflow, optionally rate
//! limited).  A broken channel surfaces on `on_error` and the subscriber
//! waits for a fresh NEW_TOPIC before reconnecting, backing off
//! exponentially while the advertised address stays the same.

use crate::proxy::MasterProxy;
use crate::publisher::RegistrationState;
use crate::task_runner::{SharedDone, StatusCallback};
use crate::watcher::notification_callback;
use felix_channel::{Channel, ChannelConfig};
use felix_protocol::{
    ChannelKindMask, ChannelSource, NodeInfo, Notification, Status, StatusCode,
    SubscribeTopicRequest, TopicInfo, UnsubscribeTopicRequest, KIND_PREFERENCE,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Flow-control knobs for one subscriber registration.
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Inbound dispatch queue depth per publisher; overflow keeps the
    /// newest frames.
    pub queue_size: usize,
    /// Maximum dispatch frequency; faster arrivals coalesce, newest wins.
    /// Zero = dispatch as fast as frames arrive.
    pub period: Duration,
    /// Receive buffer capacity, or initial size when dynamic.
    pub buffer_size: usize,
    /// Grow the receive buffer to the frame size on demand.
    pub is_dynamic_buffer: bool,
    /// Parse each payload as JSON before dispatch (dynamic-typed topics);
    /// failures surface as `FailedToParse` on `on_error`.
    pub expect_json: bool,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        SubscriberSettings {
            queue_size: 1,
            period: Duration::ZERO,
            buffer_size: felix_channel::DEFAULT_BUFFER_SIZE,
            is_dynamic_buffer: false,
            expect_json: false,
        }
    }
}

pub type MessageCallback = Box<dyn FnMut(Vec<u8>) + Send>;
pub type ErrorCallback = Box<dyn FnMut(Status) + Send>;

/// Distinguishes subscriber registrations within the watcher maps.
static NEXT_SUBSCRIBER_TOKEN: AtomicU64 = AtomicU64::new(1);

enum SubEvent {
    NewTopic(TopicInfo),
    TopicGone,
}

pub struct Subscriber {
    token: u64,
    state: Arc<StdMutex<RegistrationState>>,
    quit_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    registration: Arc<StdMutex<Option<(NodeInfo, String)>>>,
}

impl Subscriber {
    pub fn new() -> Self {
        Subscriber {
            token: NEXT_SUBSCRIBER_TOKEN.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(StdMutex::new(RegistrationState::Unregistered)),
            quit_tx: Arc::new(StdMutex::new(None)),
            registration: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_registered(&self) -> bool {
        *self.state.lock().expect("subscriber state poisoned") == RegistrationState::Registered
    }

    pub fn is_unregistered(&self) -> bool {
        *self.state.lock().expect("subscriber state poisoned") == RegistrationState::Unregistered
    }

    /// Register interest in `topic`: a notification callback first, then
    /// `SubscribeTopic` on the master.  `on_message` / `on_error` / `done`
    /// all run on the proxy task runner.
    #[allow(clippy::too_many_arguments)]
    pub fn request_subscribe(
        &self,
        node_info: NodeInfo,
        topic: &str,
        kinds: ChannelKindMask,
        on_message: MessageCallback,
        on_error: ErrorCallback,
        settings: SubscriberSettings,
        done: StatusCallback,
    ) {
        let proxy = MasterProxy::instance();
        {
            let mut state = self.state.lock().expect("subscriber state poisoned");
            if *state != RegistrationState::Unregistered {
                let topic = topic.to_owned();
                proxy.post_task(move || {
                    done(Status::already_exists(format!(
                        "subscriber for {topic} already registered"
                    )));
                });
                return;
            }
            *state = RegistrationState::Registering;
        }
        *self.registration.lock().expect("subscriber registration poisoned") =
            Some((node_info.clone(), topic.to_owned()));

        let done = SharedDone::new(done);
        let ctx = SubscribeContext {
            token: self.token,
            state: self.state.clone(),
            quit_tx: self.quit_tx.clone(),
            node_info,
            topic: topic.to_owned(),
            kinds,
            settings,
        };
        let cancel_state = self.state.clone();
        let cancel_done = done.clone();
        proxy.runner().post_cancellable(
            move || {
                tokio::task::spawn_local(subscribe_flow(ctx, on_message, on_error, done));
            },
            move || {
                *cancel_state.lock().expect("subscriber state poisoned") =
                    RegistrationState::Unregistered;
                cancel_done.invoke(Status::cancelled());
            },
        );
    }

    /// Withdraw the subscription: notification callback first, then
    /// `UnsubscribeTopic`, then local teardown.  Pending frames are
    /// dropped.
    pub fn request_unsubscribe(&self, node_info: NodeInfo, topic: &str, done: StatusCallback) {
        let proxy = MasterProxy::instance();
        {
            let mut state = self.state.lock().expect("subscriber state poisoned");
            if *state != RegistrationState::Registered {
                let topic = topic.to_owned();
                proxy.post_task(move || {
                    done(Status::aborted(format!(
                        "subscriber for {topic} is not registered"
                    )));
                });
                return;
            }
            *state = RegistrationState::Unregistering;
        }

        let done = SharedDone::new(done);
        let token = self.token;
        let state = self.state.clone();
        let quit_tx = self.quit_tx.clone();
        let registration = self.registration.clone();
        let topic = topic.to_owned();
        let cancel_done = done.clone();
        proxy.runner().post_cancellable(
            move || {
                tokio::task::spawn_local(async move {
                    let proxy = MasterProxy::instance();
                    proxy.watcher().unregister_topic_callback(&topic, token);

                    let status = match proxy.master_client() {
                        Some(master) => master
                            .unsubscribe_topic(UnsubscribeTopicRequest {
                                node_info,
                                topic: topic.clone(),
                            })
                            .await
                            .map(|_| Status::ok())
                            .unwrap_or_else(|status| status),
                        None => Status::unavailable("runtime not started"),
                    };

                    if let Some(quit) = quit_tx.lock().expect("subscriber quit slot poisoned").take()
                    {
                        let _ = quit.send(true);
                    }
                    registration.lock().expect("subscriber registration poisoned").take();
                    *state.lock().expect("subscriber state poisoned") =
                        RegistrationState::Unregistered;
                    done.invoke(status);
                });
            },
            move || cancel_done.invoke(Status::cancelled()),
        );
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Subscriber::new()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let state = *self.state.lock().expect("subscriber state poisoned");
        if state == RegistrationState::Unregistered {
            return;
        }
        tracing::error!(
            ?state,
            "subscriber dropped while registered; unregistering best-effort"
        );
        if let Some((node_info, topic)) =
            self.registration.lock().expect("subscriber registration poisoned").clone()
        {
            let token = self.token;
            let quit_tx = self.quit_tx.clone();
            MasterProxy::instance().post_task(move || {
                let proxy = MasterProxy::instance();
                proxy.watcher().unregister_topic_callback(&topic, token);
                if let Some(quit) = quit_tx.lock().expect("subscriber quit slot poisoned").take() {
                    let _ = quit.send(true);
                }
                if let Some(master) = proxy.master_client() {
                    tokio::task::spawn_local(async move {
                        let _ = master
                            .unsubscribe_topic(UnsubscribeTopicRequest { node_info, topic })
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

struct SubscribeContext {
    token: u64,
    state: Arc<StdMutex<RegistrationState>>,
    quit_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    node_info: NodeInfo,
    topic: String,
    kinds: ChannelKindMask,
    settings: SubscriberSettings,
}

async fn subscribe_flow(
    ctx: SubscribeContext,
    on_message: MessageCallback,
    mut on_error: ErrorCallback,
    done: SharedDone,
) {
    let proxy = MasterProxy::instance();

    let Some(master) = proxy.master_client() else {
        *ctx.state.lock().expect("subscriber state poisoned") = RegistrationState::Unregistered;
        done.invoke(Status::unavailable("runtime not started"));
        return;
    };

    // Notification callback first: a NEW_TOPIC raced with the subscribe
    // response must not be missed.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    proxy.watcher().register_topic_callback(
        &ctx.topic,
        ctx.token,
        notification_callback(move |notification| match notification {
            Notification::NewTopic(info) => {
                let _ = event_tx.send(SubEvent::NewTopic(info.clone()));
            }
            Notification::TopicGone(_) => {
                let _ = event_tx.send(SubEvent::TopicGone);
            }
            other => {
                debug!(key = other.key(), "ignoring non-topic notification");
            }
        }),
    );

    let request = SubscribeTopicRequest {
        node_info: ctx.node_info.clone(),
        topic: ctx.topic.clone(),
    };
    if let Err(status) = master.subscribe_topic(request).await {
        proxy.watcher().unregister_topic_callback(&ctx.topic, ctx.token);
        *ctx.state.lock().expect("subscriber state poisoned") = RegistrationState::Unregistered;
        done.invoke(status.with_context("master refused subscription"));
        return;
    }

    let (quit_send, quit) = watch::channel(false);
    *ctx.quit_tx.lock().expect("subscriber quit slot poisoned") = Some(quit_send);

    let dispatch = Rc::new(DispatchQueue {
        frames: RefCell::new(VecDeque::new()),
        wake: Notify::new(),
        queue_size: ctx.settings.queue_size.max(1),
    });
    tokio::task::spawn_local(dispatcher(
        dispatch.clone(),
        on_message,
        ctx.settings.period,
        quit.clone(),
    ));
    tokio::task::spawn_local(async move {
        drive(ctx, event_rx, dispatch, &mut on_error, quit).await;
    });

    info!("topic subscribed");
    done.invoke(Status::ok());
}

// ---------------------------------------------------------------------------
// Connection driver (proxy thread)
// ---------------------------------------------------------------------------

/// Pick one kind out of the subscriber's mask and the advertised sources,
/// in [`KIND_PREFERENCE`] order.
fn pick_source(kinds: ChannelKindMask, info: &TopicInfo) -> Option<ChannelSource> {
    for kind in KIND_PREFERENCE {
        if !kinds.contains(kind) {
            continue;
        }
        if let Some(source) = info.topic_source.iter().find(|s| s.kind() == kind) {
            return Some(source.clone());
        }
    }
    None
}

async fn drive(
    ctx: SubscribeContext,
    mut events: mpsc::UnboundedReceiver<SubEvent>,
    dispatch: Rc<DispatchQueue>,
    on_error: &mut ErrorCallback,
    mut quit: watch::Receiver<bool>,
) {
    let config = ChannelConfig {
        send_buffer_size: ctx.settings.buffer_size,
        receive_buffer_size: ctx.settings.buffer_size,
        dynamic_send_buffer: ctx.settings.is_dynamic_buffer,
        dynamic_receive_buffer: ctx.settings.is_dynamic_buffer,
        connect_timeout: MasterProxy::instance().connect_timeout(),
    };

    let mut last_source: Option<ChannelSource> = None;
    let mut backoff = BACKOFF_BASE;
    // Advertisement consumed while still connected, to act on next round.
    let mut pending_info: Option<TopicInfo> = None;

    'outer: loop {
        // Wait for a publisher to appear.
        let info = match pending_info.take() {
            Some(info) => info,
            None => tokio::select! {
                event = events.recv() => match event {
                    Some(SubEvent::NewTopic(info)) => info,
                    Some(SubEvent::TopicGone) => continue 'outer,
                    None => break 'outer,
                },
                _ = quit.changed() => break 'outer,
            },
        };

        let Some(source) = pick_source(ctx.kinds, &info) else {
            debug!(topic = %ctx.topic, "no advertised source matches the kind mask");
            continue 'outer;
        };

        // Unchanged publisher address: back off before retrying; a moved
        // publisher resets the backoff.
        if last_source.as_ref() == Some(&source) {
            debug!(topic = %ctx.topic, backoff = ?backoff, "same source re-advertised, backing off");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = quit.changed() => break 'outer,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        } else {
            backoff = BACKOFF_BASE;
        }
        last_source = Some(source.clone());

        let channel = match Channel::connect(&source, &config).await {
            Ok(channel) => channel,
            Err(status) => {
                warn!(topic = %ctx.topic, source = %source, status = %status, "connect failed");
                on_error(status);
                continue 'outer;
            }
        };
        info!(topic = %ctx.topic, source = %source, "connected to publisher");

        // Receive until the channel breaks, the topic goes away, or a
        // fresh advertisement asks us to reconnect.
        loop {
            tokio::select! {
                received = channel.receive_message() => match received {
                    Ok(payload) => {
                        if ctx.settings.expect_json
                            && serde_json::from_slice::<serde_json::Value>(&payload).is_err()
                        {
                            on_error(Status::new(
                                StatusCode::FailedToParse,
                                "payload is not valid JSON",
                            ));
                            continue;
                        }
                        dispatch.push(payload);
                    }
                    Err(status) => {
                        let terminal = status.code != StatusCode::FailedToParse;
                        on_error(status);
                        if terminal {
                            // Reconnection waits for the next NEW_TOPIC.
                            continue 'outer;
                        }
                    }
                },
                event = events.recv() => match event {
                    Some(SubEvent::NewTopic(info)) => {
                        // Publisher re-advertised (e.g. after a master
                        // restart): drop the channel and reconnect.
                        debug!(topic = %ctx.topic, "re-advertisement while connected, reconnecting");
                        pending_info = Some(info);
                        continue 'outer;
                    }
                    Some(SubEvent::TopicGone) => {
                        debug!(topic = %ctx.topic, "topic gone, closing channel");
                        continue 'outer;
                    }
                    None => break 'outer,
                },
                _ = quit.changed() => break 'outer,
            }
        }
    }
    debug!(topic = %ctx.topic, "subscriber driver stopped");
}

// ---------------------------------------------------------------------------
// Dispatch queue (proxy thread)
// ---------------------------------------------------------------------------

struct DispatchQueue {
    frames: RefCell<VecDeque<Vec<u8>>>,
    wake: Notify,
    queue_size: usize,
}

impl DispatchQueue {
    fn push(&self, payload: Vec<u8>) {
        {
            let mut frames = self.frames.borrow_mut();
            frames.push_back(payload);
            // Newest wins when the consumer is slower than the wire.
            while frames.len() > self.queue_size {
                frames.pop_front();
            }
        }
        self.wake.notify_one();
    }
}

async fn dispatcher(
    queue: Rc<DispatchQueue>,
    mut on_message: MessageCallback,
    period: Duration,
    mut quit: watch::Receiver<bool>,
) {
    let mut last_dispatch: Option<tokio::time::Instant> = None;

    loop {
        let payload = loop {
            if *quit.borrow() {
                return;
            }
            let frame = queue.frames.borrow_mut().pop_front();
            if let Some(frame) = frame {
                break frame;
            }
            tokio::select! {
                _ = queue.wake.notified() => {}
                _ = quit.changed() => return,
            }
        };

        // Rate limit: coalescing already happened in the queue.
        if period > Duration::ZERO {
            if let Some(at) = last_dispatch {
                let next = at + period;
                if tokio::time::Instant::now() < next {
                    tokio::select! {
                        () = tokio::time::sleep_until(next) => {}
                        _ = quit.changed() => return,
                    }
                }
            }
        }
        if *quit.borrow() {
            return;
        }
        last_dispatch = Some(tokio::time::Instant::now());
        on_message(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_protocol::{ChannelKind, ImplType};

    fn info_with(sources: Vec<ChannelSource>) -> TopicInfo {
        TopicInfo {
            topic: "chatter".into(),
            type_name: "bytes".into(),
            topic_source: sources,
            impl_type: ImplType::Native,
        }
    }

    #[test]
    fn source_selection_prefers_shm_then_tcp() {
        let tcp = ChannelSource::Tcp {
            addr: "127.0.0.1:9000".parse().unwrap(),
        };
        let shm = ChannelSource::Shm {
            segment: "seg".into(),
            size: 1024,
        };
        let ws = ChannelSource::Ws {
            url: "ws://127.0.0.1:9001".into(),
        };
        let info = info_with(vec![ws.clone(), tcp.clone(), shm.clone()]);

        let all = ChannelKindMask::of(&[
            ChannelKind::Tcp,
            ChannelKind::Udp,
            ChannelKind::Shm,
            ChannelKind::Ws,
        ]);
        assert_eq!(pick_source(all, &info), Some(shm));

        let no_shm = ChannelKindMask::of(&[ChannelKind::Tcp, ChannelKind::Ws]);
        assert_eq!(pick_source(no_shm, &info), Some(tcp));

        let ws_only = ChannelKindMask::single(ChannelKind::Ws);
        assert_eq!(pick_source(ws_only, &info), Some(ws));

        let udp_only = ChannelKindMask::single(ChannelKind::Udp);
        assert_eq!(pick_source(udp_only, &info), None);
    }

    #[test]
    fn dispatch_queue_keeps_newest() {
        let queue = DispatchQueue {
            frames: RefCell::new(VecDeque::new()),
            wake: Notify::new(),
            queue_size: 2,
        };
        for payload in [b"a", b"b", b"c", b"d", b"e"] {
            queue.push(payload.to_vec());
        }
        let frames: Vec<_> = queue.frames.borrow().iter().cloned().collect();
        assert_eq!(frames, vec![b"d".to_vec(), b"e".to_vec()]);
    }
}
