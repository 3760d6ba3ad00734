//! Master notification watcher.
//!
//! Listens on a TCP endpoint advertised to the master during
//! `RegisterClient`; the master holds one long-lived connection and pushes
//! notification frames.  Callbacks are keyed `(name, opaque)` and fire in
//! registration order over a snapshot, so unregistering from inside a
//! callback is safe.  Callbacks registered after a notification was
//! dispatched do not see it.

use felix_channel::tcp::TcpChannelListener;
use felix_channel::ChannelConfig;
use felix_protocol::{ChannelKind, ChannelSource, Notification, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type NotificationCallback = Arc<StdMutex<Box<dyn FnMut(&Notification) + Send>>>;

/// Make a [`NotificationCallback`] from a closure.
pub fn notification_callback(
    callback: impl FnMut(&Notification) + Send + 'static,
) -> NotificationCallback {
    Arc::new(StdMutex::new(Box::new(callback)))
}

type CallbackMap = StdMutex<HashMap<String, Vec<(u64, NotificationCallback)>>>;

#[derive(Clone)]
pub struct NotificationWatcher {
    shared: Arc<WatcherShared>,
}

struct WatcherShared {
    topics: CallbackMap,
    services: CallbackMap,
    /// Fired when the master re-attaches after losing its connection.
    reconnect_hooks: StdMutex<Vec<Box<dyn Fn() + Send>>>,
}

impl NotificationWatcher {
    pub fn new() -> Self {
        NotificationWatcher {
            shared: Arc::new(WatcherShared {
                topics: StdMutex::new(HashMap::new()),
                services: StdMutex::new(HashMap::new()),
                reconnect_hooks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Bind the watcher endpoint and spawn the accept loop.  Must be
    /// called on the proxy task runner.
    pub async fn start(&self, quit: watch::Receiver<bool>) -> Result<ChannelSource, Status> {
        let listener =
            TcpChannelListener::listen(&ChannelSource::pick_random(ChannelKind::Tcp)).await?;
        let source = listener.channel_source();
        info!(source = %source, "notification watcher listening");

        let shared = self.shared.clone();
        tokio::task::spawn_local(accept_loop(listener, shared, quit));

        Ok(source)
    }

    pub fn register_topic_callback(
        &self,
        topic: &str,
        opaque: u64,
        callback: NotificationCallback,
    ) {
        register(&self.shared.topics, topic, opaque, callback);
    }

    pub fn unregister_topic_callback(&self, topic: &str, opaque: u64) {
        unregister(&self.shared.topics, topic, opaque);
    }

    pub fn register_service_callback(
        &self,
        service: &str,
        opaque: u64,
        callback: NotificationCallback,
    ) {
        register(&self.shared.services, service, opaque, callback);
    }

    pub fn unregister_service_callback(&self, service: &str, opaque: u64) {
        unregister(&self.shared.services, service, opaque);
    }

    /// Run `hook` every time the master re-attaches after the first
    /// connection (used to re-advertise registrations after a master
    /// restart).
    pub fn add_reconnect_hook(&self, hook: impl Fn() + Send + 'static) {
        self.shared
            .reconnect_hooks
            .lock()
            .expect("reconnect hooks poisoned")
            .push(Box::new(hook));
    }

    /// Dispatch one notification to every callback registered under its
    /// key, in registration order, over a snapshot.
    pub fn dispatch(&self, notification: &Notification) {
        let map = match notification {
            Notification::NewTopic(_) | Notification::TopicGone(_) => &self.shared.topics,
            Notification::NewService(_) | Notification::ServiceGone(_) => &self.shared.services,
        };
        let snapshot: Vec<NotificationCallback> = map
            .lock()
            .expect("watcher callbacks poisoned")
            .get(notification.key())
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in snapshot {
            let mut callback = callback.lock().expect("notification callback poisoned");
            (*callback)(notification);
        }
    }
}

impl Default for NotificationWatcher {
    fn default() -> Self {
        NotificationWatcher::new()
    }
}

fn register(map: &CallbackMap, key: &str, opaque: u64, callback: NotificationCallback) {
    map.lock()
        .expect("watcher callbacks poisoned")
        .entry(key.to_owned())
        .or_default()
        .push((opaque, callback));
}

fn unregister(map: &CallbackMap, key: &str, opaque: u64) {
    let mut map = map.lock().expect("watcher callbacks poisoned");
    if let Some(entries) = map.get_mut(key) {
        entries.retain(|(token, _)| *token != opaque);
        if entries.is_empty() {
            map.remove(key);
        }
    }
}

async fn accept_loop(
    listener: TcpChannelListener,
    shared: Arc<WatcherShared>,
    mut quit: watch::Receiver<bool>,
) {
    let config = ChannelConfig {
        dynamic_receive_buffer: true,
        ..ChannelConfig::default()
    };
    let watcher = NotificationWatcher { shared };
    let mut first_connection = true;
    // The master holds one long-lived connection.  A new accept while one
    // is live means the master restarted (the dead half may linger), so
    // the newest connection always wins.
    let mut current: Option<Arc<felix_channel::tcp::TcpChannel>> = None;

    loop {
        if let Some(channel) = current.clone() {
            tokio::select! {
                received = channel.receive_message() => match received {
                    Ok(body) => match Notification::decode(&body) {
                        Ok(notification) => {
                            debug!(key = notification.key(), type_byte = notification.type_byte(), "notification");
                            watcher.dispatch(&notification);
                        }
                        Err(status) => {
                            warn!(status = %status, "dropping undecodable notification");
                        }
                    },
                    Err(status) => {
                        debug!(status = %status, "master notification connection closed");
                        current = None;
                    }
                },
                accepted = listener.accept(&config) => {
                    if let Ok(channel) = accepted {
                        info!("master re-attached to notification watcher");
                        current = Some(Arc::new(channel));
                        fire_reconnect_hooks(&watcher);
                    }
                },
                _ = quit.changed() => return,
            }
        } else {
            tokio::select! {
                accepted = listener.accept(&config) => match accepted {
                    Ok(channel) => {
                        current = Some(Arc::new(channel));
                        if first_connection {
                            first_connection = false;
                        } else {
                            info!("master re-attached to notification watcher");
                            fire_reconnect_hooks(&watcher);
                        }
                    }
                    Err(status) => {
                        warn!(status = %status, "notification watcher accept failed");
                        return;
                    }
                },
                _ = quit.changed() => return,
            }
        }
    }
}

fn fire_reconnect_hooks(watcher: &NotificationWatcher) {
    let hooks = watcher
        .shared
        .reconnect_hooks
        .lock()
        .expect("reconnect hooks poisoned");
    for hook in hooks.iter() {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_protocol::TopicInfo;
    use std::sync::Mutex;

    fn new_topic(name: &str) -> Notification {
        Notification::NewTopic(TopicInfo {
            topic: name.to_owned(),
            type_name: "bytes".to_owned(),
            topic_source: vec![],
            impl_type: felix_protocol::ImplType::Native,
        })
    }

    #[test]
    fn fan_out_fires_in_registration_order() {
        let watcher = NotificationWatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u64 {
            let order = order.clone();
            watcher.register_topic_callback(
                "chatter",
                i,
                notification_callback(move |_| order.lock().unwrap().push(i)),
            );
        }

        watcher.dispatch(&new_topic("chatter"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Each callback fires exactly once per notification.
        watcher.dispatch(&new_topic("chatter"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn unregistered_callback_no_longer_fires() {
        let watcher = NotificationWatcher::new();
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        watcher.register_topic_callback(
            "chatter",
            7,
            notification_callback(move |_| *count2.lock().unwrap() += 1),
        );

        watcher.dispatch(&new_topic("chatter"));
        watcher.unregister_topic_callback("chatter", 7);
        watcher.dispatch(&new_topic("chatter"));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn unregister_from_within_callback_is_safe() {
        let watcher = NotificationWatcher::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let watcher2 = watcher.clone();
        let fired1 = fired.clone();
        watcher.register_topic_callback(
            "chatter",
            1,
            notification_callback(move |_| {
                fired1.lock().unwrap().push(1);
                watcher2.unregister_topic_callback("chatter", 2);
            }),
        );
        let fired2 = fired.clone();
        watcher.register_topic_callback(
            "chatter",
            2,
            notification_callback(move |_| fired2.lock().unwrap().push(2)),
        );

        // Snapshot iteration: callback 2 still fires this round.
        watcher.dispatch(&new_topic("chatter"));
        assert_eq!(*fired.lock().unwrap(), vec![1, 2]);

        watcher.dispatch(&new_topic("chatter"));
        assert_eq!(*fired.lock().unwrap(), vec![1, 2, 1]);
    }

    #[test]
    fn keys_are_isolated() {
        let watcher = NotificationWatcher::new();
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();
        watcher.register_topic_callback(
            "left",
            1,
            notification_callback(move |_| *fired2.lock().unwrap() += 1),
        );
        watcher.dispatch(&new_topic("right"));
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn service_and_topic_maps_are_distinct() {
        let watcher = NotificationWatcher::new();
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();
        watcher.register_service_callback(
            "chatter",
            1,
            notification_callback(move |_| *fired2.lock().unwrap() += 1),
        );
        // A topic notification under the same name must not cross over.
        watcher.dispatch(&new_topic("chatter"));
        assert_eq!(*fired.lock().unwrap(), 0);

        watcher.dispatch(&Notification::ServiceGone("chatter".to_owned()));
        assert_eq!(*fired.lock().unwrap(), 1);
    }
}
