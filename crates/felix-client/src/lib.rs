// felix-client: The client-side runtime.
//
// A process hosts one MasterProxy, which registers the client with the
// master, keeps it alive through the heart-beat signaller, learns about
// topic and service changes through the notification watcher, and runs
// every user callback on one proxy thread.  Nodes live inside the proxy;
// publishers and subscribers live inside nodes.

pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod master_client;
pub mod node;
pub mod proxy;
pub mod publisher;
pub mod subscriber;
pub mod task_runner;
pub mod watcher;

pub use config::{load_config, ClientConfig};
pub use master_client::{MasterClient, MasterTransport, TcpMasterTransport};
pub use node::{DynamicPublishingNode, NodeLifecycle, RuntimeTypeDescriptor};
pub use proxy::{MasterProxy, ProxyState, ResultCallback};
pub use publisher::{Publisher, PublisherSettings, RegistrationState, SendDoneCallback};
pub use subscriber::{Subscriber, SubscriberSettings};
pub use task_runner::{StatusCallback, TaskRunner};
pub use watcher::{notification_callback, NotificationWatcher};

pub use felix_protocol::*;
