//! Node lifecycle.
//!
//! A node is a named unit of behaviour owned by the proxy.  User code
//! never holds one after handing it to `request_register_node`; all
//! lifecycle callbacks arrive on the proxy task runner.

use crate::publisher::{Publisher, PublisherSettings};
use crate::task_runner::StatusCallback;
use felix_protocol::{ChannelKindMask, NodeInfo, Status};
use tracing::{error, info};

/// Capabilities every node provides.  `on_did_create` delivers the
/// master-assigned `NodeInfo`, then `on_init` runs; failures arrive on
/// `on_error`.  The shutdown hook is optional.
pub trait NodeLifecycle: Send {
    fn on_did_create(&mut self, node_info: NodeInfo);
    fn on_init(&mut self);
    fn on_error(&mut self, status: Status);
    fn on_shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Dynamic publishing node
// ---------------------------------------------------------------------------

/// Message schema known only at runtime.
#[derive(Debug, Clone)]
pub struct RuntimeTypeDescriptor {
    pub type_name: String,
}

/// A node that publishes one topic whose message type is resolved at
/// runtime; values travel through the JSON rendering path.
pub struct DynamicPublishingNode {
    descriptor: RuntimeTypeDescriptor,
    topic: String,
    kinds: ChannelKindMask,
    settings: PublisherSettings,
    node_info: NodeInfo,
    publisher: Option<Publisher>,
}

impl DynamicPublishingNode {
    pub fn new(
        descriptor: RuntimeTypeDescriptor,
        topic: impl Into<String>,
        kinds: ChannelKindMask,
        settings: PublisherSettings,
    ) -> Self {
        DynamicPublishingNode {
            descriptor,
            topic: topic.into(),
            kinds,
            settings,
            node_info: NodeInfo::default(),
            publisher: None,
        }
    }

    /// Publish one JSON value on the node's topic.
    pub fn publish_value(&self, value: &serde_json::Value) -> Status {
        let Some(publisher) = &self.publisher else {
            return Status::aborted("dynamic publisher is not registered");
        };
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                return Status::new(
                    felix_protocol::StatusCode::FailedToSerialize,
                    format!("json payload: {e}"),
                )
            }
        };
        publisher.publish(payload, None)
    }

    /// Withdraw the topic; the publisher is dropped once the master
    /// acknowledges (mirroring the registration flow).
    pub fn request_unpublish(&mut self, done: StatusCallback) {
        match self.publisher.take() {
            Some(publisher) => {
                publisher.request_unpublish(self.node_info.clone(), &self.topic, done);
            }
            None => done(Status::aborted("dynamic publisher is not registered")),
        }
    }
}

impl NodeLifecycle for DynamicPublishingNode {
    fn on_did_create(&mut self, node_info: NodeInfo) {
        self.node_info = node_info;
    }

    fn on_init(&mut self) {
        let publisher = Publisher::new(self.descriptor.type_name.clone());
        let topic = self.topic.clone();
        publisher.request_publish(
            self.node_info.clone(),
            &self.topic,
            self.kinds,
            self.settings.clone(),
            Box::new(move |status| {
                if status.is_ok() {
                    info!(topic = %topic, "dynamic topic registered");
                } else {
                    error!(topic = %topic, status = %status, "dynamic topic registration failed");
                }
            }),
        );
        self.publisher = Some(publisher);
    }

    fn on_error(&mut self, status: Status) {
        error!(node = %self.node_info.name, status = %status, "node error");
    }

    fn on_shutdown(&mut self) {
        // Dropping the publisher triggers its best-effort unregister.
        self.publisher.take();
    }
}
