//! Registration infos exchanged with the master.

use crate::channel_def::ChannelSource;
use serde::{Deserialize, Serialize};

/// Identity and liveness contract of one client process.
///
/// `id` is assigned by the master during `RegisterClient`; a `ClientInfo`
/// is valid only once the id is non-zero.  The two sources are the
/// endpoints of the auxiliary channels the client opens toward the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: u32,
    pub heart_beat_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_beat_signaller_source: Option<ChannelSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_notification_watcher_source: Option<ChannelSource>,
}

impl ClientInfo {
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

/// One named unit of behaviour within a client.
///
/// `watermark` is set by the master on registration and echoed back on
/// later node RPCs; clients never synthesize it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub client_id: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<u64>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        NodeInfo {
            client_id: 0,
            name: name.into(),
            watermark: None,
        }
    }
}

/// Whether a topic speaks the native protocol or the ROS-compat dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplType {
    #[default]
    Native,
    RosCompat,
}

/// Everything a subscriber needs to find and decode a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: String,
    pub type_name: String,
    /// Endpoints at which the publisher is reachable, one per advertised kind.
    pub topic_source: Vec<ChannelSource>,
    #[serde(default)]
    pub impl_type: ImplType,
}

/// Request-reply analogue of [`TopicInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service: String,
    pub type_name: String,
    pub service_source: Vec<ChannelSource>,
    /// Hash of the method signature; both ends must agree.
    pub signature_hash: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_info_valid_only_with_nonzero_id() {
        let mut info = ClientInfo::default();
        assert!(!info.is_valid());
        info.id = 7;
        assert!(info.is_valid());
    }
}
