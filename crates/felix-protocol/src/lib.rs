// felix-protocol: Data model shared by the felix client runtime and master.
//
// Pure types and wire encodings only — no I/O.  Everything the client and
// the master exchange is defined here: registration infos, channel
// descriptors, master RPC request/response pairs, notification records and
// the heart-beat pulse.

mod channel_def;
mod heartbeat;
mod info;
mod notify;
mod rpc;
mod status;

pub use channel_def::{ChannelKind, ChannelKindMask, ChannelSource, KIND_PREFERENCE};
pub use heartbeat::{HeartBeat, HEART_BEAT_WIRE_LEN};
pub use info::{ClientInfo, ImplType, NodeInfo, ServiceInfo, TopicInfo};
pub use notify::Notification;
pub use rpc::*;
pub use status::{Status, StatusCode};
