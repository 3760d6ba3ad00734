//! Master RPC request/response pairs.
//!
//! One pair per master operation.  On the framed-TCP transport every
//! request is `<Header><method tag (u32 LE)><RpcRequestEnvelope JSON>`;
//! responses come back as `<Header><RpcResponseEnvelope JSON>` and are
//! correlated by `id`, so they may return out of submission order.

use crate::info::{ClientInfo, NodeInfo, ServiceInfo, TopicInfo};
use crate::status::Status;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Method tags (framed-TCP transport)
// ---------------------------------------------------------------------------

/// Stable 4-byte tags prefixing each request on the direct-socket transport.
pub mod method_tag {
    pub const REGISTER_CLIENT: u32 = 1;
    pub const LIST_CLIENTS: u32 = 2;
    pub const REGISTER_NODE: u32 = 3;
    pub const UNREGISTER_NODE: u32 = 4;
    pub const LIST_NODES: u32 = 5;
    pub const PUBLISH_TOPIC: u32 = 6;
    pub const UNPUBLISH_TOPIC: u32 = 7;
    pub const SUBSCRIBE_TOPIC: u32 = 8;
    pub const UNSUBSCRIBE_TOPIC: u32 = 9;
    pub const LIST_TOPICS: u32 = 10;
    pub const REGISTER_SERVICE_CLIENT: u32 = 11;
    pub const UNREGISTER_SERVICE_CLIENT: u32 = 12;
    pub const REGISTER_SERVICE_SERVER: u32 = 13;
    pub const UNREGISTER_SERVICE_SERVER: u32 = 14;
    pub const LIST_SERVICES: u32 = 15;
    pub const UNREGISTER_CLIENT: u32 = 16;
}

// ---------------------------------------------------------------------------
// Client lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterClientRequest {
    pub client_info: ClientInfo,
}

/// Carries the id the master assigned; the client stores it into its
/// `ClientInfo` which becomes valid from that point on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterClientResponse {
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnregisterClientRequest {
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnregisterClientResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListClientsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListClientsResponse {
    pub client_infos: Vec<ClientInfo>,
}

// ---------------------------------------------------------------------------
// Node lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_info: NodeInfo,
}

/// Echoes the node info with master-assigned fields (watermark) filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterNodeRequest {
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnregisterNodeResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListNodesRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub node_infos: Vec<NodeInfo>,
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTopicRequest {
    pub node_info: NodeInfo,
    pub topic_info: TopicInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishTopicResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpublishTopicRequest {
    pub node_info: NodeInfo,
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnpublishTopicResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeTopicRequest {
    pub node_info: NodeInfo,
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeTopicResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeTopicRequest {
    pub node_info: NodeInfo,
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeTopicResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListTopicsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListTopicsResponse {
    pub topic_infos: Vec<TopicInfo>,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterServiceClientRequest {
    pub node_info: NodeInfo,
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterServiceClientResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterServiceClientRequest {
    pub node_info: NodeInfo,
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnregisterServiceClientResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterServiceServerRequest {
    pub node_info: NodeInfo,
    pub service_info: ServiceInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterServiceServerResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterServiceServerRequest {
    pub node_info: NodeInfo,
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnregisterServiceServerResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListServicesRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListServicesResponse {
    pub service_infos: Vec<ServiceInfo>,
}

// ---------------------------------------------------------------------------
// Top-level discriminated unions
// ---------------------------------------------------------------------------

/// All master-bound requests.  Serializes using the `kind` field as a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum MasterRpcRequest {
    RegisterClient(RegisterClientRequest),
    UnregisterClient(UnregisterClientRequest),
    ListClients(ListClientsRequest),
    RegisterNode(RegisterNodeRequest),
    UnregisterNode(UnregisterNodeRequest),
    ListNodes(ListNodesRequest),
    PublishTopic(PublishTopicRequest),
    UnpublishTopic(UnpublishTopicRequest),
    SubscribeTopic(SubscribeTopicRequest),
    UnsubscribeTopic(UnsubscribeTopicRequest),
    ListTopics(ListTopicsRequest),
    RegisterServiceClient(RegisterServiceClientRequest),
    UnregisterServiceClient(UnregisterServiceClientRequest),
    RegisterServiceServer(RegisterServiceServerRequest),
    UnregisterServiceServer(UnregisterServiceServerRequest),
    ListServices(ListServicesRequest),
}

impl MasterRpcRequest {
    pub fn method_tag(&self) -> u32 {
        use method_tag as tag;
        match self {
            MasterRpcRequest::RegisterClient(_) => tag::REGISTER_CLIENT,
            MasterRpcRequest::UnregisterClient(_) => tag::UNREGISTER_CLIENT,
            MasterRpcRequest::ListClients(_) => tag::LIST_CLIENTS,
            MasterRpcRequest::RegisterNode(_) => tag::REGISTER_NODE,
            MasterRpcRequest::UnregisterNode(_) => tag::UNREGISTER_NODE,
            MasterRpcRequest::ListNodes(_) => tag::LIST_NODES,
            MasterRpcRequest::PublishTopic(_) => tag::PUBLISH_TOPIC,
            MasterRpcRequest::UnpublishTopic(_) => tag::UNPUBLISH_TOPIC,
            MasterRpcRequest::SubscribeTopic(_) => tag::SUBSCRIBE_TOPIC,
            MasterRpcRequest::UnsubscribeTopic(_) => tag::UNSUBSCRIBE_TOPIC,
            MasterRpcRequest::ListTopics(_) => tag::LIST_TOPICS,
            MasterRpcRequest::RegisterServiceClient(_) => tag::REGISTER_SERVICE_CLIENT,
            MasterRpcRequest::UnregisterServiceClient(_) => tag::UNREGISTER_SERVICE_CLIENT,
            MasterRpcRequest::RegisterServiceServer(_) => tag::REGISTER_SERVICE_SERVER,
            MasterRpcRequest::UnregisterServiceServer(_) => tag::UNREGISTER_SERVICE_SERVER,
            MasterRpcRequest::ListServices(_) => tag::LIST_SERVICES,
        }
    }

    /// Requests that modify master state must keep per-caller submission
    /// order; pure listings may be reordered freely.
    pub fn mutates_state(&self) -> bool {
        !matches!(
            self,
            MasterRpcRequest::ListClients(_)
                | MasterRpcRequest::ListNodes(_)
                | MasterRpcRequest::ListTopics(_)
                | MasterRpcRequest::ListServices(_)
        )
    }
}

/// All master responses, same tagging scheme as the requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum MasterRpcResponse {
    RegisterClient(RegisterClientResponse),
    UnregisterClient(UnregisterClientResponse),
    ListClients(ListClientsResponse),
    RegisterNode(RegisterNodeResponse),
    UnregisterNode(UnregisterNodeResponse),
    ListNodes(ListNodesResponse),
    PublishTopic(PublishTopicResponse),
    UnpublishTopic(UnpublishTopicResponse),
    SubscribeTopic(SubscribeTopicResponse),
    UnsubscribeTopic(UnsubscribeTopicResponse),
    ListTopics(ListTopicsResponse),
    RegisterServiceClient(RegisterServiceClientResponse),
    UnregisterServiceClient(UnregisterServiceClientResponse),
    RegisterServiceServer(RegisterServiceServerResponse),
    UnregisterServiceServer(UnregisterServiceServerResponse),
    ListServices(ListServicesResponse),
}

// ---------------------------------------------------------------------------
// Envelopes (framed-TCP transport)
// ---------------------------------------------------------------------------

/// Request wrapper carrying the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequestEnvelope {
    pub id: u64,
    pub request: MasterRpcRequest,
}

/// Response wrapper.  `response` is absent when `status` is not OK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponseEnvelope {
    pub id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<MasterRpcResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_union_round_trips_with_kind_tag() {
        let request = MasterRpcRequest::SubscribeTopic(SubscribeTopicRequest {
            node_info: NodeInfo::new("listener"),
            topic: "chatter".into(),
        });
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"kind\":\"subscribe_topic\""));
        let back: MasterRpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn listings_do_not_mutate_state() {
        assert!(!MasterRpcRequest::ListTopics(ListTopicsRequest {}).mutates_state());
        assert!(
            MasterRpcRequest::RegisterClient(RegisterClientRequest {
                client_info: ClientInfo::default(),
            })
            .mutates_state()
        );
    }

    #[test]
    fn error_envelope_omits_response() {
        let envelope = RpcResponseEnvelope {
            id: 3,
            status: Status::not_found("no such topic"),
            response: None,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("\"response\""));
    }
}
