//! Notification records pushed by the master on the watcher channel.
//!
//! Wire layout after the frame header: one type byte, then a JSON payload
//! specific to the type.
//!
//! | Byte | Record       | Payload       |
//! |------|--------------|---------------|
//! | 1    | NEW_TOPIC    | `TopicInfo`   |
//! | 2    | TOPIC_GONE   | topic name    |
//! | 3    | NEW_SERVICE  | `ServiceInfo` |
//! | 4    | SERVICE_GONE | service name  |

use crate::info::{ServiceInfo, TopicInfo};
use crate::status::Status;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NewTopic(TopicInfo),
    TopicGone(String),
    NewService(ServiceInfo),
    ServiceGone(String),
}

impl Notification {
    pub fn type_byte(&self) -> u8 {
        match self {
            Notification::NewTopic(_) => 1,
            Notification::TopicGone(_) => 2,
            Notification::NewService(_) => 3,
            Notification::ServiceGone(_) => 4,
        }
    }

    /// The topic or service name this notification is keyed under.
    pub fn key(&self) -> &str {
        match self {
            Notification::NewTopic(info) => &info.topic,
            Notification::TopicGone(name) => name,
            Notification::NewService(info) => &info.service,
            Notification::ServiceGone(name) => name,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Status> {
        let payload = match self {
            Notification::NewTopic(info) => serde_json::to_vec(info),
            Notification::TopicGone(name) => serde_json::to_vec(name),
            Notification::NewService(info) => serde_json::to_vec(info),
            Notification::ServiceGone(name) => serde_json::to_vec(name),
        }
        .map_err(|e| {
            Status::new(
                crate::StatusCode::FailedToSerialize,
                format!("notification payload: {e}"),
            )
        })?;

        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(self.type_byte());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Notification, Status> {
        let (type_byte, payload) = bytes
            .split_first()
            .ok_or_else(|| Status::data_loss("empty notification record"))?;

        let parse_err = |e: serde_json::Error| {
            Status::new(
                crate::StatusCode::FailedToParse,
                format!("notification payload: {e}"),
            )
        };

        match type_byte {
            1 => Ok(Notification::NewTopic(
                serde_json::from_slice(payload).map_err(parse_err)?,
            )),
            2 => Ok(Notification::TopicGone(
                serde_json::from_slice(payload).map_err(parse_err)?,
            )),
            3 => Ok(Notification::NewService(
                serde_json::from_slice(payload).map_err(parse_err)?,
            )),
            4 => Ok(Notification::ServiceGone(
                serde_json::from_slice(payload).map_err(parse_err)?,
            )),
            other => Err(Status::data_loss(format!(
                "unknown notification type byte: {other}"
            ))),
        }
    }
}
