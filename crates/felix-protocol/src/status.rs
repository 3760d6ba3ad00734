//! The cross-component status type.
//!
//! Every asynchronous completion in the runtime resolves with a [`Status`].
//! `code` is machine-readable; `message` is for logs and humans.

use serde::{Deserialize, Serialize};

/// Machine-readable outcome classification.
///
/// The first block mirrors the usual RPC vocabulary; the second block is
/// transport-level detail surfaced by the channel layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Unavailable,
    DeadlineExceeded,
    Internal,
    DataLoss,
    Aborted,
    TimedOut,

    // Transport-level codes.
    SocketClosed,
    CorruptedHeader,
    NotEnoughBuffer,
    ReadingWhileReceiving,
    WritingWhileSending,
    FailedToSerialize,
    FailedToParse,
}

/// Outcome of an operation: a code plus a human-readable message.
///
/// `Status` is cheap to clone and is passed by value through completion
/// callbacks.  Use [`Status::ok`] for success; the message is empty then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Status::new(StatusCode::Ok, "")
    }

    pub fn cancelled() -> Self {
        Status::new(StatusCode::Cancelled, "operation cancelled")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Status::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Status::new(StatusCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Status::new(StatusCode::AlreadyExists, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Status::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Internal, message)
    }

    pub fn data_loss(message: impl Into<String>) -> Self {
        Status::new(StatusCode::DataLoss, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Aborted, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Status::new(StatusCode::TimedOut, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Keep the code, prepend context to the message.
    pub fn with_context(self, context: &str) -> Self {
        Status {
            code: self.code,
            message: if self.message.is_empty() {
                context.to_owned()
            } else {
                format!("{}: {}", context, self.message)
            },
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Status::timed_out(e.to_string()),
            std::io::ErrorKind::InvalidInput => Status::invalid_argument(e.to_string()),
            _ => Status::unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_has_empty_message() {
        let s = Status::ok();
        assert!(s.is_ok());
        assert!(s.message.is_empty());
    }

    #[test]
    fn with_context_prepends() {
        let s = Status::unavailable("connection refused").with_context("master");
        assert_eq!(s.code, StatusCode::Unavailable);
        assert_eq!(s.message, "master: connection refused");
    }

    #[test]
    fn io_error_maps_to_unavailable() {
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let s: Status = e.into();
        assert_eq!(s.code, StatusCode::Unavailable);
    }
}
