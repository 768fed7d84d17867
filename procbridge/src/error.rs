use std::time::Duration;

use thiserror::Error;

use crate::supervisor::ExitInfo;
use crate::wire::MessageId;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    /// First output of the worker was not the alive token. The worker has
    /// already been signalled when this is returned.
    #[error("worker started but did not send '#proc-alive', received {received:?}")]
    Handshake { received: String },

    #[error("worker did not send '#proc-alive' within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("can't send message {id}: the worker process has not been started")]
    NotStarted { id: MessageId },

    #[error("worker process error: {0}")]
    Process(String),

    #[error("malformed frame: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no response to {id} within {after:?}")]
    Timeout { id: MessageId, after: Duration },

    #[error("worker exited ({0}) before responding")]
    ProcessExited(ExitInfo),

    #[error("bridge stopped before a response arrived")]
    Stopped,

    #[error("request id {0} is already pending")]
    DuplicateId(MessageId),

    #[error("worker responded with an error: {0}")]
    Remote(serde_json::Value),
}

/// Stable, machine-readable classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Spawn,
    Handshake,
    HandshakeTimeout,
    NotStarted,
    Process,
    Parse,
    InvalidRequest,
    Timeout,
    ProcessExited,
    Stopped,
    DuplicateId,
    Remote,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Handshake => "handshake",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::NotStarted => "not_started",
            Self::Process => "process",
            Self::Parse => "parse",
            Self::InvalidRequest => "invalid_request",
            Self::Timeout => "timeout",
            Self::ProcessExited => "process_exited",
            Self::Stopped => "stopped",
            Self::DuplicateId => "duplicate_id",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Spawn(_) => ErrorCode::Spawn,
            Self::Handshake { .. } => ErrorCode::Handshake,
            Self::HandshakeTimeout(_) => ErrorCode::HandshakeTimeout,
            Self::NotStarted { .. } => ErrorCode::NotStarted,
            Self::Process(_) => ErrorCode::Process,
            Self::Parse(_) => ErrorCode::Parse,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ProcessExited(_) => ErrorCode::ProcessExited,
            Self::Stopped => ErrorCode::Stopped,
            Self::DuplicateId(_) => ErrorCode::DuplicateId,
            Self::Remote(_) => ErrorCode::Remote,
        }
    }

    /// JSON form used when an error has to travel inside an envelope.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code().as_str(),
            "message": self.to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = BridgeError::NotStarted {
            id: MessageId::from("abc"),
        };
        assert_eq!(err.code(), ErrorCode::NotStarted);
        assert_eq!(err.code().as_str(), "not_started");
        assert_eq!(
            err.to_string(),
            "can't send message abc: the worker process has not been started"
        );
    }

    #[test]
    fn handshake_message_names_token() {
        let err = BridgeError::Handshake {
            received: "hello".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "worker started but did not send '#proc-alive', received \"hello\""
        );
    }

    #[test]
    fn wire_form_carries_code() {
        let err = BridgeError::InvalidRequest("query key cannot be empty".to_string());
        insta::assert_json_snapshot!(err.to_wire(), @r#"
        {
          "code": "invalid_request",
          "message": "invalid request: query key cannot be empty"
        }
        "#);
    }
}
