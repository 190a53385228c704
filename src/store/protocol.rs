//! Relay Protocol Messages
//!
//! Wire format between `RemoteStore` clients and the `RelayServer`.
//! All messages are JSON text frames, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{StoreError, StorePath};

// =============================================================================
// CLIENT -> RELAY MESSAGES
// =============================================================================

/// One client request. `id` is chosen by the client and echoed in the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Correlation id. For `subscribe` it is also the subscription id.
    pub id: u64,
    /// The operation.
    #[serde(flatten)]
    pub op: RelayOp,
}

/// Operations a client can request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayOp {
    /// Authenticate the connection. Must be the first request.
    Auth {
        /// Identity token (JWT).
        token: String,
    },
    /// Replace a value.
    Write {
        /// Target path.
        path: StorePath,
        /// New value.
        value: Value,
    },
    /// Non-destructive field update.
    Merge {
        /// Target path.
        path: StorePath,
        /// Partial object.
        value: Value,
    },
    /// Read a value.
    Read {
        /// Target path.
        path: StorePath,
    },
    /// Remove a value.
    Remove {
        /// Target path.
        path: StorePath,
    },
    /// Start full-value deliveries for a path.
    Subscribe {
        /// Watched path.
        path: StorePath,
    },
    /// Stop deliveries for a subscription.
    Unsubscribe {
        /// Request id of the original `subscribe`.
        subscription: u64,
    },
    /// Ask for the relay's clock.
    ServerTime,
    /// Remove a path when this connection closes.
    OnDisconnectRemove {
        /// Path to remove.
        path: StorePath,
    },
}

impl RelayOp {
    /// Path written by this op, if it mutates the store.
    pub fn written_path(&self) -> Option<&StorePath> {
        match self {
            RelayOp::Write { path, .. }
            | RelayOp::Merge { path, .. }
            | RelayOp::Remove { path }
            | RelayOp::OnDisconnectRemove { path } => Some(path),
            _ => None,
        }
    }
}

// =============================================================================
// RELAY -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Authentication accepted.
    Authenticated {
        /// Request id.
        id: u64,
        /// Identity from the token's subject.
        identity: String,
    },
    /// Operation succeeded with no payload.
    Ok {
        /// Request id.
        id: u64,
    },
    /// Result of `read`.
    Value {
        /// Request id.
        id: u64,
        /// Value at the path.
        value: Option<Value>,
    },
    /// Result of `server_time`.
    ServerTime {
        /// Request id.
        id: u64,
        /// Relay clock (ms since epoch).
        server_time: i64,
    },
    /// Result of `on_disconnect_remove`.
    Registered {
        /// Request id.
        id: u64,
    },
    /// Pushed delivery for a subscription.
    Snapshot {
        /// Subscription id (the `subscribe` request id).
        subscription: u64,
        /// Full value at the subscribed path.
        value: Option<Value>,
    },
    /// Request failed.
    Error {
        /// Request id, when the failure belongs to one.
        id: Option<u64>,
        /// Error category.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// Relay is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Error categories on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed message.
    InvalidMessage,
    /// Token rejected, or request before auth.
    AuthFailed,
    /// Write outside the caller's own records.
    PermissionDenied,
    /// Bad path.
    InvalidPath,
    /// Bad value for the operation.
    InvalidValue,
    /// Unknown subscription id.
    UnknownSubscription,
    /// Store-side failure.
    Unavailable,
}

impl ErrorCode {
    /// Wire code for a store error.
    pub fn from_store_error(err: &StoreError) -> Self {
        match err {
            StoreError::InvalidPath(_) => ErrorCode::InvalidPath,
            StoreError::InvalidValue(_) => ErrorCode::InvalidValue,
            StoreError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            StoreError::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            StoreError::Protocol(_) => ErrorCode::InvalidMessage,
            StoreError::Unavailable(_) | StoreError::Timeout | StoreError::Disconnected => {
                ErrorCode::Unavailable
            }
        }
    }

    /// Client-side store error for a wire error.
    pub fn into_store_error(self, message: String) -> StoreError {
        match self {
            ErrorCode::InvalidPath => StoreError::InvalidPath(message),
            ErrorCode::InvalidValue => StoreError::InvalidValue(message),
            ErrorCode::PermissionDenied | ErrorCode::AuthFailed => StoreError::PermissionDenied(message),
            ErrorCode::UnknownSubscription => StoreError::Protocol(message),
            ErrorCode::InvalidMessage => StoreError::Protocol(message),
            ErrorCode::Unavailable => StoreError::Unavailable(message),
        }
    }
}

// =============================================================================
// SERIALIZATION
// =============================================================================

impl RelayRequest {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl RelayMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Request id this message answers, if any.
    pub fn reply_id(&self) -> Option<u64> {
        match self {
            RelayMessage::Authenticated { id, .. }
            | RelayMessage::Ok { id }
            | RelayMessage::Value { id, .. }
            | RelayMessage::ServerTime { id, .. }
            | RelayMessage::Registered { id } => Some(*id),
            RelayMessage::Error { id, .. } => *id,
            RelayMessage::Snapshot { .. } | RelayMessage::Shutdown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = RelayRequest {
            id: 7,
            op: RelayOp::Merge {
                path: StorePath::parse("online_players/p1").unwrap(),
                value: json!({"isMoving": true}),
            },
        };
        let wire: Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({"id": 7, "type": "merge", "path": "online_players/p1", "value": {"isMoving": true}})
        );
    }

    #[test]
    fn test_parse_unit_op() {
        let request = RelayRequest::from_json(r#"{"id": 3, "type": "server_time"}"#).unwrap();
        assert_eq!(request.id, 3);
        assert!(matches!(request.op, RelayOp::ServerTime));
    }

    #[test]
    fn test_bad_path_rejected_at_parse() {
        let result = RelayRequest::from_json(r#"{"id": 1, "type": "read", "path": "a/.b"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_has_no_reply_id() {
        let msg = RelayMessage::Snapshot { subscription: 4, value: None };
        let parsed = RelayMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed.reply_id(), None);
        assert!(matches!(parsed, RelayMessage::Snapshot { subscription: 4, value: None }));
    }

    #[test]
    fn test_error_codes() {
        let msg = RelayMessage::Error {
            id: Some(9),
            code: ErrorCode::PermissionDenied,
            message: "not your record".into(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("permission_denied"));
        assert_eq!(RelayMessage::from_json(&json).unwrap().reply_id(), Some(9));
    }

    #[test]
    fn test_written_paths() {
        let path = StorePath::parse("users/p1").unwrap();
        assert!(RelayOp::Remove { path: path.clone() }.written_path().is_some());
        assert!(RelayOp::Read { path }.written_path().is_none());
    }
}
