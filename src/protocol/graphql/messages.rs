//! `graphql-ws` message envelopes.
//!
//! Every frame is a JSON object tagged by `type`. Legacy names from the
//! older transport (`start`, `complete` from the client, `connection_close`)
//! are accepted as aliases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sub-protocol token negotiated in `Sec-WebSocket-Protocol`.
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    #[serde(alias = "start")]
    Subscribe { id: String, payload: OperationPayload },
    #[serde(alias = "complete")]
    Stop { id: String },
    #[serde(alias = "connection_close")]
    ConnectionTerminate,
}

/// Messages the gateway sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    ConnectionError {
        payload: Value,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: Vec<ErrorPayload>,
    },
    Complete {
        id: String,
    },
}

impl ServerMessage {
    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            payload: vec![ErrorPayload {
                message: message.into(),
            }],
        }
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            payload: serde_json::json!({ "message": message.into() }),
        }
    }
}

/// Body of a `subscribe` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}
