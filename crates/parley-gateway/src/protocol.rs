//! Gateway WebSocket protocol: JSON frames between clients and the hub

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → Gateway request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Optional request ID for correlating responses
    #[serde(default)]
    pub id: Option<String>,
}

/// Gateway → Client response (to a specific request)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Echoed from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: i32,
    pub message: String,
}

/// Gateway → Client event (no request ID)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub data: Value,
}

/// `message.cancel` params
#[derive(Debug, Clone, Deserialize)]
pub struct CancelParams {
    /// Request id of the stream to cancel
    pub id: String,
}

/// `group.join` / `group.leave` params
#[derive(Debug, Clone, Deserialize)]
pub struct GroupParams {
    pub group: String,
}

// ── Well-known methods ──

/// Methods the client can call
pub mod methods {
    pub const MESSAGE_STREAM: &str = "message.stream";
    pub const MESSAGE_CANCEL: &str = "message.cancel";
    pub const GROUP_JOIN: &str = "group.join";
    pub const GROUP_LEAVE: &str = "group.leave";
}

/// Events the hub pushes
pub mod events {
    pub const MESSAGE_FRAGMENT: &str = "message.fragment";
    pub const MESSAGE_END: &str = "message.end";
    pub const GROUP_MESSAGE: &str = "group.message";
}

// ── Error codes ──

pub const ERR_INVALID_METHOD: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;

impl GatewayResponse {
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(GatewayError {
                code,
                message: message.into(),
            }),
        }
    }
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
