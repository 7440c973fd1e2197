//! MCP JSON-RPC protocol types
//!
//! Client-side view of the Model Context Protocol over JSON-RPC 2.0: the
//! requests we send, the messages a server may send back (responses, its own
//! requests, notifications) and the payloads of the methods the catalog uses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Protocol revision advertised during `initialize`
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const ELICITATION_CREATE: &str = "elicitation/create";
}

/// JSON-RPC 2.0 request or notification (no id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

/// JSON-RPC error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message a server can send us
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// A reply to one of our requests
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// A request the server expects us to answer
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.as_ref().is_some_and(|id| !id.is_null())
    }

    /// Numeric id of a response (we only ever send numeric ids)
    pub fn response_id(&self) -> Option<u64> {
        if !self.is_response() {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Capabilities a server declares in its `initialize` result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

/// MCP server info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// MCP initialize result
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<ServerInfo>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// MCP tool definition (from `tools/list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

/// MCP prompt definition (from `prompts/list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// `prompts/get` result
#[derive(Debug, Clone, Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: ContentBlock,
}

/// Content block; only text is interpreted, other kinds are carried opaquely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// `tools/call` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl ToolCallResult {
    /// Text handed back to the agent
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
        match &self.structured_content {
            Some(value) => value.to_string(),
            None => String::new(),
        }
    }
}

/// `elicitation/create` params
#[derive(Debug, Clone, Deserialize)]
pub struct ElicitRequestParams {
    pub message: String,
    #[serde(rename = "requestedSchema", default)]
    pub requested_schema: RequestedSchema,
}

/// Flat object schema of an elicitation request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestedSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitAction {
    Accept,
    Decline,
    Cancel,
}

/// Answer to an elicitation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitResult {
    pub action: ElicitAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Map<String, Value>>,
}

impl ElicitResult {
    pub fn cancel() -> Self {
        Self {
            action: ElicitAction::Cancel,
            content: None,
        }
    }
}

// Standard JSON-RPC error codes
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcRequest::notification(methods::INITIALIZED, Value::Null);
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
        assert_eq!(json["method"], "notifications/initialized");
    }

    #[test]
    fn test_message_classification() {
        let response: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "result": {}})).unwrap();
        assert!(response.is_response());
        assert_eq!(response.response_id(), Some(7));

        let request: JsonRpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "id": "srv-1", "method": "elicitation/create", "params": {}}),
        )
        .unwrap();
        assert!(request.is_request());
        assert_eq!(request.response_id(), None);

        let note: JsonRpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
        )
        .unwrap();
        assert!(!note.is_request());
        assert!(!note.is_response());
    }

    #[test]
    fn test_tool_without_schema_gets_empty_object() {
        let tool: McpTool = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_empty());
    }

    #[test]
    fn test_initialize_result_without_prompts() {
        let init: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "weather", "version": "1.0"}
        }))
        .unwrap();
        assert!(init.capabilities.tools.is_some());
        assert!(init.capabilities.prompts.is_none());
        assert_eq!(init.server_info.unwrap().name, "weather");
    }

    #[test]
    fn test_tool_call_result_text() {
        let result: ToolCallResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "line two"}
            ]
        }))
        .unwrap();
        assert_eq!(result.text(), "line one\nline two");
        assert!(!result.is_error);

        let structured: ToolCallResult =
            serde_json::from_value(json!({"content": [], "structuredContent": {"temp": 21}}))
                .unwrap();
        assert_eq!(structured.text(), r#"{"temp":21}"#);
    }

    #[test]
    fn test_elicit_result_wire_shape() {
        let cancel = serde_json::to_value(ElicitResult::cancel()).unwrap();
        assert_eq!(cancel, json!({"action": "cancel"}));

        let accept: ElicitResult =
            serde_json::from_value(json!({"action": "accept", "content": {"name": "x"}})).unwrap();
        assert_eq!(accept.action, ElicitAction::Accept);
        assert_eq!(accept.content.unwrap()["name"], "x");
    }

    #[test]
    fn test_error_response_serialization() {
        let response = JsonRpcResponse::error(json!(3), METHOD_NOT_FOUND, "nope".to_string());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }
}
