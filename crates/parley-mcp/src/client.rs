//! MCP client: talks to remote tool servers over HTTP
//!
//! Two transports are supported:
//! - `streamable-http`: every request is a POST; the reply is either a JSON
//!   body or an event stream that may interleave server requests before the
//!   response.
//! - `sse`: a long-lived GET event stream announces a POST endpoint; replies
//!   and server requests arrive on the stream and are matched by id.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::{ToolServerDescriptor, TransportMode};
use crate::elicitation::ElicitationHandle;
use crate::error::{CatalogError, CatalogResult};
use crate::protocol::{
    ElicitRequestParams, GetPromptResult, INTERNAL_ERROR, INVALID_PARAMS, InitializeResult,
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, McpPrompt, McpTool,
    PROTOCOL_VERSION, ServerCapabilities, ToolCallResult, methods,
};
use parley_core::sse::{SseEvent, SseParser};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const STREAM_ACCEPT: &str = "application/json, text/event-stream";

/// A live connection to one tool server
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Capabilities declared during the handshake
    fn capabilities(&self) -> ServerCapabilities;

    async fn list_tools(&self) -> CatalogResult<Vec<McpTool>>;

    async fn list_prompts(&self) -> CatalogResult<Vec<McpPrompt>>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<&Map<String, Value>>,
    ) -> CatalogResult<GetPromptResult>;

    async fn call_tool(&self, name: &str, arguments: Value) -> CatalogResult<ToolCallResult>;
}

/// Establishes connections for the catalog
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ToolServerDescriptor,
        elicitation: ElicitationHandle,
    ) -> CatalogResult<Arc<dyn ToolServer>>;
}

/// Connector for HTTP tool servers
pub struct HttpConnector {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            request_timeout,
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        descriptor: &ToolServerDescriptor,
        elicitation: ElicitationHandle,
    ) -> CatalogResult<Arc<dyn ToolServer>> {
        let client =
            HttpMcpClient::connect(self.http.clone(), descriptor, elicitation, self.request_timeout)
                .await?;
        Ok(client)
    }
}

type PendingMap = DashMap<u64, oneshot::Sender<JsonRpcMessage>>;

enum Link {
    Streamable {
        session_id: RwLock<Option<String>>,
    },
    Sse {
        post_url: Url,
        pending: Arc<PendingMap>,
        reader: JoinHandle<()>,
    },
}

/// MCP client over HTTP
pub struct HttpMcpClient {
    server_name: String,
    endpoint: Url,
    http: reqwest::Client,
    headers: HeaderMap,
    request_timeout: Duration,
    next_id: AtomicU64,
    capabilities: RwLock<ServerCapabilities>,
    elicitation: ElicitationHandle,
    link: Link,
}

impl HttpMcpClient {
    /// Connect and complete the initialize handshake
    pub async fn connect(
        http: reqwest::Client,
        descriptor: &ToolServerDescriptor,
        elicitation: ElicitationHandle,
        request_timeout: Duration,
    ) -> CatalogResult<Arc<Self>> {
        let server = descriptor.server_name.as_str();
        info!(
            "Connecting to MCP server: {} ({}, {:?})",
            server, descriptor.uri, descriptor.transport_mode
        );

        let endpoint = Url::parse(&descriptor.uri).map_err(|e| CatalogError::InvalidDescriptor {
            server: server.to_string(),
            message: format!("invalid uri '{}': {}", descriptor.uri, e),
        })?;
        let headers = build_headers(server, &descriptor.headers)?;

        let link = match descriptor.transport_mode {
            TransportMode::StreamableHttp => Link::Streamable {
                session_id: RwLock::new(None),
            },
            TransportMode::Sse => {
                open_sse(
                    &http,
                    &endpoint,
                    &headers,
                    server,
                    request_timeout,
                    elicitation.clone(),
                )
                .await?
            }
        };

        let client = Self {
            server_name: server.to_string(),
            endpoint,
            http,
            headers,
            request_timeout,
            next_id: AtomicU64::new(1),
            capabilities: RwLock::new(ServerCapabilities::default()),
            elicitation,
            link,
        };
        client.initialize().await?;
        Ok(Arc::new(client))
    }

    async fn initialize(&self) -> CatalogResult<()> {
        let result = self
            .request(
                methods::INITIALIZE,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"elicitation": {}},
                    "clientInfo": {
                        "name": "parley",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await?;

        let init: InitializeResult = self.decode(result)?;
        debug!("MCP initialize response from {}: {:?}", self.server_name, init);
        *self
            .capabilities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = init.capabilities;

        self.notify(methods::INITIALIZED).await?;
        info!(
            "MCP client connected to {} (protocol {})",
            self.server_name, init.protocol_version
        );
        Ok(())
    }

    /// Send a request bounded by the request timeout
    async fn request(&self, method: &str, params: Value) -> CatalogResult<Value> {
        tokio::time::timeout(self.request_timeout, self.send_request(method, params))
            .await
            .map_err(|_| CatalogError::Timeout {
                server: self.server_name.clone(),
                seconds: self.request_timeout.as_secs(),
            })?
    }

    async fn send_request(&self, method: &str, params: Value) -> CatalogResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        debug!("MCP -> {} {} (id {})", self.server_name, method, id);

        let message = match &self.link {
            Link::Streamable { .. } => self.exchange_streamable(&request, id).await?,
            Link::Sse {
                post_url, pending, ..
            } => self.exchange_sse(post_url, pending, &request, id).await?,
        };
        into_result(&self.server_name, message)
    }

    async fn notify(&self, method: &str) -> CatalogResult<()> {
        let note = JsonRpcRequest::notification(method, Value::Null);
        let url = match &self.link {
            Link::Streamable { .. } => &self.endpoint,
            Link::Sse { post_url, .. } => post_url,
        };
        let response = self.post(url, &note).await?;
        self.capture_session(&response);
        if !response.status().is_success() {
            return Err(CatalogError::transport(
                &self.server_name,
                format!("notification {} rejected: HTTP {}", method, response.status()),
            ));
        }
        Ok(())
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &Url, body: &T) -> CatalogResult<reqwest::Response> {
        let mut builder = self
            .http
            .post(url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, STREAM_ACCEPT)
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(body);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
            .send()
            .await
            .map_err(|e| CatalogError::transport(&self.server_name, e))
    }

    fn session_id(&self) -> Option<String> {
        match &self.link {
            Link::Streamable { session_id } => session_id
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            Link::Sse { .. } => None,
        }
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Link::Streamable { session_id } = &self.link
            && let Some(value) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
        {
            let mut slot = session_id
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.as_deref() != Some(value) {
                debug!("MCP session for {}: {}", self.server_name, value);
                *slot = Some(value.to_string());
            }
        }
    }

    async fn exchange_streamable(
        &self,
        request: &JsonRpcRequest,
        id: u64,
    ) -> CatalogResult<JsonRpcMessage> {
        let response = self.post(&self.endpoint, request).await?;
        self.capture_session(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::transport(
                &self.server_name,
                format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            let mut bytes = Box::pin(response.bytes_stream());
            let mut parser = SseParser::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| CatalogError::transport(&self.server_name, e))?;
                for event in parser.push(&chunk) {
                    if let Some(message) = self.handle_stream_event(&event, id).await? {
                        return Ok(message);
                    }
                }
            }
            if let Some(event) = parser.finish()
                && let Some(message) = self.handle_stream_event(&event, id).await?
            {
                return Ok(message);
            }
            return Err(CatalogError::transport(
                &self.server_name,
                "event stream ended without a response",
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CatalogError::transport(&self.server_name, e))?;
        let value: Value = serde_json::from_str(&body).map_err(|e| {
            CatalogError::protocol(
                &self.server_name,
                format!(
                    "invalid JSON ({}): {}",
                    e,
                    body.chars().take(100).collect::<String>()
                ),
            )
        })?;
        let candidates = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        candidates
            .into_iter()
            .filter_map(|v| serde_json::from_value::<JsonRpcMessage>(v).ok())
            .find(|m| m.response_id() == Some(id))
            .ok_or_else(|| CatalogError::protocol(&self.server_name, "no response for request"))
    }

    async fn handle_stream_event(
        &self,
        event: &SseEvent,
        id: u64,
    ) -> CatalogResult<Option<JsonRpcMessage>> {
        if event.data.trim().is_empty() {
            return Ok(None);
        }
        let message: JsonRpcMessage = match serde_json::from_str(&event.data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping malformed event from {}: {}", self.server_name, e);
                return Ok(None);
            }
        };

        if message.response_id() == Some(id) {
            return Ok(Some(message));
        }
        if message.is_request() {
            let reply = answer_server_request(&self.elicitation, &message).await;
            let response = self.post(&self.endpoint, &reply).await?;
            if !response.status().is_success() {
                warn!(
                    "{} rejected our reply to {:?}: HTTP {}",
                    self.server_name,
                    message.method,
                    response.status()
                );
            }
        } else {
            debug!("MCP notification from {}: {:?}", self.server_name, message.method);
        }
        Ok(None)
    }

    async fn exchange_sse(
        &self,
        post_url: &Url,
        pending: &PendingMap,
        request: &JsonRpcRequest,
        id: u64,
    ) -> CatalogResult<JsonRpcMessage> {
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        let _slot = PendingSlot { pending, id };

        let response = self.post(post_url, request).await?;
        if !response.status().is_success() {
            return Err(CatalogError::transport(
                &self.server_name,
                format!("HTTP {}", response.status()),
            ));
        }

        rx.await
            .map_err(|_| CatalogError::transport(&self.server_name, "event stream closed"))
    }

    fn decode<T: DeserializeOwned>(&self, value: Value) -> CatalogResult<T> {
        serde_json::from_value(value).map_err(|e| CatalogError::protocol(&self.server_name, e.to_string()))
    }

    async fn list_paginated<T: DeserializeOwned>(&self, method: &str, field: &str) -> CatalogResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let mut result = self.request(method, params).await?;
            let page: Vec<T> = self.decode(result.get_mut(field).map(Value::take).unwrap_or(json!([])))?;
            items.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(String::from);
            if cursor.is_none() {
                return Ok(items);
            }
        }
    }
}

#[async_trait]
impl ToolServer for HttpMcpClient {
    fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn list_tools(&self) -> CatalogResult<Vec<McpTool>> {
        let tools: Vec<McpTool> = self.list_paginated(methods::TOOLS_LIST, "tools").await?;
        info!("Discovered {} tools from MCP server {}", tools.len(), self.server_name);
        Ok(tools)
    }

    async fn list_prompts(&self) -> CatalogResult<Vec<McpPrompt>> {
        let prompts: Vec<McpPrompt> = self.list_paginated(methods::PROMPTS_LIST, "prompts").await?;
        info!("Discovered {} prompts from MCP server {}", prompts.len(), self.server_name);
        Ok(prompts)
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<&Map<String, Value>>,
    ) -> CatalogResult<GetPromptResult> {
        let arguments = arguments.cloned().unwrap_or_default();
        let result = self
            .request(methods::PROMPTS_GET, json!({"name": name, "arguments": arguments}))
            .await?;
        self.decode(result)
    }

    /// Not bounded by the request timeout: a call may wait on an elicitation.
    async fn call_tool(&self, name: &str, arguments: Value) -> CatalogResult<ToolCallResult> {
        debug!("Calling MCP tool {} on {}", name, self.server_name);
        let result = self
            .send_request(methods::TOOLS_CALL, json!({"name": name, "arguments": arguments}))
            .await?;
        self.decode(result)
    }
}

impl Drop for HttpMcpClient {
    fn drop(&mut self) {
        match &self.link {
            Link::Sse { reader, .. } => reader.abort(),
            Link::Streamable { .. } => {
                // Best-effort session close; can't await in drop
                let Some(session) = self.session_id() else {
                    return;
                };
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let request = self
                    .http
                    .delete(self.endpoint.clone())
                    .headers(self.headers.clone())
                    .header(SESSION_HEADER, session);
                runtime.spawn(async move {
                    let _ = request.send().await;
                });
            }
        }
    }
}

struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Posts our replies to server-initiated requests on the SSE transport
#[derive(Clone)]
struct Responder {
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    server: String,
}

impl Responder {
    async fn post(&self, reply: &JsonRpcResponse) {
        let sent = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(reply)
            .send()
            .await;
        match sent {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => warn!("{} rejected our reply: HTTP {}", self.server, r.status()),
            Err(e) => warn!("Failed to reply to {}: {}", self.server, e),
        }
    }
}

async fn open_sse(
    http: &reqwest::Client,
    endpoint: &Url,
    headers: &HeaderMap,
    server: &str,
    timeout: Duration,
    elicitation: ElicitationHandle,
) -> CatalogResult<Link> {
    let response = http
        .get(endpoint.clone())
        .headers(headers.clone())
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| CatalogError::transport(server, e))?;
    if !response.status().is_success() {
        return Err(CatalogError::transport(
            server,
            format!("HTTP {} opening event stream", response.status()),
        ));
    }

    let mut bytes = Box::pin(response.bytes_stream());
    let mut parser = SseParser::new();
    let mut backlog = Vec::new();

    let post_url = tokio::time::timeout(timeout, async {
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| CatalogError::transport(server, e))?;
            let mut events = parser.push(&chunk).into_iter();
            while let Some(event) = events.next() {
                if event.name() == "endpoint" {
                    backlog.extend(events);
                    return endpoint.join(event.data.trim()).map_err(|e| {
                        CatalogError::protocol(server, format!("bad endpoint event: {e}"))
                    });
                }
            }
        }
        Err(CatalogError::transport(
            server,
            "event stream closed before announcing an endpoint",
        ))
    })
    .await
    .map_err(|_| CatalogError::Timeout {
        server: server.to_string(),
        seconds: timeout.as_secs(),
    })??;

    debug!("MCP server {} posts to {}", server, post_url);
    let pending: Arc<PendingMap> = Arc::new(DashMap::new());
    let responder = Responder {
        http: http.clone(),
        url: post_url.clone(),
        headers: headers.clone(),
        server: server.to_string(),
    };
    let reader = tokio::spawn(read_sse(
        bytes,
        parser,
        backlog,
        Arc::clone(&pending),
        responder,
        elicitation,
    ));

    Ok(Link::Sse {
        post_url,
        pending,
        reader,
    })
}

async fn read_sse<S, B>(
    mut bytes: S,
    mut parser: SseParser,
    backlog: Vec<SseEvent>,
    pending: Arc<PendingMap>,
    responder: Responder,
    elicitation: ElicitationHandle,
) where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    for event in backlog {
        dispatch_sse_event(&event, &pending, &responder, &elicitation);
    }

    while let Some(chunk) = bytes.next().await {
        match chunk {
            Ok(chunk) => {
                for event in parser.push(chunk.as_ref()) {
                    dispatch_sse_event(&event, &pending, &responder, &elicitation);
                }
            }
            Err(e) => {
                warn!("Event stream from {} failed: {}", responder.server, e);
                break;
            }
        }
    }

    // Wake every waiter with a closed-stream error
    pending.clear();
    debug!("Event stream from {} closed", responder.server);
}

fn dispatch_sse_event(
    event: &SseEvent,
    pending: &PendingMap,
    responder: &Responder,
    elicitation: &ElicitationHandle,
) {
    if event.name() != "message" || event.data.trim().is_empty() {
        return;
    }
    let message: JsonRpcMessage = match serde_json::from_str(&event.data) {
        Ok(message) => message,
        Err(e) => {
            warn!("Skipping malformed event from {}: {}", responder.server, e);
            return;
        }
    };

    if let Some(id) = message.response_id() {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(message);
        } else {
            debug!("Late response {} from {}", id, responder.server);
        }
    } else if message.is_request() {
        let responder = responder.clone();
        let elicitation = elicitation.clone();
        tokio::spawn(async move {
            let reply = answer_server_request(&elicitation, &message).await;
            responder.post(&reply).await;
        });
    } else {
        debug!("MCP notification from {}: {:?}", responder.server, message.method);
    }
}

/// Answer a request a server sent to us
pub(crate) async fn answer_server_request(
    elicitation: &ElicitationHandle,
    message: &JsonRpcMessage,
) -> JsonRpcResponse {
    let id = message.id.clone().unwrap_or(Value::Null);
    match message.method.as_deref() {
        Some(methods::PING) => JsonRpcResponse::success(id, json!({})),
        Some(methods::ELICITATION_CREATE) => {
            let params: ElicitRequestParams = match serde_json::from_value(message.params.clone()) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {e}"));
                }
            };
            let result = elicitation.elicit(params).await;
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
            }
        }
        Some(other) => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        None => JsonRpcResponse::error(id, METHOD_NOT_FOUND, "Missing method".to_string()),
    }
}

fn into_result(server: &str, message: JsonRpcMessage) -> CatalogResult<Value> {
    if let Some(error) = message.error {
        return Err(CatalogError::Rpc {
            server: server.to_string(),
            code: error.code,
            message: error.message,
        });
    }
    Ok(message.result.unwrap_or(Value::Null))
}

fn build_headers(server: &str, headers: &BTreeMap<String, String>) -> CatalogResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let invalid = |message: String| CatalogError::InvalidDescriptor {
            server: server.to_string(),
            message,
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| invalid(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("header value for '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}
