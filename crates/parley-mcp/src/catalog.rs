//! Tool/prompt catalog
//!
//! Resolves tool-server descriptors into live clients and their tool and
//! prompt lists. All three are cached per server URI with a sliding idle
//! expiry; concurrent misses on the same key share one load. Fan-out queries
//! run across servers concurrently and report each server's failure
//! separately instead of failing the whole batch.

use futures_util::future::join_all;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{Connector, ToolServer};
use crate::elicitation::{ElicitationBroker, ElicitationHandle};
use crate::error::{CatalogError, CatalogResult};
use crate::protocol::{McpPrompt, McpTool, ToolCallResult};
use parley_core::{ChatMessage, ChatRole, ToolDefinition};

/// How to reach a tool server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    Sse,
    #[default]
    #[serde(alias = "streamableHttp")]
    StreamableHttp,
}

/// A prompt to use in place of the raw user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSelection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// A tool server as supplied by the caller of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerDescriptor {
    pub server_name: String,
    pub uri: String,
    #[serde(default)]
    pub transport_mode: TransportMode,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tool_allow_list: Vec<String>,
    #[serde(default)]
    pub prompt_allow_list: Vec<PromptSelection>,
}

impl ToolServerDescriptor {
    pub fn new(server_name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            uri: uri.into(),
            transport_mode: TransportMode::default(),
            headers: BTreeMap::new(),
            tool_allow_list: Vec::new(),
            prompt_allow_list: Vec::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_allow_list = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prompt(mut self, name: impl Into<String>, arguments: Option<Map<String, Value>>) -> Self {
        self.prompt_allow_list.push(PromptSelection {
            name: name.into(),
            arguments,
        });
        self
    }

    fn selection(&self, prompt: &str) -> Option<&PromptSelection> {
        self.prompt_allow_list.iter().find(|p| p.name == prompt)
    }
}

/// One server's failure inside a fan-out
#[derive(Debug, Clone)]
pub struct ServerFailure {
    pub server_name: String,
    pub uri: String,
    pub error: CatalogError,
}

/// Outcome of a fan-out across servers
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    pub items: Vec<T>,
    pub failures: Vec<ServerFailure>,
}

impl<T> Resolution<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// A tool bound to the server that provides it
#[derive(Clone)]
pub struct CatalogTool {
    pub server_name: String,
    pub server_uri: String,
    pub tool: McpTool,
    server: Arc<dyn ToolServer>,
}

impl CatalogTool {
    pub fn name(&self) -> &str {
        &self.tool.name
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.tool.name.clone(),
            description: self.tool.description.clone(),
            input_schema: self.tool.input_schema.clone(),
        }
    }

    pub async fn call(&self, arguments: Value) -> CatalogResult<ToolCallResult> {
        self.server.call_tool(&self.tool.name, arguments).await
    }
}

impl std::fmt::Debug for CatalogTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogTool")
            .field("server_name", &self.server_name)
            .field("tool", &self.tool.name)
            .finish()
    }
}

/// A prompt bound to its server plus the caller's arguments
#[derive(Clone)]
pub struct CatalogPrompt {
    pub server_name: String,
    pub server_uri: String,
    pub prompt: McpPrompt,
    pub arguments: Option<Map<String, Value>>,
    server: Arc<dyn ToolServer>,
}

impl CatalogPrompt {
    /// Fetch the prompt and turn its text messages into chat messages
    pub async fn render(&self) -> CatalogResult<Vec<ChatMessage>> {
        let result = self
            .server
            .get_prompt(&self.prompt.name, self.arguments.as_ref())
            .await?;
        Ok(result
            .messages
            .into_iter()
            .filter_map(|m| {
                let text = m.content.text?;
                let role = ChatRole::parse(&m.role).unwrap_or(ChatRole::User);
                Some(ChatMessage::new(role, text))
            })
            .collect())
    }
}

impl std::fmt::Debug for CatalogPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogPrompt")
            .field("server_name", &self.server_name)
            .field("prompt", &self.prompt.name)
            .finish()
    }
}

/// Catalog settings
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Sliding expiry of cached clients and lists
    pub cache_idle: Duration,
    pub request_timeout: Duration,
    /// Extra connection attempts after a transport failure
    pub connect_retries: u32,
    pub retry_base: Duration,
    pub elicitation_timeout: Duration,
    pub max_servers: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_idle: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(30),
            connect_retries: 2,
            retry_base: Duration::from_millis(250),
            elicitation_timeout: Duration::from_secs(60),
            max_servers: 1024,
        }
    }
}

/// Cached resolution of tool servers
pub struct ToolCatalog {
    connector: Arc<dyn Connector>,
    clients: Cache<String, Arc<dyn ToolServer>>,
    tools: Cache<String, Arc<Vec<McpTool>>>,
    prompts: Cache<String, Arc<Vec<McpPrompt>>>,
    broker: Arc<ElicitationBroker>,
    config: CatalogConfig,
}

impl ToolCatalog {
    pub fn new(config: CatalogConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            clients: idle_cache(&config),
            tools: idle_cache(&config),
            prompts: idle_cache(&config),
            broker: Arc::new(ElicitationBroker::new(config.elicitation_timeout)),
            config,
        }
    }

    /// Broker that routes server elicitations to sessions
    pub fn elicitations(&self) -> &Arc<ElicitationBroker> {
        &self.broker
    }

    /// Live client for a server, connecting on a miss
    pub async fn resolve_client(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> CatalogResult<Arc<dyn ToolServer>> {
        self.clients
            .try_get_with(descriptor.uri.clone(), self.connect_with_retry(descriptor))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn connect_with_retry(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> CatalogResult<Arc<dyn ToolServer>> {
        info!(server = %descriptor.server_name, "Client cache miss for {}", descriptor.uri);
        let mut attempt = 0u32;
        loop {
            let handle = ElicitationHandle::new(
                Arc::clone(&self.broker),
                &descriptor.server_name,
                &descriptor.uri,
            );
            match self.connector.connect(descriptor, handle).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_transport() && attempt < self.config.connect_retries => {
                    let delay = self.config.retry_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        server = %descriptor.server_name,
                        "Connection attempt {} failed ({}), retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tool list of one server
    pub async fn resolve_tools(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> CatalogResult<Arc<Vec<McpTool>>> {
        self.tools
            .try_get_with(descriptor.uri.clone(), async {
                debug!(server = %descriptor.server_name, "Tool cache miss");
                let client = self.resolve_client(descriptor).await?;
                match client.list_tools().await {
                    Ok(tools) => Ok(Arc::new(tools)),
                    Err(e) => {
                        self.drop_client_on_transport_error(&descriptor.uri, &e).await;
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Prompt list of one server; empty when it declares no prompt capability
    pub async fn resolve_prompts(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> CatalogResult<Arc<Vec<McpPrompt>>> {
        self.prompts
            .try_get_with(descriptor.uri.clone(), async {
                debug!(server = %descriptor.server_name, "Prompt cache miss");
                let client = self.resolve_client(descriptor).await?;
                if client.capabilities().prompts.is_none() {
                    return Ok(Arc::new(Vec::new()));
                }
                match client.list_prompts().await {
                    Ok(prompts) => Ok(Arc::new(prompts)),
                    Err(e) => {
                        self.drop_client_on_transport_error(&descriptor.uri, &e).await;
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e| (*e).clone())
    }

    async fn drop_client_on_transport_error(&self, uri: &str, error: &CatalogError) {
        if error.is_transport() {
            self.clients.invalidate(uri).await;
        }
    }

    /// Forget everything cached for a server
    pub async fn invalidate(&self, uri: &str) {
        info!("Invalidating catalog entries for {}", uri);
        self.clients.invalidate(uri).await;
        self.tools.invalidate(uri).await;
        self.prompts.invalidate(uri).await;
    }

    async fn tools_for(&self, descriptor: &ToolServerDescriptor) -> CatalogResult<Vec<CatalogTool>> {
        let tools = self.resolve_tools(descriptor).await?;
        let server = self.resolve_client(descriptor).await?;
        Ok(tools
            .iter()
            .map(|tool| CatalogTool {
                server_name: descriptor.server_name.clone(),
                server_uri: descriptor.uri.clone(),
                tool: tool.clone(),
                server: Arc::clone(&server),
            })
            .collect())
    }

    async fn prompts_for(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> CatalogResult<Vec<CatalogPrompt>> {
        let prompts = self.resolve_prompts(descriptor).await?;
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let server = self.resolve_client(descriptor).await?;
        Ok(prompts
            .iter()
            .map(|prompt| CatalogPrompt {
                server_name: descriptor.server_name.clone(),
                server_uri: descriptor.uri.clone(),
                prompt: prompt.clone(),
                arguments: descriptor
                    .selection(&prompt.name)
                    .and_then(|s| s.arguments.clone()),
                server: Arc::clone(&server),
            })
            .collect())
    }

    /// Every tool of every server; the first server to offer a name keeps it
    pub async fn all_tools(&self, descriptors: &[ToolServerDescriptor]) -> Resolution<CatalogTool> {
        let outcomes = join_all(descriptors.iter().map(|d| async move { (d, self.tools_for(d).await) })).await;
        let mut resolution = collect(outcomes);
        dedupe_tools(&mut resolution.items);
        resolution
    }

    /// Only tools named in their own server's allow-list.
    ///
    /// An allow-list that matches nothing yields nothing.
    pub async fn selected_tools(
        &self,
        descriptors: &[ToolServerDescriptor],
    ) -> Resolution<CatalogTool> {
        let filtering: Vec<&ToolServerDescriptor> = descriptors
            .iter()
            .filter(|d| !d.tool_allow_list.is_empty())
            .collect();
        let outcomes = join_all(filtering.into_iter().map(|d| async move {
            let tools = self.tools_for(d).await.map(|tools| {
                tools
                    .into_iter()
                    .filter(|t| d.tool_allow_list.iter().any(|name| name == t.name()))
                    .collect::<Vec<_>>()
            });
            (d, tools)
        }))
        .await;
        let mut resolution = collect(outcomes);
        dedupe_tools(&mut resolution.items);
        resolution
    }

    pub async fn all_prompts(
        &self,
        descriptors: &[ToolServerDescriptor],
    ) -> Resolution<CatalogPrompt> {
        let outcomes =
            join_all(descriptors.iter().map(|d| async move { (d, self.prompts_for(d).await) })).await;
        collect(outcomes)
    }

    /// Only prompts named in their own server's allow-list, in allow-list order
    pub async fn selected_prompts(
        &self,
        descriptors: &[ToolServerDescriptor],
    ) -> Resolution<CatalogPrompt> {
        let filtering: Vec<&ToolServerDescriptor> = descriptors
            .iter()
            .filter(|d| !d.prompt_allow_list.is_empty())
            .collect();
        let outcomes = join_all(filtering.into_iter().map(|d| async move {
            let prompts = self.prompts_for(d).await.map(|prompts| {
                d.prompt_allow_list
                    .iter()
                    .filter_map(|sel| prompts.iter().find(|p| p.prompt.name == sel.name).cloned())
                    .collect::<Vec<_>>()
            });
            (d, prompts)
        }))
        .await;
        collect(outcomes)
    }
}

fn idle_cache<V>(config: &CatalogConfig) -> Cache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(config.max_servers)
        .time_to_idle(config.cache_idle)
        .build()
}

fn collect<T>(outcomes: Vec<(&ToolServerDescriptor, CatalogResult<Vec<T>>)>) -> Resolution<T> {
    let mut resolution = Resolution::default();
    for (descriptor, outcome) in outcomes {
        match outcome {
            Ok(items) => resolution.items.extend(items),
            Err(error) => {
                warn!(server = %descriptor.server_name, "Resolution failed: {}", error);
                resolution.failures.push(ServerFailure {
                    server_name: descriptor.server_name.clone(),
                    uri: descriptor.uri.clone(),
                    error,
                });
            }
        }
    }
    resolution
}

fn dedupe_tools(tools: &mut Vec<CatalogTool>) {
    let mut seen = HashSet::new();
    tools.retain(|tool| {
        if seen.insert(tool.tool.name.clone()) {
            true
        } else {
            warn!(
                server = %tool.server_name,
                "Tool name '{}' already provided by another server, skipping",
                tool.tool.name
            );
            false
        }
    });
}
