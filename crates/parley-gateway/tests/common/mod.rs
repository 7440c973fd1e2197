//! Shared fixtures: a scripted agent, an in-memory tool server and a gateway
//! bound to an ephemeral port.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use parley_core::{
    Agent, AgentTurn, ApprovalGate, DeltaStream, MessageFragment, ToolCall,
};
use parley_gateway::{
    BroadcastConfig, BroadcastRegistry, GatewayConfig, GatewayServer, SessionConfig,
    SessionRequest, StreamSession, ThreadConfig, ThreadStore,
};
use parley_mcp::protocol::{
    ContentBlock, ElicitRequestParams, GetPromptResult, McpPrompt, McpTool, RequestedSchema,
    ServerCapabilities, ToolCallResult,
};
use parley_mcp::{
    CatalogConfig, CatalogError, CatalogResult, Connector, ElicitAction, ElicitationHandle,
    ToolCatalog, ToolServer, ToolServerDescriptor,
};

pub const WEATHER_URI: &str = "http://weather.test/mcp";

#[derive(Clone)]
pub enum Step {
    Text(&'static str),
    Call(&'static str, Value),
}

/// Plays back a fixed script; tool results are recorded in `results`
pub struct ScriptedAgent {
    steps: Vec<Step>,
    pub results: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            results: Arc::default(),
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "Assistant"
    }

    async fn stream(&self, turn: AgentTurn) -> Result<DeltaStream> {
        let invoker = turn.invoker;
        let results = Arc::clone(&self.results);
        let deltas = stream::iter(self.steps.clone()).then(move |step| {
            let invoker = Arc::clone(&invoker);
            let results = Arc::clone(&results);
            async move {
                match step {
                    Step::Text(text) => Ok(text.to_string()),
                    Step::Call(name, arguments) => {
                        let result = invoker
                            .invoke(ToolCall {
                                id: "call_0".to_string(),
                                name: name.to_string(),
                                arguments,
                            })
                            .await?;
                        results.lock().unwrap().push(result.clone());
                        Ok(format!(" ({result})"))
                    }
                }
            }
        });
        Ok(deltas.boxed())
    }
}

/// `get` reports the weather; `confirm` asks the user first
struct WeatherServer {
    elicitation: ElicitationHandle,
}

#[async_trait]
impl ToolServer for WeatherServer {
    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(json!({})),
            prompts: None,
        }
    }

    async fn list_tools(&self) -> CatalogResult<Vec<McpTool>> {
        Ok(["get", "confirm"]
            .into_iter()
            .map(|name| McpTool {
                name: name.to_string(),
                description: format!("weather {name}"),
                input_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn list_prompts(&self) -> CatalogResult<Vec<McpPrompt>> {
        Ok(Vec::new())
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: Option<&Map<String, Value>>,
    ) -> CatalogResult<GetPromptResult> {
        Err(CatalogError::Rpc {
            server: "weather".to_string(),
            code: -32602,
            message: format!("no prompt '{name}'"),
        })
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> CatalogResult<ToolCallResult> {
        let text = match name {
            "confirm" => {
                let mut properties = BTreeMap::new();
                properties.insert("ok".to_string(), json!({"type": "boolean"}));
                let answer = self
                    .elicitation
                    .elicit(ElicitRequestParams {
                        message: "Really?".to_string(),
                        requested_schema: RequestedSchema {
                            properties,
                            required: vec!["ok".to_string()],
                        },
                    })
                    .await;
                match answer.action {
                    ElicitAction::Accept => "confirmed".to_string(),
                    ElicitAction::Decline => "declined".to_string(),
                    ElicitAction::Cancel => "cancelled".to_string(),
                }
            }
            _ => format!(
                "sunny in {}",
                arguments["city"].as_str().unwrap_or("nowhere")
            ),
        };
        Ok(ToolCallResult {
            content: vec![ContentBlock {
                content_type: "text".to_string(),
                text: Some(text),
            }],
            is_error: false,
            structured_content: None,
        })
    }
}

struct WeatherConnector;

#[async_trait]
impl Connector for WeatherConnector {
    async fn connect(
        &self,
        descriptor: &ToolServerDescriptor,
        elicitation: ElicitationHandle,
    ) -> CatalogResult<Arc<dyn ToolServer>> {
        if descriptor.uri != WEATHER_URI {
            return Err(CatalogError::Transport {
                server: descriptor.server_name.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(WeatherServer { elicitation }))
    }
}

pub fn weather() -> ToolServerDescriptor {
    ToolServerDescriptor::new("weather", WEATHER_URI)
}

pub fn request(message: &str, tools: Vec<ToolServerDescriptor>) -> SessionRequest {
    SessionRequest {
        user: "alice".to_string(),
        message: message.to_string(),
        thread_id: "0b8f6c1e-4a51-4c57-9a3e-7d3f2b1c9e10".to_string(),
        tools,
        group: None,
    }
}

/// A gateway serving on 127.0.0.1 with an ephemeral port
pub struct TestGateway {
    pub addr: SocketAddr,
    pub session: StreamSession,
    shutdown: CancellationToken,
}

impl TestGateway {
    pub async fn spawn(agent: ScriptedAgent) -> Self {
        let catalog = ToolCatalog::new(
            CatalogConfig {
                connect_retries: 0,
                elicitation_timeout: Duration::from_secs(5),
                ..CatalogConfig::default()
            },
            Arc::new(WeatherConnector),
        );
        let session = StreamSession::new(
            Arc::new(agent),
            Arc::new(catalog),
            Arc::new(ApprovalGate::new()),
            Arc::new(ThreadStore::new(ThreadConfig::default())),
            BroadcastRegistry::new(BroadcastConfig::default()),
            SessionConfig::default(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = GatewayServer::new(session.clone(), GatewayConfig::default());
        tokio::spawn(server.run_on(listener, shutdown.clone()));

        Self {
            addr,
            session,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Wait until exactly one call is pending and return its id
    pub async fn next_pending(&self) -> String {
        for _ in 0..200 {
            if let Some(call) = self.session.gate().list_pending().into_iter().next() {
                return call.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no call became pending");
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn kinds(fragments: &[MessageFragment]) -> Vec<String> {
    fragments.iter().map(|f| f.kind.to_string()).collect()
}
