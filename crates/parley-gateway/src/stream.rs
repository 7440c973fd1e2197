//! Streaming sessions: one user turn in, a sequence of fragments out
//!
//! Each call to [`StreamSession::stream`] spawns an independent task that
//! echoes the user's message, resolves tools and prompts from the catalog,
//! drives the agent, and gates every tool call on a human decision. The task
//! and the returned [`FragmentStream`] are connected by an unbounded queue.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_core::{
    Agent, AgentTurn, ApprovalGate, ChatMessage, FragmentWriter, MessageFragment,
    REJECTION_MESSAGE, SessionEvent, ToolCall, ToolInvoker, TurnBuffer,
};
use parley_mcp::{AttachGuard, CatalogTool, ServerFailure, ToolCatalog, ToolServerDescriptor};

use crate::broadcast::BroadcastRegistry;
use crate::threads::ThreadStore;

/// One user turn as submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub user: String,
    pub message: String,
    pub thread_id: String,
    #[serde(default)]
    pub tools: Vec<ToolServerDescriptor>,
    /// Also publish every fragment to this broadcast group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Append `<tool_update>` markers to the text for older clients
    pub inline_tool_markers: bool,
}

/// Orchestrates turns against shared collaborators
#[derive(Clone)]
pub struct StreamSession {
    agent: Arc<dyn Agent>,
    catalog: Arc<ToolCatalog>,
    gate: Arc<ApprovalGate>,
    threads: Arc<ThreadStore>,
    broadcast: BroadcastRegistry<MessageFragment>,
    config: SessionConfig,
}

impl StreamSession {
    pub fn new(
        agent: Arc<dyn Agent>,
        catalog: Arc<ToolCatalog>,
        gate: Arc<ApprovalGate>,
        threads: Arc<ThreadStore>,
        broadcast: BroadcastRegistry<MessageFragment>,
        config: SessionConfig,
    ) -> Self {
        Self {
            agent,
            catalog,
            gate,
            threads,
            broadcast,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn broadcast(&self) -> &BroadcastRegistry<MessageFragment> {
        &self.broadcast
    }

    pub fn threads(&self) -> &Arc<ThreadStore> {
        &self.threads
    }

    /// Start a turn.
    ///
    /// The stream ends when the turn completes, when `cancel` fires, or when
    /// the stream itself is dropped.
    pub fn stream(&self, request: SessionRequest, cancel: &CancellationToken) -> FragmentStream {
        let token = cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.clone();
        let run_token = token.clone();
        tokio::spawn(async move { session.run(request, tx, run_token).await });
        FragmentStream { rx, token }
    }

    async fn run(
        self,
        request: SessionRequest,
        tx: mpsc::UnboundedSender<MessageFragment>,
        token: CancellationToken,
    ) {
        let echo = MessageFragment::chat(
            uuid::Uuid::new_v4().to_string(),
            &request.user,
            &request.message,
        );
        let buffer = TurnBuffer::new(self.agent.name(), self.config.inline_tool_markers);
        let mut writer = FragmentWriter::new(buffer, tx);
        if let Some(group) = request.group.clone() {
            let broadcast = self.broadcast.clone();
            writer = writer.with_tap(move |fragment| {
                broadcast.publish(&group, fragment.clone());
            });
        }
        let writer = Arc::new(writer);
        writer.send(echo);

        info!(
            thread_id = %request.thread_id,
            user = %request.user,
            servers = request.tools.len(),
            "Session started"
        );

        tokio::select! {
            _ = token.cancelled() => {
                info!(thread_id = %request.thread_id, "Session cancelled");
            }
            outcome = self.drive(&request, &writer) => match outcome {
                Ok(()) => info!(thread_id = %request.thread_id, "Session completed"),
                Err(e) => {
                    error!(thread_id = %request.thread_id, "Session failed: {:#}", e);
                    writer.fail();
                }
            }
        }
    }

    async fn drive(&self, request: &SessionRequest, writer: &Arc<FragmentWriter>) -> Result<()> {
        let broker = self.catalog.elicitations();
        let _attachments: Vec<AttachGuard> = request
            .tools
            .iter()
            .map(|d| broker.attach(&d.uri, Arc::clone(writer)))
            .collect();

        let tools = if request.tools.iter().any(|d| !d.tool_allow_list.is_empty()) {
            self.catalog.selected_tools(&request.tools).await
        } else {
            self.catalog.all_tools(&request.tools).await
        };
        log_failures("tools", &tools.failures);
        debug!("Resolved {} tool(s)", tools.items.len());

        let input = self.resolve_input(request).await?;
        let history = self
            .threads
            .history(&request.user, &request.thread_id)
            .await?;

        let invoker = ApprovalInvoker {
            gate: Arc::clone(&self.gate),
            writer: Arc::clone(writer),
            catalog: Arc::clone(&self.catalog),
            tools: tools
                .items
                .iter()
                .map(|t| (t.name().to_string(), t.clone()))
                .collect(),
            serial: Mutex::new(()),
        };
        let turn = AgentTurn {
            history,
            input: input.clone(),
            tools: tools.items.iter().map(CatalogTool::definition).collect(),
            invoker: Arc::new(invoker),
        };

        let mut deltas = self
            .agent
            .stream(turn)
            .await
            .context("Failed to start agent turn")?;
        let mut reply = String::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            reply.push_str(&delta);
            writer.emit(SessionEvent::TextDelta(delta));
        }
        drop(deltas);

        self.threads
            .commit(
                &request.user,
                &request.thread_id,
                input,
                ChatMessage::assistant(reply),
            )
            .await?;
        Ok(())
    }

    /// Rendered prompts when any are selected, otherwise the raw message
    async fn resolve_input(&self, request: &SessionRequest) -> Result<Vec<ChatMessage>> {
        if request.tools.iter().any(|d| !d.prompt_allow_list.is_empty()) {
            let prompts = self.catalog.selected_prompts(&request.tools).await;
            log_failures("prompts", &prompts.failures);

            let mut input = Vec::new();
            for prompt in &prompts.items {
                let messages = prompt.render().await.with_context(|| {
                    format!(
                        "Failed to render prompt '{}' from '{}'",
                        prompt.prompt.name, prompt.server_name
                    )
                })?;
                input.extend(messages);
            }
            if !input.is_empty() {
                return Ok(input);
            }
        }
        Ok(vec![ChatMessage::user(&request.message)])
    }
}

fn log_failures(what: &str, failures: &[ServerFailure]) {
    for failure in failures {
        warn!(
            server = %failure.server_name,
            "Skipping {} from {}: {}",
            what, failure.uri, failure.error
        );
    }
}

/// Tool-execution path installed for one turn.
///
/// Every call is parked in the approval gate and reported to the client at
/// each phase. Calls run one at a time.
struct ApprovalInvoker {
    gate: Arc<ApprovalGate>,
    writer: Arc<FragmentWriter>,
    catalog: Arc<ToolCatalog>,
    tools: HashMap<String, CatalogTool>,
    serial: Mutex<()>,
}

#[async_trait]
impl ToolInvoker for ApprovalInvoker {
    async fn invoke(&self, call: ToolCall) -> Result<String> {
        let _serial = self.serial.lock().await;

        let Some(tool) = self.tools.get(&call.name) else {
            warn!("Agent called unknown tool '{}'", call.name);
            return Ok(format!("Error: unknown tool '{}'", call.name));
        };

        let ticket = self
            .gate
            .register(&tool.server_name, tool.name(), into_args(call.arguments));
        let view = ticket.call().clone();
        self.writer.emit(SessionEvent::ToolRequest(view.clone()));

        let decision = ticket.wait().await;
        if !decision.is_approved() {
            info!(call_id = %view.id, "Tool call {:?}", decision);
            self.writer.emit(SessionEvent::ToolRejected(view));
            return Ok(REJECTION_MESSAGE.to_string());
        }
        self.writer.emit(SessionEvent::ToolApproved(view.clone()));

        let text = match tool.call(Value::Object(view.args.clone())).await {
            Ok(result) => result.text(),
            Err(e) => {
                warn!(call_id = %view.id, server = %tool.server_name, "Tool call failed: {}", e);
                if e.is_transport() {
                    self.catalog.invalidate(&tool.server_uri).await;
                }
                format!("Error: {e}")
            }
        };
        self.writer.emit(SessionEvent::ToolResult {
            call: view,
            result: Value::String(text.clone()),
        });
        Ok(text)
    }
}

fn into_args(arguments: Value) -> Map<String, Value> {
    match arguments {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

/// Output of one turn; dropping it cancels the turn
pub struct FragmentStream {
    rx: mpsc::UnboundedReceiver<MessageFragment>,
    token: CancellationToken,
}

impl FragmentStream {
    /// Cancel the turn; the stream ends at the next poll
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Stream for FragmentStream {
    type Item = MessageFragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<MessageFragment>> {
        if self.token.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
