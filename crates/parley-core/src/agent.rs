//! The external agent seam
//!
//! The session never generates text itself. It hands an [`Agent`] the
//! conversation, the resolved tool set and a [`ToolInvoker`], then relays the
//! text deltas the agent streams back. Every tool call the agent wants to make
//! goes through the invoker, which is where approval gating happens.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::providers::ChatMessage;

/// Tool definition handed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool call attempted by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Model-side call id (not the approval id)
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Tool-execution path installed for one turn
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute a call, returning the text the agent should see as its result
    async fn invoke(&self, call: ToolCall) -> Result<String>;
}

/// Everything an agent needs to run one turn
#[derive(Clone)]
pub struct AgentTurn {
    /// Prior messages of this conversation thread
    pub history: Vec<ChatMessage>,
    /// New input for this turn (the user message or rendered prompts)
    pub input: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub invoker: Arc<dyn ToolInvoker>,
}

/// Incremental text deltas of the assistant reply
pub type DeltaStream = BoxStream<'static, Result<String>>;

/// A streaming completion capability
#[async_trait]
pub trait Agent: Send + Sync {
    /// Display name used as the author of assistant fragments
    fn name(&self) -> &str;

    /// Start a turn; the returned stream ends when the reply is complete.
    ///
    /// Dropping the stream must abandon any in-flight tool invocation.
    async fn stream(&self, turn: AgentTurn) -> Result<DeltaStream>;
}
