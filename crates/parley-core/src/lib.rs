//! parley-core: shared model for streaming agent turns
//!
//! Provides:
//! - Message fragments and the per-bubble accumulator that builds them
//! - The function-approval gate that suspends tool calls until a human decides
//! - The agent seam (`Agent`, `ToolInvoker`) plus an OpenAI-compatible agent
//! - A small server-sent-events parser shared by the HTTP clients

pub mod agent;
pub mod approval;
pub mod fragment;
pub mod providers;
pub mod sse;
pub mod writer;

pub use agent::{Agent, AgentTurn, DeltaStream, ToolCall, ToolDefinition, ToolInvoker};
pub use approval::{ApprovalGate, ApprovalTicket, Decision, PendingCallView};
pub use fragment::{
    ElicitationPrompt, FragmentKind, MessageFragment, PropertySchema, SessionEvent, ToolUpdate,
    TurnBuffer,
};
pub use providers::{ChatMessage, ChatRole};
pub use writer::FragmentWriter;

/// Text handed back to the agent in place of a tool result when a call is rejected
pub const REJECTION_MESSAGE: &str = "Function call rejected by user.";

/// Text of the fallback fragment emitted when a turn fails
pub const FAILURE_MESSAGE: &str = "Something went wrong, please try again later.";
