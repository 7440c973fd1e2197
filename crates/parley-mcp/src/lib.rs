//! MCP (Model Context Protocol) support for Parley
//!
//! Client side only: connects to remote tool servers over HTTP, answers
//! their elicitation requests through the gateway, and caches what they
//! offer in a [`ToolCatalog`].

pub mod catalog;
pub mod client;
pub mod elicitation;
pub mod error;
pub mod protocol;

pub use catalog::{
    CatalogConfig, CatalogPrompt, CatalogTool, PromptSelection, Resolution, ServerFailure,
    ToolCatalog, ToolServerDescriptor, TransportMode,
};
pub use client::{Connector, HttpConnector, HttpMcpClient, ToolServer};
pub use elicitation::{AttachGuard, ElicitationBroker, ElicitationHandle};
pub use error::{CatalogError, CatalogResult};
pub use protocol::{ElicitAction, ElicitResult, McpPrompt, McpTool, ToolCallResult};
