//! Message fragments: cumulative snapshots of a message being built
//!
//! A turn is reported to clients as a sequence of [`MessageFragment`]s. All
//! fragments sharing a `bubbleId` describe the same logical message, and each
//! one carries the full text known so far rather than a delta. Fragments are
//! built fresh from a [`TurnBuffer`] every time a [`SessionEvent`] is applied.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::FAILURE_MESSAGE;
use crate::approval::PendingCallView;

/// What a fragment represents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FragmentKind {
    #[default]
    Chat,
    FunctionRequest,
    FunctionApproved,
    FunctionRejected,
    FunctionResult,
    ToolDirectoryRequest,
}

impl FragmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::FunctionRequest => "function-request",
            Self::FunctionApproved => "function-approved",
            Self::FunctionRejected => "function-rejected",
            Self::FunctionResult => "function-result",
            Self::ToolDirectoryRequest => "tool-directory-request",
        }
    }
}

impl std::fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed schema for one field a tool server asks the user to fill in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum PropertySchema {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<f64>,
    },
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
    },
    Enum {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(rename = "enum", default)]
        values: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enum_names: Option<Vec<String>>,
    },
}

/// A pending request for structured user input raised by a tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationPrompt {
    /// Identifier to answer through the elicitation endpoint
    pub id: String,
    pub message: String,
    pub fields: BTreeMap<String, PropertySchema>,
}

/// Structured tool-status annotation carried next to the text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUpdate {
    pub plugin_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: FragmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_args: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationPrompt>,
}

impl ToolUpdate {
    fn for_call(kind: FragmentKind, call: &PendingCallView, result: Option<Value>) -> Self {
        Self {
            plugin_name: call.plugin_name.clone(),
            function_name: Some(call.function_name.clone()),
            kind,
            function_args: Some(call.args.clone()),
            result,
            elicitation: None,
        }
    }

    /// The in-band marker form understood by older clients
    pub fn inline_marker(&self) -> String {
        let tag = if self.kind == FragmentKind::ToolDirectoryRequest {
            "mcp_tool_update"
        } else {
            "tool_update"
        };
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("<{tag}>{json}</{tag}>")
    }
}

/// One emission on a session's output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFragment {
    pub bubble_id: String,
    pub user: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: FragmentKind,
    #[serde(default)]
    pub pending_function_call: Option<PendingCallView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_update: Option<ToolUpdate>,
}

impl MessageFragment {
    /// A plain chat fragment
    pub fn chat(
        bubble_id: impl Into<String>,
        user: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            bubble_id: bubble_id.into(),
            user: user.into(),
            message: message.into(),
            kind: FragmentKind::Chat,
            pending_function_call: None,
            tool_update: None,
        }
    }
}

/// Everything that can happen to the assistant's bubble during a turn
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TextDelta(String),
    ToolRequest(PendingCallView),
    ToolApproved(PendingCallView),
    ToolRejected(PendingCallView),
    ToolResult { call: PendingCallView, result: Value },
    Elicitation { server: String, prompt: ElicitationPrompt },
}

/// Running state of one assistant bubble
#[derive(Debug, Clone)]
pub struct TurnBuffer {
    bubble_id: String,
    author: String,
    text: String,
    inline_markers: bool,
}

impl TurnBuffer {
    /// Start a new bubble with a random id
    pub fn new(author: impl Into<String>, inline_markers: bool) -> Self {
        Self::with_bubble_id(uuid::Uuid::new_v4().to_string(), author, inline_markers)
    }

    pub fn with_bubble_id(
        bubble_id: impl Into<String>,
        author: impl Into<String>,
        inline_markers: bool,
    ) -> Self {
        Self {
            bubble_id: bubble_id.into(),
            author: author.into(),
            text: String::new(),
            inline_markers,
        }
    }

    /// Fold an event into the buffer and return the resulting snapshot
    pub fn apply(&mut self, event: SessionEvent) -> MessageFragment {
        match event {
            SessionEvent::TextDelta(delta) => {
                self.text.push_str(&delta);
                self.snapshot(FragmentKind::Chat, None, None)
            }
            SessionEvent::ToolRequest(call) => self.tool_phase(FragmentKind::FunctionRequest, call, None),
            SessionEvent::ToolApproved(call) => {
                self.tool_phase(FragmentKind::FunctionApproved, call, None)
            }
            SessionEvent::ToolRejected(call) => {
                self.tool_phase(FragmentKind::FunctionRejected, call, None)
            }
            SessionEvent::ToolResult { call, result } => {
                self.tool_phase(FragmentKind::FunctionResult, call, Some(result))
            }
            SessionEvent::Elicitation { server, prompt } => {
                let update = ToolUpdate {
                    plugin_name: server,
                    function_name: None,
                    kind: FragmentKind::ToolDirectoryRequest,
                    function_args: None,
                    result: None,
                    elicitation: Some(prompt),
                };
                self.push_marker(&update);
                self.snapshot(FragmentKind::ToolDirectoryRequest, None, Some(update))
            }
        }
    }

    /// Replace the bubble's content with the generic failure text
    pub fn fail(&mut self) -> MessageFragment {
        self.text = FAILURE_MESSAGE.to_string();
        self.snapshot(FragmentKind::Chat, None, None)
    }

    fn tool_phase(
        &mut self,
        kind: FragmentKind,
        call: PendingCallView,
        result: Option<Value>,
    ) -> MessageFragment {
        let update = ToolUpdate::for_call(kind, &call, result);
        self.push_marker(&update);
        self.snapshot(kind, Some(call), Some(update))
    }

    fn push_marker(&mut self, update: &ToolUpdate) {
        if self.inline_markers {
            self.text.push_str(&update.inline_marker());
        }
    }

    fn snapshot(
        &self,
        kind: FragmentKind,
        call: Option<PendingCallView>,
        update: Option<ToolUpdate>,
    ) -> MessageFragment {
        MessageFragment {
            bubble_id: self.bubble_id.clone(),
            user: self.author.clone(),
            message: self.text.clone(),
            kind,
            pending_function_call: call,
            tool_update: update,
        }
    }
}
