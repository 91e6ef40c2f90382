//! Normalized, sequenced events published for every session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::SessionStatus;

/// Tagged payload of one observable occurrence.
///
/// Every adapter maps its own wire protocol into these variants; viewers
/// only ever see this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// The agent reported its conversation identity.
    #[serde(rename = "session:init")]
    SessionInit {
        /// Resume reference for later cold resume.
        session_ref: String,
        /// Model reported by the agent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Tools advertised by the agent.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
    },
    /// The supervisor changed the session status.
    #[serde(rename = "session:state")]
    SessionState {
        /// New status.
        status: SessionStatus,
    },
    /// A complete block of assistant text.
    #[serde(rename = "agent:text")]
    AgentText {
        /// Text content.
        text: String,
    },
    /// A streamed fragment of assistant text.
    #[serde(rename = "agent:text-delta")]
    AgentTextDelta {
        /// Text fragment.
        text: String,
    },
    /// A complete block of model reasoning.
    #[serde(rename = "agent:thinking")]
    AgentThinking {
        /// Reasoning content.
        text: String,
    },
    /// A streamed fragment of model reasoning.
    #[serde(rename = "agent:thinking-delta")]
    AgentThinkingDelta {
        /// Reasoning fragment.
        text: String,
    },
    /// The agent started a tool call.
    #[serde(rename = "agent:tool-start")]
    AgentToolStart {
        /// Agent-assigned call identifier.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        #[serde(default)]
        input: Value,
    },
    /// A tool call finished.
    #[serde(rename = "agent:tool-end")]
    AgentToolEnd {
        /// Agent-assigned call identifier.
        tool_call_id: String,
        /// Rendered result.
        content: String,
        /// Whether the call failed.
        #[serde(default)]
        is_error: bool,
    },
    /// A gated tool call is waiting for a human decision.
    #[serde(rename = "agent:tool-approval")]
    AgentToolApproval {
        /// Identifier to echo back in the `tool-approval` control message.
        approval_id: String,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        #[serde(default)]
        input: Value,
    },
    /// The agent asked the human a question.
    #[serde(rename = "agent:ask-user")]
    AgentAskUser {
        /// Identifier to echo back in the `ask-user-answer` control message.
        approval_id: String,
        /// Question payload as produced by the agent.
        #[serde(default)]
        questions: Value,
    },
    /// A turn finished.
    #[serde(rename = "agent:result")]
    AgentResult {
        /// Whether the turn ended in error.
        #[serde(default)]
        is_error: bool,
        /// Agent-specific result subtype (`success`, `error_max_turns`, ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        /// Final text of the turn.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        /// Cost of the turn in USD.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        /// Number of model turns.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_turns: Option<u64>,
        /// Wall-clock duration.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        /// Token usage keyed by model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_usage: Option<Value>,
        /// Tool calls the agent was denied during the turn.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        permission_denials: Vec<Value>,
    },
    /// Informational message from the supervisor or agent.
    #[serde(rename = "system:info")]
    SystemInfo {
        /// Message text.
        message: String,
    },
    /// Diagnostic for something that went wrong.
    #[serde(rename = "system:error")]
    SystemError {
        /// Message text.
        message: String,
    },
    /// The agent hit a provider rate limit.
    #[serde(rename = "system:rate-limit")]
    SystemRateLimit {
        /// Message text.
        message: String,
        /// When the limit resets, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resets_at: Option<String>,
    },
    /// The human sent a message.
    #[serde(rename = "user:message")]
    UserMessage {
        /// Message text.
        text: String,
        /// Whether an image was attached.
        #[serde(default)]
        has_image: bool,
    },
}

impl EventPayload {
    /// Wire tag of this payload.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session:init",
            Self::SessionState { .. } => "session:state",
            Self::AgentText { .. } => "agent:text",
            Self::AgentTextDelta { .. } => "agent:text-delta",
            Self::AgentThinking { .. } => "agent:thinking",
            Self::AgentThinkingDelta { .. } => "agent:thinking-delta",
            Self::AgentToolStart { .. } => "agent:tool-start",
            Self::AgentToolEnd { .. } => "agent:tool-end",
            Self::AgentToolApproval { .. } => "agent:tool-approval",
            Self::AgentAskUser { .. } => "agent:ask-user",
            Self::AgentResult { .. } => "agent:result",
            Self::SystemInfo { .. } => "system:info",
            Self::SystemError { .. } => "system:error",
            Self::SystemRateLimit { .. } => "system:rate-limit",
            Self::UserMessage { .. } => "user:message",
        }
    }

    /// Shorthand for a `system:info` payload.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::SystemInfo {
            message: message.into(),
        }
    }

    /// Shorthand for a `system:error` payload.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::SystemError {
            message: message.into(),
        }
    }
}

/// A sequenced event as published on the session's event channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Per-session sequence number; gapless and strictly increasing.
    pub seq: u64,
    /// Time the supervisor sequenced the event.
    pub timestamp: DateTime<Utc>,
    /// Tagged payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}
