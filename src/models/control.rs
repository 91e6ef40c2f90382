//! Inbound control messages delivered over a session's control channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::PermissionMode;

/// Base64 image attached to a user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Human decision on a gated tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalVerdict {
    /// Allow this one call.
    Allow,
    /// Deny this call.
    Deny,
    /// Allow this call and every later call of the same tool.
    AllowSession,
}

/// Instruction sent to a running supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Send a user turn.
    Message {
        /// Message text.
        text: String,
        /// Optional image.
        #[serde(default)]
        image: Option<ImageAttachment>,
    },
    /// Stop the session for good.
    Cancel,
    /// Stop the current turn but keep the session resumable.
    Interrupt,
    /// Abandon the current turn and start over with a new prompt.
    Redirect {
        /// Replacement prompt.
        new_prompt: String,
    },
    /// Decide an outstanding approval.
    ToolApproval {
        /// Identifier from the `agent:tool-approval` event.
        approval_id: String,
        /// Tool name from the event.
        #[serde(default)]
        tool_name: String,
        /// Decision.
        decision: ApprovalVerdict,
        /// Replacement tool input for an allow.
        #[serde(default)]
        updated_input: Option<Value>,
    },
    /// Answer an outstanding ask-user question.
    AskUserAnswer {
        /// Identifier from the `agent:ask-user` event.
        approval_id: String,
        /// Answer text.
        answer: String,
    },
    /// Switch the model.
    SetModel {
        /// Model name.
        model: String,
    },
    /// Switch the auto-approval policy.
    SetPermissionMode {
        /// New mode.
        mode: PermissionMode,
    },
    /// Restart with a fresh conversation.
    ClearContext,
}

impl ControlMessage {
    /// Wire tag of this message, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Cancel => "cancel",
            Self::Interrupt => "interrupt",
            Self::Redirect { .. } => "redirect",
            Self::ToolApproval { .. } => "tool-approval",
            Self::AskUserAnswer { .. } => "ask-user-answer",
            Self::SetModel { .. } => "set-model",
            Self::SetPermissionMode { .. } => "set-permission-mode",
            Self::ClearContext => "clear-context",
        }
    }
}
