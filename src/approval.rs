//! Human approval gate for tool calls.
//!
//! The gate is owned by one session supervisor and only touched from its
//! loop, so it needs no locking. Adapters block on a [`oneshot`] receiver
//! until the supervisor resolves, supersedes, or drains the request.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::models::control::ApprovalVerdict;
use crate::models::session::PermissionMode;

/// Tool the agent uses to ask the human a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// Tools auto-approved in `accept_edits` mode.
pub const EDIT_TOOLS: [&str; 4] = ["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Outcome handed back to the adapter for one gated call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    /// Let the call proceed.
    Allow {
        /// Replacement input supplied by the human.
        updated_input: Option<Value>,
        /// The human approved every later call of this tool as well.
        remember: bool,
    },
    /// Refuse the call.
    Deny {
        /// Explanation relayed to the agent.
        reason: String,
    },
}

impl ApprovalDecision {
    /// Plain allow with the original input.
    #[must_use]
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
            remember: false,
        }
    }

    /// Deny with `reason`.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Whether the call may proceed.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// A tool call an adapter wants cleared.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    /// Identifier echoed back by the human's decision.
    pub approval_id: String,
    /// Tool name as reported by the agent.
    pub tool_name: String,
    /// Tool input.
    pub input: Value,
    /// Agent-side tool call id, when the protocol has one.
    pub tool_use_id: Option<String>,
}

/// Result of [`ApprovalGate::resolve`] for a known request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Tool the request was for.
    pub tool_name: String,
    /// Whether the allow-list grew.
    pub allow_list_changed: bool,
}

struct PendingApproval {
    tool_name: String,
    reply: oneshot::Sender<ApprovalDecision>,
}

/// Allow-list, permission mode, and outstanding approvals of one session.
pub struct ApprovalGate {
    allowed: Vec<String>,
    mode: PermissionMode,
    pending: HashMap<String, PendingApproval>,
    questions: HashMap<String, Instant>,
}

impl ApprovalGate {
    /// Create a gate seeded with persisted patterns and mode.
    #[must_use]
    pub fn new(allowed: Vec<String>, mode: PermissionMode) -> Self {
        Self {
            allowed,
            mode,
            pending: HashMap::new(),
            questions: HashMap::new(),
        }
    }

    /// Decide without a human if policy allows it.
    ///
    /// Returns `None` when the call must wait for a decision.
    #[must_use]
    pub fn check(&self, tool_name: &str, input: &Value) -> Option<ApprovalDecision> {
        if tool_name == ASK_USER_TOOL {
            return Some(ApprovalDecision::allow());
        }

        match self.mode {
            PermissionMode::BypassPermissions => return Some(ApprovalDecision::allow()),
            PermissionMode::AcceptEdits if EDIT_TOOLS.contains(&tool_name) => {
                return Some(ApprovalDecision::allow());
            }
            _ => {}
        }

        self.allowed
            .iter()
            .any(|pattern| matches_allowed(pattern, tool_name, input))
            .then(ApprovalDecision::allow)
    }

    /// Track a request awaiting a human decision.
    ///
    /// An older request for the same tool is denied and dropped; its ids are
    /// returned.
    pub fn register(
        &mut self,
        approval_id: &str,
        tool_name: &str,
        reply: oneshot::Sender<ApprovalDecision>,
    ) -> Vec<String> {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.tool_name == tool_name)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(old) = self.pending.remove(id) {
                debug!(approval_id = %id, tool_name, "superseding stale approval");
                let _ = old
                    .reply
                    .send(ApprovalDecision::deny("superseded by a newer request"));
            }
        }

        self.pending.insert(
            approval_id.to_owned(),
            PendingApproval {
                tool_name: tool_name.to_owned(),
                reply,
            },
        );
        stale
    }

    /// Apply a human decision. Unknown ids are a no-op returning `None`.
    pub fn resolve(
        &mut self,
        approval_id: &str,
        verdict: ApprovalVerdict,
        updated_input: Option<Value>,
    ) -> Option<Resolved> {
        let pending = self.pending.remove(approval_id)?;

        let mut allow_list_changed = false;
        let decision = match verdict {
            ApprovalVerdict::Deny => ApprovalDecision::deny("denied by user"),
            ApprovalVerdict::Allow => ApprovalDecision::Allow {
                updated_input,
                remember: false,
            },
            ApprovalVerdict::AllowSession => {
                if !self.allowed.iter().any(|p| p == &pending.tool_name) {
                    self.allowed.push(pending.tool_name.clone());
                    allow_list_changed = true;
                }
                ApprovalDecision::Allow {
                    updated_input,
                    remember: true,
                }
            }
        };

        // The adapter may have gone away with the process.
        let _ = pending.reply.send(decision);

        Some(Resolved {
            tool_name: pending.tool_name,
            allow_list_changed,
        })
    }

    /// Deny every outstanding request and forget open questions.
    pub fn drain(&mut self, reason: &str) -> usize {
        let drained = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(ApprovalDecision::deny(reason));
        }
        self.questions.clear();
        drained
    }

    /// Track an open ask-user question until `deadline`.
    pub fn register_question(&mut self, approval_id: &str, deadline: Instant) {
        self.questions.insert(approval_id.to_owned(), deadline);
    }

    /// Consume an open question; `false` if unknown or expired.
    pub fn answer_question(&mut self, approval_id: &str) -> bool {
        self.questions.remove(approval_id).is_some()
    }

    /// Earliest question deadline.
    #[must_use]
    pub fn next_question_deadline(&self) -> Option<Instant> {
        self.questions.values().min().copied()
    }

    /// Remove and return questions whose deadline is at or before `now`.
    pub fn expire_questions(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .questions
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.questions.remove(id);
        }
        expired
    }

    /// Switch the auto-approval policy.
    pub fn set_mode(&mut self, mode: PermissionMode) {
        self.mode = mode;
    }

    /// Current auto-approval policy.
    #[must_use]
    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// Current allow-list.
    #[must_use]
    pub fn allowed_tools(&self) -> &[String] {
        &self.allowed
    }

    /// Number of requests awaiting a decision.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Whether an allow-list `pattern` covers a call of `tool_name` with `input`.
///
/// Patterns are an exact tool name, a `Prefix*` wildcard over tool names, or
/// `Tool(arg)` / `Tool(prefix:*)` scoped to the call's command or path.
#[must_use]
pub fn matches_allowed(pattern: &str, tool_name: &str, input: &Value) -> bool {
    if pattern == tool_name {
        return true;
    }

    if let Some((name, rest)) = pattern.split_once('(') {
        let Some(scope) = rest.strip_suffix(')') else {
            return false;
        };
        if name != tool_name {
            return false;
        }
        let Some(subject) = call_subject(input) else {
            return false;
        };
        return match scope.strip_suffix(":*").or_else(|| scope.strip_suffix('*')) {
            Some(prefix) => subject.starts_with(prefix),
            None => subject == scope,
        };
    }

    pattern
        .strip_suffix('*')
        .is_some_and(|prefix| tool_name.starts_with(prefix))
}

fn call_subject(input: &Value) -> Option<&str> {
    ["command", "file_path", "path", "pattern", "url"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
}
