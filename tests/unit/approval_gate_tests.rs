//! Approval gate policy, supersession, drain, and ask-user questions.

use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;

use agent_supervisor::approval::{ApprovalDecision, ApprovalGate, ASK_USER_TOOL};
use agent_supervisor::models::control::ApprovalVerdict;
use agent_supervisor::models::session::PermissionMode;

fn gate(allowed: &[&str], mode: PermissionMode) -> ApprovalGate {
    ApprovalGate::new(allowed.iter().map(|p| (*p).to_owned()).collect(), mode)
}

/// Exact, prefix, and scoped patterns short-circuit to allow.
#[test]
fn allow_list_patterns_short_circuit() {
    let gate = gate(&["Read", "mcp__github__*", "Bash(git:*)"], PermissionMode::Default);

    assert_eq!(gate.check("Read", &json!({})), Some(ApprovalDecision::allow()));
    assert!(gate.check("mcp__github__create_issue", &json!({})).is_some());
    assert!(gate.check("Bash", &json!({"command": "git log"})).is_some());
    assert!(gate.check("Bash", &json!({"command": "rm -rf /"})).is_none());
    assert!(gate.check("Write", &json!({})).is_none());
}

/// Bypass allows everything; accept-edits allows only edit tools.
#[test]
fn permission_modes_short_circuit() {
    let bypass = gate(&[], PermissionMode::BypassPermissions);
    assert!(bypass.check("Bash", &json!({"command": "anything"})).is_some());

    let edits = gate(&[], PermissionMode::AcceptEdits);
    assert!(edits.check("Edit", &json!({})).is_some());
    assert!(edits.check("MultiEdit", &json!({})).is_some());
    assert!(edits.check("Bash", &json!({})).is_none());
}

/// The ask-user tool is always allowed at the protocol layer.
#[test]
fn ask_user_tool_is_always_allowed() {
    let gate = gate(&[], PermissionMode::Default);
    assert_eq!(
        gate.check(ASK_USER_TOOL, &json!({"questions": []})),
        Some(ApprovalDecision::allow())
    );
}

/// A newer request for the same tool denies the stale one.
#[tokio::test]
async fn duplicate_request_supersedes_stale() {
    let mut gate = gate(&[], PermissionMode::Default);
    let (old_tx, old_rx) = oneshot::channel();
    let (new_tx, _new_rx) = oneshot::channel();
    let (other_tx, _other_rx) = oneshot::channel();

    assert!(gate.register("a-1", "Bash", old_tx).is_empty());
    assert!(gate.register("w-1", "Write", other_tx).is_empty());
    let superseded = gate.register("a-2", "Bash", new_tx);

    assert_eq!(superseded, vec!["a-1".to_owned()]);
    assert_eq!(gate.pending_count(), 2);
    let decision = old_rx.await.expect("stale request answered");
    assert_eq!(decision, ApprovalDecision::deny("superseded by a newer request"));
}

/// Resolving delivers the decision; unknown ids are a no-op.
#[tokio::test]
async fn resolve_delivers_and_ignores_unknown() {
    let mut gate = gate(&[], PermissionMode::Default);
    let (tx, rx) = oneshot::channel();
    gate.register("a-1", "Bash", tx);

    assert!(gate.resolve("nope", ApprovalVerdict::Allow, None).is_none());
    assert_eq!(gate.pending_count(), 1);

    let resolved = gate
        .resolve("a-1", ApprovalVerdict::Allow, Some(json!({"command": "ls"})))
        .expect("known id resolves");
    assert_eq!(resolved.tool_name, "Bash");
    assert!(!resolved.allow_list_changed);
    assert_eq!(
        rx.await.expect("decision delivered"),
        ApprovalDecision::Allow {
            updated_input: Some(json!({"command": "ls"})),
            remember: false,
        }
    );
}

/// Allow-for-session extends the allow-list once.
#[test]
fn allow_session_extends_allow_list() {
    let mut gate = gate(&[], PermissionMode::Default);
    let (tx1, _rx1) = oneshot::channel();
    gate.register("a-1", "WebFetch", tx1);
    let first = gate
        .resolve("a-1", ApprovalVerdict::AllowSession, None)
        .expect("resolves");
    assert!(first.allow_list_changed);
    assert_eq!(gate.allowed_tools(), ["WebFetch".to_owned()]);

    let (tx2, _rx2) = oneshot::channel();
    gate.register("a-2", "WebFetch", tx2);
    let second = gate
        .resolve("a-2", ApprovalVerdict::AllowSession, None)
        .expect("resolves");
    assert!(!second.allow_list_changed);
    assert_eq!(gate.allowed_tools().len(), 1);
    assert!(gate.check("WebFetch", &json!({})).is_some());
}

/// Draining with N pending denies exactly N waiters.
#[tokio::test]
async fn drain_denies_every_waiter() {
    let mut gate = gate(&[], PermissionMode::Default);
    let mut receivers = Vec::new();
    for (id, tool) in [("a", "Bash"), ("b", "Write"), ("c", "WebFetch")] {
        let (tx, rx) = oneshot::channel();
        gate.register(id, tool, tx);
        receivers.push(rx);
    }

    assert_eq!(gate.drain("session cancelled"), 3);
    assert_eq!(gate.pending_count(), 0);
    for rx in receivers {
        assert_eq!(
            rx.await.expect("drained waiter answered"),
            ApprovalDecision::deny("session cancelled")
        );
    }
}

/// Questions expire at their deadline and cannot be answered afterwards.
#[test]
fn questions_expire_at_deadline() {
    let mut gate = gate(&[], PermissionMode::Default);
    let now = Instant::now();
    gate.register_question("q-early", now + Duration::from_secs(1));
    gate.register_question("q-late", now + Duration::from_secs(300));

    assert_eq!(gate.next_question_deadline(), Some(now + Duration::from_secs(1)));
    assert!(gate.expire_questions(now).is_empty());

    let expired = gate.expire_questions(now + Duration::from_secs(2));
    assert_eq!(expired, vec!["q-early".to_owned()]);
    assert!(!gate.answer_question("q-early"));
    assert!(gate.answer_question("q-late"));
    assert_eq!(gate.next_question_deadline(), None);
}

/// Switching mode changes later checks.
#[test]
fn set_mode_changes_policy() {
    let mut gate = gate(&[], PermissionMode::Default);
    assert!(gate.check("Edit", &json!({})).is_none());
    gate.set_mode(PermissionMode::AcceptEdits);
    assert_eq!(gate.mode(), PermissionMode::AcceptEdits);
    assert!(gate.check("Edit", &json!({})).is_some());
}
