//! Control messages delivered to a running supervisor.

use std::sync::atomic::Ordering;

use serde_json::{json, Value};

use agent_supervisor::models::event::EventPayload;
use agent_supervisor::models::session::SessionStatus;

use super::test_helpers::{finished, harness, next_event, started, wait_for, Harness};

fn tool_start(h: &Harness, id: &str) {
    h.script.emit(EventPayload::AgentToolStart {
        tool_call_id: id.into(),
        tool_name: "Bash".into(),
        input: json!({"command": "cargo build"}),
    });
}

fn finish_turn(h: &Harness) {
    h.script.emit(EventPayload::AgentResult {
        is_error: false,
        subtype: Some("success".into()),
        result: None,
        total_cost_usd: None,
        num_turns: None,
        duration_ms: None,
        model_usage: None,
        permission_denials: Vec::new(),
    });
}

fn interrupted_end(id: &str) -> EventPayload {
    EventPayload::AgentToolEnd {
        tool_call_id: id.into(),
        content: "[Interrupted by user]".into(),
        is_error: true,
    }
}

/// Cancel closes every in-flight tool call before interrupting the agent
/// and ends the session without a restart.
#[tokio::test]
async fn cancel_closes_tools_then_ends() {
    let mut h = harness().await;
    h.script.exit_on_interrupt.store(true, Ordering::SeqCst);
    let (id, mut events, handle) = started(&h, |_| {}).await;

    tool_start(&h, "call-1");
    tool_start(&h, "call-2");
    next_event(&mut events).await;
    next_event(&mut events).await;

    h.control(&id, json!({"type": "cancel"})).await;

    assert_eq!(next_event(&mut events).await.payload, interrupted_end("call-1"));
    assert_eq!(next_event(&mut events).await.payload, interrupted_end("call-2"));
    let state = next_event(&mut events).await;
    assert_eq!(
        state.payload,
        EventPayload::SessionState {
            status: SessionStatus::Ended
        }
    );

    let snapshots = h.script.interrupt_snapshots();
    assert_eq!(snapshots.len(), 1);
    let ends_before_interrupt = snapshots[0]
        .iter()
        .filter(|event| event["type"] == "agent:tool-end")
        .count();
    assert_eq!(ends_before_interrupt, 2);

    let outcome = finished(handle).await;
    assert_eq!(outcome.status, SessionStatus::Ended);
    assert_eq!(outcome.restart, None);
    assert_eq!(outcome.diagnostic, None);
    assert!(h.jobs.try_recv().is_err());
}

/// A cancel that the agent ignores is followed by a forced kill.
#[tokio::test]
async fn cancel_escalates_to_kill() {
    let h = harness().await;
    let (id, _events, handle) = started(&h, |_| {}).await;

    h.control(&id, json!({"type": "cancel"})).await;
    let outcome = finished(handle).await;

    assert_eq!(outcome.status, SessionStatus::Ended);
    let calls = h.script.calls();
    assert!(calls.contains(&"interrupt".to_owned()));
    assert!(calls.contains(&"signal:Kill".to_owned()));
}

/// An interrupt that the process survives keeps it warm in `awaiting_input`.
#[tokio::test]
async fn interrupt_keeps_process_warm() {
    let h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;

    tool_start(&h, "call-1");
    next_event(&mut events).await;
    h.control(&id, json!({"type": "interrupt"})).await;

    assert_eq!(next_event(&mut events).await.payload, interrupted_end("call-1"));
    let state = next_event(&mut events).await;
    assert_eq!(
        state.payload,
        EventPayload::SessionState {
            status: SessionStatus::AwaitingInput
        }
    );
    assert_eq!(
        h.sessions.get_by_id(&id).await.expect("session").status,
        SessionStatus::AwaitingInput
    );

    h.script.exit(Some(0));
    let outcome = finished(handle).await;
    assert_eq!(outcome.status, SessionStatus::Idle);
}

/// A process that exits after an interrupt is left idle rather than crashed.
#[tokio::test]
async fn interrupt_exit_is_not_a_crash() {
    let h = harness().await;
    h.script.exit_on_interrupt.store(true, Ordering::SeqCst);
    let (id, _events, handle) = started(&h, |_| {}).await;

    h.control(&id, json!({"type": "interrupt"})).await;
    let outcome = finished(handle).await;

    assert_eq!(outcome.status, SessionStatus::Idle);
    assert_eq!(outcome.diagnostic, None);
}

/// A message to a waiting agent is echoed, delivered, and reactivates it.
#[tokio::test]
async fn message_is_delivered_to_live_agent() {
    let h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;

    finish_turn(&h);
    wait_for(&mut events, |p| {
        *p == EventPayload::SessionState {
            status: SessionStatus::AwaitingInput,
        }
    })
    .await;

    h.control(
        &id,
        json!({
            "type": "message",
            "text": "now add tests",
            "image": {"mediaType": "image/png", "data": "aGVsbG8="},
        }),
    )
    .await;

    assert_eq!(
        next_event(&mut events).await.payload,
        EventPayload::UserMessage {
            text: "now add tests".into(),
            has_image: true,
        }
    );
    assert_eq!(
        next_event(&mut events).await.payload,
        EventPayload::SessionState {
            status: SessionStatus::Active
        }
    );
    assert!(h
        .script
        .calls()
        .contains(&"send:now add tests +image".to_owned()));

    h.script.exit(Some(0));
    finished(handle).await;
}

/// A message arriving while the agent is shutting down becomes the next
/// prompt and forces a resume.
#[tokio::test]
async fn message_during_shutdown_is_queued_for_resume() {
    let mut h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;
    h.script.emit(EventPayload::SessionInit {
        session_ref: "conv-9".into(),
        model: None,
        tools: Vec::new(),
    });
    next_event(&mut events).await;

    h.control(&id, json!({"type": "cancel"})).await;
    h.control(&id, json!({"type": "message", "text": "one more thing"})).await;

    let outcome = finished(handle).await;
    assert_eq!(outcome.status, SessionStatus::Ended);
    assert!(outcome.restart.is_some());

    let job = h.next_job().await;
    assert_eq!(job.session_id, id);
    assert_eq!(job.resume_ref.as_deref(), Some("conv-9"));
    let stored = h.sessions.get_by_id(&id).await.expect("session");
    assert_eq!(stored.prompt.as_deref(), Some("one more thing"));
    assert!(!h.script.calls().iter().any(|c| c.starts_with("send:")));
}

/// Redirect abandons the current turn and sends the new prompt.
#[tokio::test]
async fn redirect_replaces_current_turn() {
    let h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;

    tool_start(&h, "call-1");
    next_event(&mut events).await;
    h.control(
        &id,
        json!({"type": "redirect", "newPrompt": "focus on the parser instead"}),
    )
    .await;

    assert_eq!(next_event(&mut events).await.payload, interrupted_end("call-1"));
    assert_eq!(
        next_event(&mut events).await.payload,
        EventPayload::UserMessage {
            text: "focus on the parser instead".into(),
            has_image: false,
        }
    );

    h.script.called("send:").await;
    let calls = h.script.calls();
    let interrupt = calls.iter().position(|c| c == "interrupt").expect("interrupt");
    let send = calls
        .iter()
        .position(|c| c == "send:focus on the parser instead")
        .expect("send");
    assert!(interrupt < send);
    assert_eq!(
        h.sessions.get_by_id(&id).await.expect("session").prompt.as_deref(),
        Some("focus on the parser instead")
    );

    h.script.exit(Some(0));
    finished(handle).await;
}

/// A waiting agent is retired once its idle timeout elapses.
#[tokio::test]
async fn idle_timeout_retires_waiting_agent() {
    let h = harness().await;
    let (id, mut events, handle) = started(&h, |s| s.idle_timeout_secs = 1).await;

    finish_turn(&h);
    let notice = wait_for(&mut events, |p| matches!(p, EventPayload::SystemInfo { .. })).await;
    assert_eq!(notice.payload, EventPayload::info("Idle timeout reached; stopping agent"));

    let outcome = finished(handle).await;
    assert_eq!(outcome.status, SessionStatus::Idle);
    assert!(h.script.calls().contains(&"signal:Terminate".to_owned()));
    assert_eq!(
        h.sessions.get_by_id(&id).await.expect("session").status,
        SessionStatus::Idle
    );
}

/// Without in-place support the model is stored for the next start.
#[tokio::test]
async fn set_model_without_support_applies_next_start() {
    let h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;

    h.control(&id, json!({"type": "set-model", "model": "opus"})).await;
    let error = next_event(&mut events).await;
    assert!(matches!(error.payload, EventPayload::SystemError { .. }));
    assert_eq!(
        h.sessions.get_by_id(&id).await.expect("session").model.as_deref(),
        Some("opus")
    );

    h.script.exit(Some(0));
    finished(handle).await;
}

/// With in-place support the model switches immediately.
#[tokio::test]
async fn set_model_in_place() {
    let h = harness().await;
    h.script.model_support.store(true, Ordering::SeqCst);
    let (id, mut events, handle) = started(&h, |_| {}).await;

    h.control(&id, json!({"type": "set-model", "model": "sonnet"})).await;
    assert_eq!(
        next_event(&mut events).await.payload,
        EventPayload::info("Model set to sonnet")
    );
    assert!(h.script.calls().contains(&"set_model:sonnet".to_owned()));

    h.script.exit(Some(0));
    finished(handle).await;
}

/// Malformed control messages are ignored and the run carries on.
#[tokio::test]
async fn malformed_control_is_ignored() {
    let h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;

    h.control(&id, json!({"type": "self-destruct"})).await;
    h.control(&id, Value::String("garbage".into())).await;
    h.control(&id, json!({"type": "message", "text": "still there?"})).await;

    assert_eq!(
        next_event(&mut events).await.payload,
        EventPayload::UserMessage {
            text: "still there?".into(),
            has_image: false,
        }
    );

    h.script.exit(Some(0));
    finished(handle).await;
}
