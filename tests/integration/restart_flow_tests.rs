//! Restarts that apply settings, and messages for sessions without a process.

use std::sync::atomic::Ordering;

use serde_json::json;

use agent_supervisor::models::event::EventPayload;
use agent_supervisor::models::session::{PermissionMode, SessionStatus};
use agent_supervisor::supervisor::session::CONTINUE_PROMPT;
use agent_supervisor::supervisor::{route_cold_message, Restart};

use super::test_helpers::{finished, harness, next_event, started, wait_for, Harness, ModeSupport};

fn init(h: &Harness, session_ref: &str) {
    h.script.emit(EventPayload::SessionInit {
        session_ref: session_ref.into(),
        model: Some("sonnet".into()),
        tools: vec!["Bash".into()],
    });
}

/// Without in-place support a mode change restarts into the same
/// conversation.
#[tokio::test]
async fn permission_mode_restart_resumes() {
    let mut h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;
    init(&h, "conv-5");
    next_event(&mut events).await;

    h.control(&id, json!({"type": "set-permission-mode", "mode": "acceptEdits"}))
        .await;
    let notice = next_event(&mut events).await;
    assert_eq!(
        notice.payload,
        EventPayload::info("Restarting agent: applying permission mode")
    );

    let outcome = finished(handle).await;
    assert_eq!(outcome.status, SessionStatus::Idle);
    assert_eq!(outcome.restart, Some(Restart::Resume));
    assert!(h.script.calls().contains(&"signal:Terminate".to_owned()));

    let job = h.next_job().await;
    assert_eq!(job.session_id, id);
    assert_eq!(job.resume_ref.as_deref(), Some("conv-5"));

    let stored = h.sessions.get_by_id(&id).await.expect("session");
    assert_eq!(stored.permission_mode, PermissionMode::AcceptEdits);
    assert_eq!(stored.prompt.as_deref(), Some(CONTINUE_PROMPT));
    assert_eq!(stored.resume_ref.as_deref(), Some("conv-5"));
    assert_eq!(stored.owner_worker, None);
}

/// An agent that can switch modes in place keeps running.
#[tokio::test]
async fn permission_mode_switches_in_place() {
    let mut h = harness().await;
    *h.script.mode_support.lock().unwrap() = ModeSupport::Succeeds;
    let (id, mut events, handle) = started(&h, |_| {}).await;

    h.control(&id, json!({"type": "set-permission-mode", "mode": "plan"}))
        .await;
    assert_eq!(
        next_event(&mut events).await.payload,
        EventPayload::info("Permission mode set to plan")
    );
    assert!(h.script.calls().contains(&"set_mode:plan".to_owned()));
    assert_eq!(
        h.sessions.get_by_id(&id).await.expect("session").permission_mode,
        PermissionMode::Plan
    );

    h.script.exit(Some(0));
    let outcome = finished(handle).await;
    assert_eq!(outcome.restart, None);
    assert!(h.jobs.try_recv().is_err());
}

/// A failed in-place switch falls back to a restart.
#[tokio::test]
async fn failed_in_place_switch_restarts() {
    let mut h = harness().await;
    *h.script.mode_support.lock().unwrap() = ModeSupport::Fails;
    let (id, _events, handle) = started(&h, |_| {}).await;

    h.control(
        &id,
        json!({"type": "set-permission-mode", "mode": "bypass_permissions"}),
    )
    .await;

    let outcome = finished(handle).await;
    assert_eq!(outcome.restart, Some(Restart::Resume));
    assert_eq!(h.next_job().await.session_id, id);
}

/// Clearing context restarts without the resume reference.
#[tokio::test]
async fn clear_context_restarts_fresh() {
    let mut h = harness().await;
    let (id, mut events, handle) = started(&h, |_| {}).await;
    init(&h, "conv-6");
    next_event(&mut events).await;

    h.control(&id, json!({"type": "clear-context"})).await;
    wait_for(&mut events, |p| {
        *p == EventPayload::SessionState {
            status: SessionStatus::Idle,
        }
    })
    .await;

    let outcome = finished(handle).await;
    assert_eq!(outcome.restart, Some(Restart::Fresh));

    let job = h.next_job().await;
    assert_eq!(job.resume_ref, None);
    let stored = h.sessions.get_by_id(&id).await.expect("session");
    assert_eq!(stored.resume_ref, None);
    assert_eq!(stored.prompt.as_deref(), Some("fix the bug"));
}

/// A message sent while a clear-context restart is stopping the agent
/// becomes the new prompt but does not bring the old conversation back.
#[tokio::test]
async fn message_during_clear_context_keeps_fresh_restart() {
    let mut h = harness().await;
    h.script.exit_on_signal.store(false, Ordering::SeqCst);
    let (id, mut events, handle) = started(&h, |_| {}).await;
    init(&h, "conv-9");
    next_event(&mut events).await;

    h.control(&id, json!({"type": "clear-context"})).await;
    wait_for(&mut events, |p| {
        *p == EventPayload::info("Restarting agent: clearing conversation context")
    })
    .await;

    h.control(&id, json!({"type": "message", "text": "new topic"}))
        .await;
    wait_for(&mut events, |p| {
        *p == EventPayload::info(
            "Agent is stopping; the message will be sent when the session resumes",
        )
    })
    .await;
    h.script.exit(None);

    let outcome = finished(handle).await;
    assert_eq!(outcome.restart, Some(Restart::Fresh));

    let job = h.next_job().await;
    assert_eq!(job.resume_ref, None);
    let stored = h.sessions.get_by_id(&id).await.expect("session");
    assert_eq!(stored.resume_ref, None);
    assert_eq!(stored.prompt.as_deref(), Some("new topic"));
}

/// A message for an idle session becomes its prompt and a resume job.
#[tokio::test]
async fn cold_message_is_queued() {
    let mut h = harness().await;
    let id = h
        .create_session(|s| s.resume_ref = Some("conv-7".into()))
        .await;

    let queued = route_cold_message(h.sessions.as_ref(), h.queue.as_ref(), &id, "keep going")
        .await
        .expect("route");
    assert!(queued);

    let job = h.next_job().await;
    assert_eq!(job.session_id, id);
    assert_eq!(job.resume_ref.as_deref(), Some("conv-7"));
    assert_eq!(
        h.sessions.get_by_id(&id).await.expect("session").prompt.as_deref(),
        Some("keep going")
    );
}

/// A message for a live session is left to its control channel.
#[tokio::test]
async fn live_session_is_not_cold_routed() {
    let mut h = harness().await;
    let (id, _events, handle) = started(&h, |_| {}).await;

    let queued = route_cold_message(h.sessions.as_ref(), h.queue.as_ref(), &id, "hello")
        .await
        .expect("route");
    assert!(!queued);
    assert!(h.jobs.try_recv().is_err());

    h.script.exit(Some(0));
    finished(handle).await;
}
