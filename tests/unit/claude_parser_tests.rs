//! Stream-json line mapping for the line-delimited adapter.

use serde_json::json;

use agent_supervisor::adapter::claude::{
    build_args, parse_line, permission_response, render_tool_content,
};
use agent_supervisor::approval::ApprovalDecision;
use agent_supervisor::models::event::EventPayload;
use agent_supervisor::models::session::PermissionMode;

/// The init line yields the resume reference, model, and tools.
#[test]
fn system_init_maps_to_session_init() {
    let line = r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"sonnet","tools":["Bash","Edit"]}"#;
    assert_eq!(
        parse_line(line),
        vec![EventPayload::SessionInit {
            session_ref: "abc-123".into(),
            model: Some("sonnet".into()),
            tools: vec!["Bash".into(), "Edit".into()],
        }]
    );
}

/// One assistant message with several blocks yields one payload per block.
#[test]
fn assistant_blocks_map_in_order() {
    let line = json!({
        "type": "assistant",
        "message": {"content": [
            {"type": "thinking", "thinking": "let me look"},
            {"type": "text", "text": "Reading the file."},
            {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/a.rs"}},
        ]}
    })
    .to_string();

    assert_eq!(
        parse_line(&line),
        vec![
            EventPayload::AgentThinking {
                text: "let me look".into()
            },
            EventPayload::AgentText {
                text: "Reading the file.".into()
            },
            EventPayload::AgentToolStart {
                tool_call_id: "toolu_1".into(),
                tool_name: "Read".into(),
                input: json!({"file_path": "/a.rs"}),
            },
        ]
    );
}

/// Tool results inside user messages become tool ends.
#[test]
fn user_tool_result_maps_to_tool_end() {
    let line = json!({
        "type": "user",
        "message": {"content": [
            {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "fn main() {}"}], "is_error": false},
            {"type": "text", "text": "ignored"},
        ]}
    })
    .to_string();

    assert_eq!(
        parse_line(&line),
        vec![EventPayload::AgentToolEnd {
            tool_call_id: "toolu_1".into(),
            content: "fn main() {}".into(),
            is_error: false,
        }]
    );
}

/// The result line carries cost, turns, and denials.
#[test]
fn result_maps_to_agent_result() {
    let line = json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": "done",
        "total_cost_usd": 0.25,
        "num_turns": 3,
        "duration_ms": 1200,
        "permission_denials": [{"tool_name": "Bash"}],
    })
    .to_string();

    let payloads = parse_line(&line);
    assert_eq!(payloads.len(), 1);
    let EventPayload::AgentResult {
        is_error,
        subtype,
        result,
        total_cost_usd,
        num_turns,
        duration_ms,
        permission_denials,
        ..
    } = &payloads[0]
    else {
        panic!("expected agent:result, got {:?}", payloads[0]);
    };
    assert!(!is_error);
    assert_eq!(subtype.as_deref(), Some("success"));
    assert_eq!(result.as_deref(), Some("done"));
    assert_eq!(*total_cost_usd, Some(0.25));
    assert_eq!(*num_turns, Some(3));
    assert_eq!(*duration_ms, Some(1200));
    assert_eq!(permission_denials.len(), 1);
}

/// Partial-message deltas map to the delta variants.
#[test]
fn stream_event_deltas_map() {
    let text = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#;
    let thinking = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"thinking_delta","thinking":"hmm"}}}"#;
    let other = r#"{"type":"stream_event","event":{"type":"message_start"}}"#;

    assert_eq!(
        parse_line(text),
        vec![EventPayload::AgentTextDelta { text: "Hel".into() }]
    );
    assert_eq!(
        parse_line(thinking),
        vec![EventPayload::AgentThinkingDelta { text: "hmm".into() }]
    );
    assert!(parse_line(other).is_empty());
}

/// Rate limit events keep the reset time.
#[test]
fn rate_limit_maps_with_reset() {
    let line = r#"{"type":"rate_limit_event","rate_limit_info":{"status":"rejected","resetsAt":1700000000}}"#;
    assert_eq!(
        parse_line(line),
        vec![EventPayload::SystemRateLimit {
            message: "rate limit: rejected".into(),
            resets_at: Some("1700000000".into()),
        }]
    );
}

/// Malformed and unknown lines map to nothing.
#[test]
fn malformed_lines_map_to_nothing() {
    assert!(parse_line("{not json").is_empty());
    assert!(parse_line(r#"{"type":"keep_alive"}"#).is_empty());
    assert!(parse_line("").is_empty());
}

/// Protocol flags follow the configured base arguments.
#[test]
fn build_args_appends_protocol_flags() {
    let args = build_args(
        &["--debug".to_owned()],
        PermissionMode::AcceptEdits,
        Some("abc"),
        Some("opus"),
    );

    assert_eq!(args[0], "--debug");
    let joined = args.join(" ");
    assert!(joined.contains("--input-format stream-json"));
    assert!(joined.contains("--output-format stream-json"));
    assert!(joined.contains("--permission-mode acceptEdits"));
    assert!(joined.ends_with("--resume abc --model opus"));
}

/// A fresh launch has no resume or model flags.
#[test]
fn build_args_without_resume() {
    let args = build_args(&[], PermissionMode::Default, None, None);
    assert!(!args.iter().any(|a| a == "--resume" || a == "--model"));
}

/// Allow echoes the original input unless the human replaced it.
#[test]
fn permission_response_shapes() {
    let input = json!({"command": "ls"});

    assert_eq!(
        permission_response(&ApprovalDecision::allow(), &input),
        json!({"behavior": "allow", "updatedInput": {"command": "ls"}})
    );
    assert_eq!(
        permission_response(
            &ApprovalDecision::Allow {
                updated_input: Some(json!({"command": "ls -la"})),
                remember: false
            },
            &input
        ),
        json!({"behavior": "allow", "updatedInput": {"command": "ls -la"}})
    );
    assert_eq!(
        permission_response(&ApprovalDecision::deny("no"), &input),
        json!({"behavior": "deny", "message": "no"})
    );
}

/// Block lists flatten to text; images become a marker.
#[test]
fn render_tool_content_flattens_blocks() {
    let content = json!([
        {"type": "text", "text": "line one"},
        {"type": "image", "source": {}},
    ]);
    assert_eq!(render_tool_content(&content), "line one\n[image]");
    assert_eq!(render_tool_content(&json!("plain")), "plain");
    assert_eq!(render_tool_content(&serde_json::Value::Null), "");
}
