//! Per-run log files.

use chrono::Utc;

use agent_supervisor::logsink::{FileLogSinkFactory, LogSinkFactory, StreamTag};
use agent_supervisor::models::event::{Event, EventPayload};

/// Each line is tagged; stats count bytes and lines written.
#[test]
fn writes_tagged_lines_and_counts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = FileLogSinkFactory::new(dir.path().to_path_buf());
    let (mut sink, location) = factory.open("sess-1").expect("open log");

    assert!(location.contains("sess-1"));
    assert!(location.ends_with(".log"));

    sink.write(StreamTag::Stdout, "first\nsecond").expect("stdout");
    sink.write(StreamTag::Stderr, "oops").expect("stderr");
    sink.write(StreamTag::User, "hello").expect("user");
    let stats = sink.close().expect("close");

    let contents = std::fs::read_to_string(&location).expect("read log");
    assert_eq!(
        contents,
        "[stdout] first\n[stdout] second\n[stderr] oops\n[user] hello\n"
    );
    assert_eq!(stats.line_count, 4);
    assert_eq!(stats.byte_size, contents.len() as u64);
}

/// Events are mirrored under the system tag with seq and type.
#[test]
fn events_are_mirrored_with_seq_and_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = FileLogSinkFactory::new(dir.path().to_path_buf());
    let (mut sink, location) = factory.open("sess-2").expect("open log");

    let event = Event {
        seq: 7,
        timestamp: Utc::now(),
        payload: EventPayload::AgentText { text: "hi".into() },
    };
    sink.write_event(&event).expect("write event");
    sink.close().expect("close");

    let contents = std::fs::read_to_string(&location).expect("read log");
    assert!(contents.starts_with("[system] [7|agent:text] {"), "{contents}");
    assert!(contents.contains("\"text\":\"hi\""));
}

/// Writes after close are ignored and close is repeatable.
#[test]
fn writes_after_close_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = FileLogSinkFactory::new(dir.path().to_path_buf());
    let (mut sink, _location) = factory.open("sess-3").expect("open log");

    sink.write(StreamTag::System, "before").expect("write");
    let first = sink.close().expect("close");
    sink.write(StreamTag::System, "after").expect("ignored write");
    let second = sink.close().expect("second close");

    assert_eq!(first, second);
    assert_eq!(first.line_count, 1);
}
