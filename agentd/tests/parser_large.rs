//! Memory-bounded decoding of oversized assistant output.

use std::io::Cursor;

use agentd::output::preprocess::MAX_TEXT_FIELD_BYTES;
use agentd::output::{ParsedMessage, parse_file, parse_reader};

fn huge_tool_result_line(bytes: usize) -> String {
    let content = "x".repeat(bytes);
    format!(
        r#"{{"type":"user","session_id":"sess-big","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"t1","content":"{content}"}}]}}}}"#
    )
}

#[test]
fn six_megabyte_line_then_result_yields_two_messages() {
    let mut stream = huge_tool_result_line(6 * 1024 * 1024);
    stream.push('\n');
    stream.push_str(r#"{"type":"result","subtype":"success","is_error":false,"session_id":"sess-big","num_turns":3}"#);
    stream.push('\n');

    let transcript = parse_reader(Cursor::new(stream.into_bytes())).expect("parse");
    assert_eq!(transcript.len(), 2);
    assert!(matches!(transcript.messages()[0], ParsedMessage::User(_)));
    let result = transcript.result().expect("result");
    assert_eq!(result.num_turns, Some(3));
    assert!(!result.is_error);
    assert_eq!(transcript.session_id(), Some("sess-big"));
}

#[test]
fn oversized_file_on_disk_parses_with_garbage_interleaved() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("turn.jsonl");
    let lines = [
        r#"{"type":"system","subtype":"init","session_id":"s1","model":"m"}"#.to_string(),
        huge_tool_result_line(MAX_TEXT_FIELD_BYTES * 4),
        "not json at all".to_string(),
        String::new(),
        r#"{"type":"assistant","session_id":"s1","message":{"content":[{"type":"text","text":"done"}]}}"#
            .to_string(),
    ];
    std::fs::write(&path, lines.join("\n")).expect("write");

    let transcript = parse_file(&path).expect("parse");
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript.unknown_count(), 1);
    assert_eq!(transcript.final_text(), Some("done"));
}

#[test]
fn block_form_tool_result_is_bounded() {
    let content = "y".repeat(6 * 1024 * 1024);
    let line = format!(
        r#"{{"type":"user","session_id":"s","message":{{"content":[{{"type":"tool_result","tool_use_id":"t1","content":[{{"type":"text","text":"{content}"}}]}}]}}}}"#
    );

    let transcript = parse_reader(Cursor::new(line.into_bytes())).expect("parse");
    match &transcript.messages()[0] {
        ParsedMessage::User(m) => {
            assert!(m.text.len() <= MAX_TEXT_FIELD_BYTES + 64, "{}", m.text.len());
            assert!(m.text.ends_with("[truncated: original 6291456 bytes]"));
        }
        other => panic!("unexpected {other:?}"),
    }
}
