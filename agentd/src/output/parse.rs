//! Line-oriented decoding of Claude and Codex JSON streams.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::output::message::{
    AssistantMessage, LifecycleEvent, LifecycleKind, ParsedMessage, PlanRequest, ResultMessage,
    SystemMessage, ToolUse, UnknownMessage, UserMessage,
};
use crate::output::preprocess::limit_line;

const PLAN_TOOL: &str = "ExitPlanMode";
const EXCERPT_BYTES: usize = 256;

static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""type"\s*:\s*"([^"\\]{1,64})""#).expect("type salvage pattern is valid")
});

static SESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:session_id|thread_id)"\s*:\s*"([^"\\]{1,128})""#)
        .expect("session salvage pattern is valid")
});

/// Ordered messages of one assistant run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    messages: Vec<ParsedMessage>,
}

impl Transcript {
    pub fn messages(&self) -> &[ParsedMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text of the last assistant message that has any.
    pub fn final_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|msg| match msg {
            ParsedMessage::Assistant(m) if !m.text.trim().is_empty() => Some(m.text.as_str()),
            ParsedMessage::PlanRequest(m) if !m.text.trim().is_empty() => Some(m.text.as_str()),
            _ => None,
        })
    }

    /// First result message.
    pub fn result(&self) -> Option<&ResultMessage> {
        self.messages.iter().find_map(|msg| match msg {
            ParsedMessage::Result(m) => Some(m),
            _ => None,
        })
    }

    /// Id from the session-opening message, else the first id seen anywhere.
    pub fn session_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .filter(|msg| msg.starts_session())
            .find_map(ParsedMessage::session_id)
            .or_else(|| self.messages.iter().find_map(ParsedMessage::session_id))
    }

    pub fn plan_request(&self) -> Option<&PlanRequest> {
        self.messages.iter().find_map(|msg| match msg {
            ParsedMessage::PlanRequest(m) => Some(m),
            _ => None,
        })
    }

    pub fn unknown_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|msg| matches!(msg, ParsedMessage::Unknown(_)))
            .count()
    }
}

/// Streaming decoder. Remembers the Codex thread id so that later turn and
/// item events, which do not repeat it, are attributed to the thread.
#[derive(Debug, Default)]
pub struct StreamParser {
    thread_id: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line. Blank lines yield `None`.
    pub fn parse_line(&mut self, raw: &[u8]) -> Option<ParsedMessage> {
        let trimmed = raw.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        let line = limit_line(trimmed);
        Some(self.decode(&line))
    }

    fn decode(&mut self, line: &[u8]) -> ParsedMessage {
        #[derive(Deserialize)]
        struct Tag {
            #[serde(rename = "type")]
            kind: Option<String>,
        }

        let tag = match serde_json::from_slice::<Tag>(line) {
            Ok(Tag { kind: Some(kind) }) => kind,
            Ok(Tag { kind: None }) => return unknown(line, "missing type".to_string()),
            Err(err) => return unknown(line, format!("invalid json: {err}")),
        };

        let decoded = match tag.as_str() {
            "assistant" => decode_assistant(line),
            "user" => decode_user(line),
            "system" => decode_system(line),
            "result" => decode_result(line),
            other => match LifecycleKind::from_type_tag(other) {
                Some(kind) => self.decode_lifecycle(line, kind),
                None => return unknown(line, format!("unrecognized type {other}")),
            },
        };
        decoded.unwrap_or_else(|err| unknown(line, format!("malformed {tag}: {err}")))
    }

    fn decode_lifecycle(
        &mut self,
        line: &[u8],
        kind: LifecycleKind,
    ) -> Result<ParsedMessage, serde_json::Error> {
        let raw: RawLifecycle = serde_json::from_slice(line)?;
        if let Some(id) = &raw.thread_id {
            self.thread_id = Some(id.clone());
        }
        let session_id = raw.thread_id.or_else(|| self.thread_id.clone());

        if let Some(item) = &raw.item
            && kind == LifecycleKind::ItemCompleted
            && item.kind.as_deref() == Some("agent_message")
        {
            return Ok(ParsedMessage::Assistant(AssistantMessage {
                session_id,
                type_tag: kind.type_tag().to_string(),
                text: item.text.clone().unwrap_or_default(),
                tool_uses: Vec::new(),
            }));
        }

        let detail = match kind {
            LifecycleKind::ItemStarted
            | LifecycleKind::ItemUpdated
            | LifecycleKind::ItemCompleted => {
                raw.item.and_then(|item| item.kind)
            }
            LifecycleKind::TurnFailed | LifecycleKind::Error => raw
                .message
                .or_else(|| raw.error.and_then(|e| error_text(&e))),
            _ => None,
        };
        Ok(ParsedMessage::Lifecycle(LifecycleEvent {
            session_id,
            kind,
            detail,
        }))
    }
}

/// Decode every line of `reader`. Only read failures are errors; undecodable
/// lines become [`ParsedMessage::Unknown`].
pub fn parse_reader<R: BufRead>(mut reader: R) -> Result<Transcript> {
    let mut parser = StreamParser::new();
    let mut messages = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .context("read assistant output")?;
        if n == 0 {
            break;
        }
        if let Some(msg) = parser.parse_line(&line) {
            messages.push(msg);
        }
    }
    Ok(Transcript { messages })
}

#[instrument(skip_all, fields(path = %path.display()))]
pub fn parse_file(path: &Path) -> Result<Transcript> {
    let file = File::open(path).with_context(|| format!("open transcript {}", path.display()))?;
    let transcript = parse_reader(BufReader::new(file))
        .with_context(|| format!("parse transcript {}", path.display()))?;
    debug!(
        messages = transcript.len(),
        unknown = transcript.unknown_count(),
        "transcript parsed"
    );
    Ok(transcript)
}

pub fn parse_str(text: &str) -> Transcript {
    let mut parser = StreamParser::new();
    Transcript {
        messages: text
            .lines()
            .filter_map(|line| parser.parse_line(line.as_bytes()))
            .collect(),
    }
}

fn unknown(line: &[u8], reason: String) -> ParsedMessage {
    let capture = |re: &Regex| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
    };
    let excerpt_len = line.len().min(EXCERPT_BYTES);
    debug!(reason = %reason, "undecodable output line");
    ParsedMessage::Unknown(UnknownMessage {
        session_id: capture(&SESSION_RE),
        type_tag: capture(&TYPE_RE).unwrap_or_default(),
        reason,
        excerpt: String::from_utf8_lossy(&line[..excerpt_len]).into_owned(),
    })
}

#[derive(Deserialize)]
struct RawAssistant {
    message: RawBody,
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct RawBody {
    #[serde(default)]
    content: RawContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for RawContent {
    fn default() -> Self {
        RawContent::Blocks(Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

fn decode_assistant(line: &[u8]) -> Result<ParsedMessage, serde_json::Error> {
    let raw: RawAssistant = serde_json::from_slice(line)?;
    let blocks = match raw.message.content {
        RawContent::Text(text) => vec![ContentBlock::Text { text }],
        RawContent::Blocks(blocks) => blocks,
    };

    let mut texts = Vec::new();
    let mut tool_uses = Vec::new();
    let mut plan = None;
    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                if name == PLAN_TOOL {
                    plan = Some(plan_text(&input));
                }
                tool_uses.push(ToolUse { id, name });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }
    let text = texts.join("\n");

    Ok(match plan {
        Some(plan) => ParsedMessage::PlanRequest(PlanRequest {
            session_id: raw.session_id,
            type_tag: "assistant".to_string(),
            plan,
            text,
        }),
        None => ParsedMessage::Assistant(AssistantMessage {
            session_id: raw.session_id,
            type_tag: "assistant".to_string(),
            text,
            tool_uses,
        }),
    })
}

fn plan_text(input: &Value) -> String {
    match input.get("plan") {
        Some(Value::String(plan)) => plan.clone(),
        _ => input.to_string(),
    }
}

#[derive(Deserialize)]
struct RawUser {
    #[serde(default)]
    message: Option<RawBody>,
    session_id: Option<String>,
}

fn decode_user(line: &[u8]) -> Result<ParsedMessage, serde_json::Error> {
    let raw: RawUser = serde_json::from_slice(line)?;
    let text = match raw.message.map(|m| m.content) {
        Some(RawContent::Text(text)) => text,
        Some(RawContent::Blocks(blocks)) => blocks
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::ToolResult { content } => Some(value_text(&content)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    };
    Ok(ParsedMessage::User(UserMessage {
        session_id: raw.session_id,
        text,
    }))
}

/// Tool results are either a string or a list of `{type: text, text}` blocks.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct RawSystem {
    session_id: Option<String>,
    subtype: Option<String>,
    model: Option<String>,
    cwd: Option<String>,
}

fn decode_system(line: &[u8]) -> Result<ParsedMessage, serde_json::Error> {
    let raw: RawSystem = serde_json::from_slice(line)?;
    Ok(ParsedMessage::System(SystemMessage {
        session_id: raw.session_id,
        subtype: raw.subtype,
        model: raw.model,
        cwd: raw.cwd,
    }))
}

#[derive(Deserialize)]
struct RawResult {
    session_id: Option<String>,
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
}

fn decode_result(line: &[u8]) -> Result<ParsedMessage, serde_json::Error> {
    let raw: RawResult = serde_json::from_slice(line)?;
    Ok(ParsedMessage::Result(ResultMessage {
        session_id: raw.session_id,
        subtype: raw.subtype,
        is_error: raw.is_error,
        result: raw.result,
        total_cost_usd: raw.total_cost_usd,
        duration_ms: raw.duration_ms,
        num_turns: raw.num_turns,
    }))
}

#[derive(Deserialize)]
struct RawLifecycle {
    thread_id: Option<String>,
    item: Option<RawItem>,
    message: Option<String>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct RawItem {
    #[serde(rename = "type", alias = "item_type")]
    kind: Option<String>,
    text: Option<String>,
}

fn error_text(error: &Value) -> Option<String> {
    match error {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    const CLAUDE_RUN: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"claude","cwd":"/w"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the code."}]},"session_id":"sess-1"}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"file contents"}]},"session_id":"sess-1"}

{"type":"assistant","message":{"content":[{"type":"text","text":"Done, fixed it."},{"type":"tool_use","id":"t2","name":"Bash","input":{"command":"ls"}}]},"session_id":"sess-1"}
{"type":"result","subtype":"success","is_error":false,"result":"Done, fixed it.","total_cost_usd":0.12,"duration_ms":4200,"num_turns":3,"session_id":"sess-1"}
"#;

    #[test]
    fn decodes_a_claude_run() {
        let transcript = parse_str(CLAUDE_RUN);
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript.session_id(), Some("sess-1"));
        assert_eq!(transcript.final_text(), Some("Done, fixed it."));

        let result = transcript.result().expect("result");
        assert!(!result.is_error);
        assert_eq!(result.num_turns, Some(3));
        assert_eq!(result.duration_ms, Some(4200));

        match &transcript.messages()[2] {
            ParsedMessage::User(m) => assert_eq!(m.text, "file contents"),
            other => panic!("unexpected {other:?}"),
        }
        match &transcript.messages()[3] {
            ParsedMessage::Assistant(m) => assert_eq!(m.tool_uses[0].name, "Bash"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_plan_mode_becomes_plan_request() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Here is my plan"},{"type":"tool_use","id":"p","name":"ExitPlanMode","input":{"plan":"1. edit\n2. test"}}]},"session_id":"s"}"#;
        let transcript = parse_str(line);
        let plan = transcript.plan_request().expect("plan");
        assert_eq!(plan.plan, "1. edit\n2. test");
        assert_eq!(plan.text, "Here is my plan");
        assert_eq!(transcript.messages()[0].type_tag(), "assistant");
    }

    #[test]
    fn decodes_a_codex_run() {
        let run = r#"{"type":"thread.started","thread_id":"th-9"}
{"type":"turn.started"}
{"type":"item.started","item":{"id":"i0","type":"command_execution","command":"ls","aggregated_output":""}}
{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"All tests pass."}}
{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":5}}
"#;
        let transcript = parse_str(run);
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript.session_id(), Some("th-9"));
        assert_eq!(transcript.final_text(), Some("All tests pass."));
        assert!(transcript.messages().iter().all(|m| m.session_id() == Some("th-9")));
        match &transcript.messages()[2] {
            ParsedMessage::Lifecycle(e) => {
                assert_eq!(e.kind, LifecycleKind::ItemStarted);
                assert_eq!(e.detail.as_deref(), Some("command_execution"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn codex_failures_carry_their_message() {
        let run = r#"{"type":"turn.failed","error":{"message":"rate limited"}}
{"type":"error","message":"stream disconnected"}"#;
        let transcript = parse_str(run);
        let details: Vec<_> = transcript
            .messages()
            .iter()
            .map(|m| match m {
                ParsedMessage::Lifecycle(e) => e.detail.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(
            details,
            [Some("rate limited".to_string()), Some("stream disconnected".to_string())]
        );
    }

    #[test]
    fn invalid_lines_become_unknown_and_parsing_continues() {
        let run = "{\"type\":\"assistant\",\"session_id\":\"s-2\",\"message\":{\"content\":[oops\n\
                   not json at all\n\
                   {\"type\":\"mystery\",\"session_id\":\"s-2\"}\n\
                   {\"no_type\":1}\n\
                   {\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false}\n";
        let transcript = parse_str(run);
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript.unknown_count(), 4);

        match &transcript.messages()[0] {
            ParsedMessage::Unknown(m) => {
                assert_eq!(m.type_tag, "assistant");
                assert_eq!(m.session_id.as_deref(), Some("s-2"));
                assert!(m.reason.starts_with("invalid json"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transcript.messages()[2].type_tag(), "mystery");
        assert!(transcript.result().is_some());
    }

    #[test]
    fn well_formed_json_with_wrong_shape_is_unknown() {
        let transcript = parse_str(r#"{"type":"assistant","message":"not an object"}"#);
        match &transcript.messages()[0] {
            ParsedMessage::Unknown(m) => assert!(m.reason.starts_with("malformed assistant")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn six_megabyte_line_stays_bounded() {
        let big = "x".repeat(6 * 1024 * 1024);
        let input = format!(
            "{{\"type\":\"user\",\"message\":{{\"content\":[{{\"type\":\"tool_result\",\"content\":\"{big}\"}}]}},\"session_id\":\"s\"}}\n{{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"s\"}}\n"
        );
        let transcript = parse_reader(Cursor::new(input.into_bytes())).expect("parse");
        assert_eq!(transcript.len(), 2);
        match &transcript.messages()[0] {
            ParsedMessage::User(m) => {
                assert!(m.text.len() < 200 * 1024);
                assert!(m.text.contains("[truncated: original 6291456 bytes]"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn crlf_and_missing_final_newline_are_handled() {
        let input = "{\"type\":\"turn.started\"}\r\n{\"type\":\"turn.completed\"}";
        let transcript = parse_reader(Cursor::new(input)).expect("parse");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.unknown_count(), 0);
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk gone"))
        }
    }

    #[test]
    fn read_errors_are_errors() {
        let err = parse_reader(BufReader::new(FailingReader)).unwrap_err();
        assert!(format!("{err:#}").contains("disk gone"));
    }
}
