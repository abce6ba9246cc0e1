//! Typed messages decoded from assistant output streams.

use serde::Serialize;

/// One decoded line of assistant output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedMessage {
    Assistant(AssistantMessage),
    /// The assistant finished planning and asks to leave plan mode.
    PlanRequest(PlanRequest),
    User(UserMessage),
    System(SystemMessage),
    Result(ResultMessage),
    /// Codex thread/turn/item lifecycle events and stream errors.
    Lifecycle(LifecycleEvent),
    /// Anything that could not be decoded into one of the above.
    Unknown(UnknownMessage),
}

impl ParsedMessage {
    /// The `type` tag of the source line (empty when none was recoverable).
    pub fn type_tag(&self) -> &str {
        match self {
            ParsedMessage::Assistant(m) => &m.type_tag,
            ParsedMessage::PlanRequest(m) => &m.type_tag,
            ParsedMessage::User(_) => "user",
            ParsedMessage::System(_) => "system",
            ParsedMessage::Result(_) => "result",
            ParsedMessage::Lifecycle(m) => m.kind.type_tag(),
            ParsedMessage::Unknown(m) => &m.type_tag,
        }
    }

    /// Session (Claude) or thread (Codex) id, when known.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ParsedMessage::Assistant(m) => m.session_id.as_deref(),
            ParsedMessage::PlanRequest(m) => m.session_id.as_deref(),
            ParsedMessage::User(m) => m.session_id.as_deref(),
            ParsedMessage::System(m) => m.session_id.as_deref(),
            ParsedMessage::Result(m) => m.session_id.as_deref(),
            ParsedMessage::Lifecycle(m) => m.session_id.as_deref(),
            ParsedMessage::Unknown(m) => m.session_id.as_deref(),
        }
    }

    /// True for messages that open a session (system init, thread start).
    pub fn starts_session(&self) -> bool {
        match self {
            ParsedMessage::System(m) => m.subtype.as_deref() == Some("init"),
            ParsedMessage::Lifecycle(m) => m.kind == LifecycleKind::ThreadStarted,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantMessage {
    pub session_id: Option<String>,
    /// `assistant`, or `item.completed` for Codex agent messages.
    pub type_tag: String,
    /// Concatenated text blocks.
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRequest {
    pub session_id: Option<String>,
    pub type_tag: String,
    pub plan: String,
    /// Text the assistant wrote alongside the request.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMessage {
    pub session_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMessage {
    pub session_id: Option<String>,
    pub subtype: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMessage {
    pub session_id: Option<String>,
    pub subtype: Option<String>,
    pub is_error: bool,
    pub result: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    ThreadStarted,
    TurnStarted,
    TurnCompleted,
    TurnFailed,
    ItemStarted,
    ItemUpdated,
    ItemCompleted,
    Error,
}

impl LifecycleKind {
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "thread.started" => LifecycleKind::ThreadStarted,
            "turn.started" => LifecycleKind::TurnStarted,
            "turn.completed" => LifecycleKind::TurnCompleted,
            "turn.failed" => LifecycleKind::TurnFailed,
            "item.started" => LifecycleKind::ItemStarted,
            "item.updated" => LifecycleKind::ItemUpdated,
            "item.completed" => LifecycleKind::ItemCompleted,
            "error" => LifecycleKind::Error,
            _ => return None,
        })
    }

    pub fn type_tag(self) -> &'static str {
        match self {
            LifecycleKind::ThreadStarted => "thread.started",
            LifecycleKind::TurnStarted => "turn.started",
            LifecycleKind::TurnCompleted => "turn.completed",
            LifecycleKind::TurnFailed => "turn.failed",
            LifecycleKind::ItemStarted => "item.started",
            LifecycleKind::ItemUpdated => "item.updated",
            LifecycleKind::ItemCompleted => "item.completed",
            LifecycleKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub session_id: Option<String>,
    pub kind: LifecycleKind,
    /// Item type for `item.*`, error text for failures.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownMessage {
    pub session_id: Option<String>,
    pub type_tag: String,
    /// Why decoding failed, for diagnostics.
    pub reason: String,
    /// Leading bytes of the line.
    pub excerpt: String,
}
