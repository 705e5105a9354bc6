use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ServiceError;
use crate::normalizer::{EventKind, NormalizedEvent};
use crate::tools::ToolCall;

/// Receiving half of a normalized event stream.
pub type EventRx<E> = mpsc::Receiver<E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One entry of a conversation history, in the shape every provider adapter
/// translates from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant message that requested tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// The result of a tool call, linked back to the request by id.
    pub fn tool(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A piece of reply text headed for speech synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position within the reply; `None` plays immediately, out of band.
    pub index: Option<u32>,
    pub text: String,
}

impl TextChunk {
    pub fn indexed(index: u32, text: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            text: text.into(),
        }
    }

    pub fn immediate(text: impl Into<String>) -> Self {
        Self {
            index: None,
            text: text.into(),
        }
    }
}

/// Synthesized mu-law audio for one text chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub index: Option<u32>,
    pub payload: Vec<u8>,
    /// The text this frame speaks.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    ContentDelta(String),
    ToolCallRequest(ToolCall),
    TurnComplete,
    Error(ServiceError),
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Audio(AudioFrame),
    TurnComplete,
    Error(ServiceError),
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Interim text; the caller is speaking.
    Utterance(String),
    /// A finished user utterance.
    Final(String),
    Error(ServiceError),
    StreamClosed,
}

impl NormalizedEvent for LlmEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::ContentDelta(_) | Self::ToolCallRequest(_) => EventKind::Content,
            Self::TurnComplete => EventKind::TurnComplete,
            Self::Error(_) => EventKind::Error,
            Self::StreamClosed => EventKind::StreamClosed,
        }
    }

    fn stream_closed() -> Self {
        Self::StreamClosed
    }
}

impl NormalizedEvent for SpeechEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Audio(_) => EventKind::Content,
            Self::TurnComplete => EventKind::TurnComplete,
            Self::Error(_) => EventKind::Error,
            Self::StreamClosed => EventKind::StreamClosed,
        }
    }

    fn stream_closed() -> Self {
        Self::StreamClosed
    }
}

impl NormalizedEvent for TranscriptEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Utterance(_) => EventKind::Content,
            Self::Final(_) => EventKind::TurnComplete,
            Self::Error(_) => EventKind::Error,
            Self::StreamClosed => EventKind::StreamClosed,
        }
    }

    fn carries_content(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    fn stream_closed() -> Self {
        Self::StreamClosed
    }
}
