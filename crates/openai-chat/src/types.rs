//! Wire types for the chat completions and Assistants endpoints.

use serde::{Deserialize, Serialize};

/// `POST /chat/completions` body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    model: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    include_usage: bool,
}

impl ChatRequest {
    /// A streaming request that also reports token usage in its last chunk.
    pub fn new(model: &str, messages: Vec<RequestMessage>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            tools: Vec::new(),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[RequestMessage] {
        &self.messages
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<RequestToolCall>,
}

impl RequestMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl RequestToolCall {
    pub fn function(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Tool {
    #[serde(rename = "function")]
    Function { function: FunctionDefinition },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One `data:` payload of a streamed completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
}

/// A fragment of a tool call; fragments sharing an `index` belong together.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// --- Assistants ---

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateRun<'a> {
    pub assistant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<&'a str>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubmitToolOutputs {
    pub tool_outputs: Vec<ToolOutput>,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// A run's id and lifecycle status, as returned by the run endpoints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunStatus {
    pub id: String,
    pub status: String,
}

impl RunStatus {
    /// Whether the run still blocks new messages on its thread.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status.as_str(),
            "queued" | "in_progress" | "requires_action" | "cancelling"
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Run {
    id: String,
    #[serde(default)]
    required_action: Option<RequiredAction>,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Clone, Deserialize)]
struct RequiredAction {
    submit_tool_outputs: RequiredToolOutputs,
}

#[derive(Debug, Clone, Deserialize)]
struct RequiredToolOutputs {
    tool_calls: Vec<RequestToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
struct RunError {
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    content: Vec<MessageDeltaContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageDeltaContent {
    #[serde(default)]
    text: Option<DeltaText>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeltaText {
    #[serde(default)]
    value: String,
}

/// The run events the voice pipeline cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantStreamEvent {
    RunCreated { run_id: String },
    MessageDelta { text: String },
    RequiresAction { run_id: String, tool_calls: Vec<RequestToolCall> },
    RunCompleted { run_id: String },
    RunFailed { message: String },
    Error { message: String },
    Other(String),
}

impl AssistantStreamEvent {
    /// Interprets one server-sent event of a run stream.
    pub fn parse(event: &str, data: &str) -> Result<Self, serde_json::Error> {
        Ok(match event {
            "thread.run.created" => {
                let run: Run = serde_json::from_str(data)?;
                Self::RunCreated { run_id: run.id }
            }
            "thread.message.delta" => {
                let delta: MessageDelta = serde_json::from_str(data)?;
                let text = delta
                    .delta
                    .content
                    .into_iter()
                    .filter_map(|c| c.text.map(|t| t.value))
                    .collect();
                Self::MessageDelta { text }
            }
            "thread.run.requires_action" => {
                let run: Run = serde_json::from_str(data)?;
                let tool_calls = run
                    .required_action
                    .map(|a| a.submit_tool_outputs.tool_calls)
                    .unwrap_or_default();
                Self::RequiresAction {
                    run_id: run.id,
                    tool_calls,
                }
            }
            "thread.run.completed" => {
                let run: Run = serde_json::from_str(data)?;
                Self::RunCompleted { run_id: run.id }
            }
            "thread.run.failed" | "thread.run.expired" | "thread.run.cancelled" => {
                let run: Run = serde_json::from_str(data)?;
                let message = run
                    .last_error
                    .map(|e| e.message)
                    .unwrap_or_else(|| event.trim_start_matches("thread.run.").to_string());
                Self::RunFailed { message }
            }
            "error" => {
                let message = serde_json::from_str::<serde_json::Value>(data)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .unwrap_or_else(|| data.to_string());
                Self::Error { message }
            }
            other => Self::Other(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_tools_with_type_tag() {
        let request = ChatRequest::new("gpt-4o", vec![RequestMessage::new("user", "hi")])
            .with_tools(vec![Tool::Function {
                function: FunctionDefinition {
                    name: "end_call".into(),
                    description: "Hang up".into(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                },
            }]);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "end_call");
        assert_eq!(json["messages"][0], serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn cancelled_runs_no_longer_block_the_thread() {
        let cancelling: RunStatus =
            serde_json::from_str(r#"{"id":"run_1","object":"thread.run","status":"cancelling"}"#)
                .unwrap();
        assert!(cancelling.is_active());

        let cancelled = RunStatus {
            status: "cancelled".into(),
            ..cancelling
        };
        assert!(!cancelled.is_active());
    }

    #[test]
    fn tool_call_fragments_deserialize() {
        let data = r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"end_call","arguments":""}}]},"finish_reason":null}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(data).unwrap();
        let call = &chunk.choices[0].delta.tool_calls[0];
        assert_eq!(call.id.as_deref(), Some("call_1"));
        assert_eq!(call.function.as_ref().and_then(|f| f.name.as_deref()), Some("end_call"));
    }

    #[test]
    fn usage_only_chunk_has_no_choices() {
        let data = r#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn parses_run_stream_events() {
        let delta = AssistantStreamEvent::parse(
            "thread.message.delta",
            r#"{"id":"msg_1","delta":{"content":[{"index":0,"type":"text","text":{"value":"Hel"}},{"index":1,"type":"text","text":{"value":"lo"}}]}}"#,
        )
        .unwrap();
        assert_eq!(delta, AssistantStreamEvent::MessageDelta { text: "Hello".into() });

        let action = AssistantStreamEvent::parse(
            "thread.run.requires_action",
            r#"{"id":"run_1","required_action":{"type":"submit_tool_outputs","submit_tool_outputs":{"tool_calls":[{"id":"call_1","type":"function","function":{"name":"end_call","arguments":"{}"}}]}}}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            AssistantStreamEvent::RequiresAction {
                run_id: "run_1".into(),
                tool_calls: vec![RequestToolCall::function("call_1", "end_call", "{}")],
            }
        );

        let failed = AssistantStreamEvent::parse(
            "thread.run.failed",
            r#"{"id":"run_1","last_error":{"code":"rate_limit_exceeded","message":"Too many requests"}}"#,
        )
        .unwrap();
        assert_eq!(failed, AssistantStreamEvent::RunFailed { message: "Too many requests".into() });

        assert_eq!(
            AssistantStreamEvent::parse("thread.run.step.created", "{}").unwrap(),
            AssistantStreamEvent::Other("thread.run.step.created".into())
        );
    }
}
