use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use openai_chat::ChatApi;
use openai_chat::types::{
    ChatCompletionChunk, ChatRequest, FunctionDefinition, RequestMessage, RequestToolCall, Tool,
};
use voxline_core::error::ServiceError;
use voxline_core::generic_types::{ChatMessage, EventRx, LlmEvent};
use voxline_core::llm_api::LlmService;
use voxline_core::normalizer::{EventHandler, spawn_normalizer};
use voxline_core::tools::{ToolCall, ToolDefinition};

use super::failed_stream;

const PROVIDER: &str = "openai";

/// Chat completions behind [`LlmService`].
///
/// Generic over [`ChatApi`] so the HTTP client can be mocked in tests.
pub struct OpenAiChat<C: ChatApi> {
    client: Arc<C>,
    model: String,
}

impl<C: ChatApi> OpenAiChat<C> {
    pub fn new(client: C, model: &str) -> Self {
        Self {
            client: Arc::new(client),
            model: model.to_string(),
        }
    }
}

pub(crate) fn service_error(error: openai_chat::Error) -> ServiceError {
    match error {
        openai_chat::Error::RateLimited(body) => ServiceError::rate_limited(PROVIDER, body),
        other => ServiceError::connection(PROVIDER, other),
    }
}

pub(crate) fn to_request_message(message: &ChatMessage) -> RequestMessage {
    let mut request = RequestMessage::new(message.role.as_str(), &message.content);
    if message.content.is_empty() && !message.tool_calls.is_empty() {
        request.content = None;
    }
    request.name = message.name.clone();
    request.tool_call_id = message.tool_call_id.clone();
    request.tool_calls = message
        .tool_calls
        .iter()
        .map(|call| RequestToolCall::function(&call.id, &call.name, &call.arguments))
        .collect();
    request
}

fn to_tool(definition: &ToolDefinition) -> Tool {
    Tool::Function {
        function: FunctionDefinition {
            name: definition.name.clone(),
            description: definition.description.clone(),
            parameters: definition.parameters.clone(),
        },
    }
}

#[async_trait]
impl<C: ChatApi + 'static> LlmService for OpenAiChat<C> {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn stream_turn(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<EventRx<LlmEvent>, ServiceError> {
        let request = ChatRequest::new(
            &self.model,
            history.iter().map(to_request_message).collect(),
        )
        .with_tools(tools.iter().map(to_tool).collect());

        match self.client.chat_stream(request).await {
            Ok(chunks) => Ok(spawn_normalizer(ChunkEvents::default(), chunks)),
            Err(e) => {
                tracing::error!("chat completion request failed: {}", e);
                Ok(failed_stream(LlmEvent::Error(service_error(e))))
            }
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns completion chunks into LLM events, assembling tool calls that are
/// streamed in fragments keyed by their index.
#[derive(Default)]
struct ChunkEvents {
    calls: BTreeMap<u32, PartialCall>,
}

impl ChunkEvents {
    fn take_calls(&mut self) -> Vec<LlmEvent> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| {
                LlmEvent::ToolCallRequest(ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect()
    }
}

impl EventHandler for ChunkEvents {
    type Raw = Result<ChatCompletionChunk, openai_chat::Error>;
    type Event = LlmEvent;

    fn on_event(&mut self, raw: Self::Raw) -> Vec<LlmEvent> {
        let chunk = match raw {
            Ok(chunk) => chunk,
            Err(e) => return vec![LlmEvent::Error(service_error(e))],
        };

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(LlmEvent::ContentDelta(content));
            }
            for fragment in choice.delta.tool_calls {
                let call = self.calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    call.id.push_str(&id);
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
            match choice.finish_reason.as_deref() {
                Some("tool_calls") => events.extend(self.take_calls()),
                Some("stop") | Some("length") => events.push(LlmEvent::TurnComplete),
                Some(other) => tracing::debug!("unhandled finish reason: {}", other),
                None => {}
            }
        }
        events
    }

    fn on_end(&mut self) -> Vec<LlmEvent> {
        if !self.calls.is_empty() {
            tracing::warn!("stream ended with unfinished tool calls, emitting them as-is");
        }
        self.take_calls()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use openai_chat::ChunkRx;
    use serde_json::json;
    use tokio::sync::mpsc;

    mock! {
        pub Chat {}
        #[async_trait]
        impl ChatApi for Chat {
            async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkRx, openai_chat::Error>;
        }
    }

    fn chunk(value: serde_json::Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    fn chunks(values: Vec<serde_json::Value>) -> ChunkRx {
        let (tx, rx) = mpsc::channel(values.len() + 1);
        for value in values {
            tx.try_send(Ok(chunk(value))).unwrap();
        }
        rx
    }

    async fn collect(mut rx: EventRx<LlmEvent>) -> Vec<LlmEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn definition() -> ToolDefinition {
        ToolDefinition {
            name: "end_call".into(),
            description: "End the call".into(),
            parameters: json!({"type": "object", "properties": {}}),
            say: Some("Goodbye.".into()),
        }
    }

    #[tokio::test]
    async fn text_deltas_complete_the_turn() {
        let mut client = MockChat::new();
        client
            .expect_chat_stream()
            .withf(|req| req.model() == "gpt-4o" && req.messages().len() == 2 && req.tools().len() == 1)
            .returning(|_| {
                Ok(chunks(vec![
                    json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
                    json!({"choices": [{"index": 0, "delta": {"content": "Hi "}}]}),
                    json!({"choices": [{"index": 0, "delta": {"content": "there."}}]}),
                    json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
                ]))
            });

        let llm = OpenAiChat::new(client, "gpt-4o");
        let history = [ChatMessage::system("Be brief."), ChatMessage::user("Hello")];
        let rx = llm.stream_turn(&history, &[definition()]).await.unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                LlmEvent::ContentDelta("Hi ".into()),
                LlmEvent::ContentDelta("there.".into()),
                LlmEvent::TurnComplete,
                LlmEvent::StreamClosed,
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_fragments_are_assembled_by_index() {
        let mut client = MockChat::new();
        client.expect_chat_stream().returning(|_| {
            Ok(chunks(vec![
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "function": {"name": "get_current_weather", "arguments": ""}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"location\":"}},
                    {"index": 1, "id": "call_2", "function": {"name": "end_call", "arguments": "{}"}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "\"Paris\"}"}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
            ]))
        });

        let llm = OpenAiChat::new(client, "gpt-4o");
        let rx = llm.stream_turn(&[ChatMessage::user("Weather?")], &[]).await.unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                LlmEvent::ToolCallRequest(ToolCall {
                    id: "call_1".into(),
                    name: "get_current_weather".into(),
                    arguments: "{\"location\":\"Paris\"}".into(),
                }),
                LlmEvent::ToolCallRequest(ToolCall {
                    id: "call_2".into(),
                    name: "end_call".into(),
                    arguments: "{}".into(),
                }),
                LlmEvent::StreamClosed,
            ]
        );
    }

    #[tokio::test]
    async fn rate_limit_is_reported_on_the_stream() {
        let mut client = MockChat::new();
        client
            .expect_chat_stream()
            .returning(|_| Err(openai_chat::Error::RateLimited("slow down".into())));

        let llm = OpenAiChat::new(client, "gpt-4o");
        let rx = llm.stream_turn(&[ChatMessage::user("Hi")], &[]).await.unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                LlmEvent::Error(ServiceError::rate_limited("openai", "slow down")),
                LlmEvent::StreamClosed,
            ]
        );
    }

    #[test]
    fn tool_history_maps_to_request_messages() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "end_call".into(),
            arguments: "{}".into(),
        };
        let assistant = to_request_message(&ChatMessage::assistant_tool_calls("", vec![call]));
        assert_eq!(assistant.role, "assistant");
        assert_eq!(assistant.content, None);
        assert_eq!(assistant.tool_calls.len(), 1);

        let tool = to_request_message(&ChatMessage::tool("call_1", "end_call", "ok"));
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.content.as_deref(), Some("ok"));
    }
}
