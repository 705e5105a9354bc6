use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use gemini_chat::GenerateApi;
use gemini_chat::types::{
    Content, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse, Part,
    ToolDeclarations,
};
use serde_json::{Value, json};
use voxline_core::error::ServiceError;
use voxline_core::generic_types::{ChatMessage, EventRx, LlmEvent, Role};
use voxline_core::llm_api::LlmService;
use voxline_core::normalizer::{EventHandler, spawn_normalizer};
use voxline_core::tools::{ToolCall, ToolDefinition};

use super::failed_stream;

const PROVIDER: &str = "gemini";

/// Gemini `streamGenerateContent` behind [`LlmService`].
pub struct GeminiChat<G: GenerateApi> {
    client: Arc<G>,
    /// Gemini does not identify function calls, so ids are minted here.
    call_ids: Arc<AtomicU32>,
}

impl<G: GenerateApi> GeminiChat<G> {
    pub fn new(client: G) -> Self {
        Self {
            client: Arc::new(client),
            call_ids: Arc::new(AtomicU32::new(0)),
        }
    }
}

fn service_error(error: gemini_chat::Error) -> ServiceError {
    match error {
        gemini_chat::Error::RateLimited(body) => ServiceError::rate_limited(PROVIDER, body),
        other => ServiceError::connection(PROVIDER, other),
    }
}

/// Maps the history onto Gemini contents. The system message becomes the
/// system instruction; consecutive tool results share one content.
fn build_request(history: &[ChatMessage], tools: &[ToolDefinition]) -> GenerateContentRequest {
    let mut system_instruction = None;
    let mut contents: Vec<Content> = Vec::new();

    for message in history {
        match message.role {
            Role::System => system_instruction = Some(Content::instruction(&message.content)),
            Role::User => contents.push(Content::new("user", vec![Part::text(&message.content)])),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(Part::text(&message.content));
                }
                for call in &message.tool_calls {
                    let args = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    parts.push(Part::function_call(&call.name, args));
                }
                if !parts.is_empty() {
                    contents.push(Content::new("model", parts));
                }
            }
            Role::Tool => {
                let name = message.name.as_deref().unwrap_or_default();
                let part = Part::function_response(name, json!({ "result": message.content }));
                match contents.last_mut() {
                    Some(last) if last.parts.iter().all(|p| p.function_response.is_some()) => {
                        last.parts.push(part)
                    }
                    _ => contents.push(Content::new("user", vec![part])),
                }
            }
        }
    }

    let tools = if tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclarations {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration::new(&t.name, &t.description, &t.parameters))
                .collect(),
        }]
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
    }
}

#[async_trait]
impl<G: GenerateApi + 'static> LlmService for GeminiChat<G> {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn stream_turn(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<EventRx<LlmEvent>, ServiceError> {
        let request = build_request(history, tools);
        match self.client.stream_generate(request).await {
            Ok(responses) => Ok(spawn_normalizer(
                ResponseEvents {
                    call_ids: self.call_ids.clone(),
                    requested_tools: false,
                },
                responses,
            )),
            Err(e) => {
                tracing::error!("gemini request failed: {}", e);
                Ok(failed_stream(LlmEvent::Error(service_error(e))))
            }
        }
    }
}

struct ResponseEvents {
    call_ids: Arc<AtomicU32>,
    requested_tools: bool,
}

impl EventHandler for ResponseEvents {
    type Raw = Result<GenerateContentResponse, gemini_chat::Error>;
    type Event = LlmEvent;

    fn on_event(&mut self, raw: Self::Raw) -> Vec<LlmEvent> {
        let response = match raw {
            Ok(response) => response,
            Err(e) => return vec![LlmEvent::Error(service_error(e))],
        };

        let mut events = Vec::new();
        for candidate in response.candidates {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(LlmEvent::ContentDelta(text));
                }
                if let Some(call) = part.function_call {
                    let n = self.call_ids.fetch_add(1, Ordering::Relaxed);
                    self.requested_tools = true;
                    let arguments = match call.args {
                        Value::Null => "{}".to_string(),
                        args => args.to_string(),
                    };
                    events.push(LlmEvent::ToolCallRequest(ToolCall {
                        id: format!("gemini-call-{n}"),
                        name: call.name,
                        arguments,
                    }));
                }
            }
            // A turn that asked for tools is not complete until they answer.
            if candidate.finish_reason.is_some() && !self.requested_tools {
                events.push(LlmEvent::TurnComplete);
            }
        }
        events
    }
}
