use async_trait::async_trait;

use crate::error::ServiceError;
use crate::generic_types::{ChatMessage, EventRx, LlmEvent};
use crate::tools::ToolDefinition;

/// A streaming chat model.
///
/// Each call to [`LlmService::stream_turn`] produces one finite event stream
/// for one turn. When the model asks for a tool, the stream closes without
/// `TurnComplete`; the caller appends the tool results to the history and
/// calls `stream_turn` again to resume.
///
/// Provider failures arrive as `LlmEvent::Error` on the stream. An `Err`
/// return means the turn could not be started at all.
#[async_trait]
pub trait LlmService: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn stream_turn(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<EventRx<LlmEvent>, ServiceError>;
}
