use async_trait::async_trait;
use serde_json::{Value, json};
use voxline_core::call_context::SharedCallContext;
use voxline_core::tools::{ToolControl, ToolDefinition, ToolOutput};

use super::{Function, ToolError};

/// Ends the conversation. The pipeline hangs up once the goodbye has played.
pub struct EndCall;

#[async_trait]
impl Function for EndCall {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "end_call".into(),
            description: "End the current call but always ask for confirmation unless it's a natural place in the conversation (and your intent is fulfilled) to end the call.".into(),
            parameters: json!({"type": "object", "properties": {}}),
            say: Some("Goodbye.".into()),
        }
    }

    async fn call(&self, _args: Value, ctx: &SharedCallContext) -> Result<ToolOutput, ToolError> {
        let mut ctx = ctx.lock().await;
        ctx.call_ended = true;
        tracing::info!("call {} ended by the assistant", ctx.call_sid);
        Ok(ToolOutput::text("Call ended.").with_control(ToolControl::EndCall))
    }
}
