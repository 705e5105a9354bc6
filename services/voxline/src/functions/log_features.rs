use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use voxline_core::call_context::SharedCallContext;
use voxline_core::tools::{ToolDefinition, ToolOutput};

use super::{Function, ToolError};

const REPLY: &str = "Logging features. Would you like to add your name for credit?";

#[derive(Debug, Deserialize)]
struct FeatureIdea {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct Args {
    #[serde(default)]
    new_function_ideas: Vec<FeatureIdea>,
}

/// Records function ideas suggested by the caller.
pub struct LogFeatures;

#[async_trait]
impl Function for LogFeatures {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "log_features".into(),
            description: "Log new function ideas the caller suggests for this assistant.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "new_function_ideas": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string", "description": "Name of the function"},
                                "description": {"type": "string", "description": "What the function does"},
                                "parameters": {"type": "object", "description": "Parameters the function takes"}
                            },
                            "required": ["name", "description"]
                        }
                    }
                },
                "required": ["new_function_ideas"]
            }),
            say: None,
        }
    }

    async fn call(&self, args: Value, ctx: &SharedCallContext) -> Result<ToolOutput, ToolError> {
        let args: Args =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let call_sid = ctx.lock().await.call_sid.clone();
        for idea in &args.new_function_ideas {
            tracing::info!(
                target: "voxline::features",
                call_sid = %call_sid,
                name = %idea.name,
                parameters = %idea.parameters,
                "new function idea: {}",
                idea.description
            );
        }
        Ok(ToolOutput::text(REPLY))
    }
}
