use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call_context::SharedCallContext;
use crate::error::ServiceError;

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
    /// Filler line spoken while the tool runs. Never sent to providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<String>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text, exactly as the provider streamed it.
    pub arguments: String,
}

impl ToolCall {
    pub fn parse_arguments(&self) -> Result<Value, ServiceError> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
            .map_err(|e| ServiceError::tool(&self.name, format!("invalid arguments: {e}")))
    }
}

/// What the conversation does after a tool returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolControl {
    /// Hand the result back to the model.
    #[default]
    Continue,
    /// Hang up once the goodbye has played.
    EndCall,
    /// The call has been handed to another number.
    Transfer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub control: ToolControl,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            control: ToolControl::Continue,
        }
    }

    pub fn with_control(mut self, control: ToolControl) -> Self {
        self.control = control;
        self
    }
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn invoke(
        &self,
        call: &ToolCall,
        ctx: &SharedCallContext,
    ) -> Result<ToolOutput, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: "get_current_weather".into(),
            arguments: arguments.into(),
        }
    }

    #[test]
    fn empty_arguments_parse_as_an_empty_object() {
        assert_eq!(call("").parse_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn malformed_arguments_are_a_tool_error() {
        let err = call("{\"location\":").parse_arguments().unwrap_err();
        assert!(matches!(err, ServiceError::ToolExecution { ref tool, .. } if tool == "get_current_weather"));
    }

    #[test]
    fn say_is_not_serialized_when_absent() {
        let def = ToolDefinition {
            name: "end_call".into(),
            description: "Hang up".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            say: None,
        };
        let json = serde_json::to_value(&def).unwrap();
        assert!(json.get("say").is_none());
    }
}
