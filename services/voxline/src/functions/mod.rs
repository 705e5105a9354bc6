//! Functions the model can call during a conversation.

mod end_call;
mod log_features;
mod transfer_call;
mod weather;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use voxline_core::call_context::SharedCallContext;
use voxline_core::error::ServiceError;
use voxline_core::tools::{ToolCall, ToolDefinition, ToolInvoker, ToolOutput};

pub use end_call::EndCall;
pub use log_features::LogFeatures;
pub use transfer_call::{TRANSFER_DELAY, TransferCall};
pub use weather::CurrentWeather;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telephony request failed: {0}")]
    Telephony(#[from] twilio::Error),
}

/// One callable function.
#[async_trait]
pub trait Function: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: Value, ctx: &SharedCallContext) -> Result<ToolOutput, ToolError>;
}

/// The functions offered to the model, in manifest order.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: Vec<Arc<dyn Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, function: impl Function + 'static) -> Self {
        self.functions.push(Arc::new(function));
        self
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Function>> {
        self.functions.iter().find(|f| f.definition().name == name)
    }
}

#[async_trait]
impl ToolInvoker for FunctionRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.functions.iter().map(|f| f.definition()).collect()
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        ctx: &SharedCallContext,
    ) -> Result<ToolOutput, ServiceError> {
        let function = self
            .find(&call.name)
            .ok_or_else(|| ServiceError::tool(&call.name, "no such function"))?;
        let args = call.parse_arguments()?;
        tracing::info!("calling function {} with {}", call.name, args);
        function
            .call(args, ctx)
            .await
            .map_err(|e| ServiceError::tool(&call.name, e))
    }
}

/// Reads a required string argument.
fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use voxline_core::call_context::CallContext;
    use voxline_core::tools::ToolControl;

    fn ctx() -> SharedCallContext {
        CallContext::new("CA1", "", "").shared()
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new().register(EndCall).register(LogFeatures)
    }

    #[test]
    fn definitions_follow_registration_order() {
        let names: Vec<_> = registry().definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["end_call", "log_features"]);
    }

    #[tokio::test]
    async fn unknown_function_is_a_tool_error() {
        let err = registry().invoke(&call("fly", "{}"), &ctx()).await.unwrap_err();
        assert!(matches!(err, ServiceError::ToolExecution { ref tool, .. } if tool == "fly"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_tool_error() {
        let err = registry()
            .invoke(&call("log_features", "{not json"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn end_call_marks_the_call_ended() {
        let ctx = ctx();
        let output = registry().invoke(&call("end_call", ""), &ctx).await.unwrap();
        assert_eq!(output.control, ToolControl::EndCall);
        assert!(ctx.lock().await.call_ended);
    }

    #[test]
    fn required_strings_must_be_present() {
        let args = json!({"location": "Paris", "blank": " "});
        assert_eq!(required_str(&args, "location").unwrap(), "Paris");
        assert!(required_str(&args, "blank").is_err());
        assert!(required_str(&args, "format").is_err());
    }
}
