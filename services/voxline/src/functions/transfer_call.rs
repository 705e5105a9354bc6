use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use twilio::CallControl;
use voxline_core::call_context::SharedCallContext;
use voxline_core::tools::{ToolControl, ToolDefinition, ToolOutput};

use super::{Function, ToolError};

/// Time given to the filler line to play before the call is redirected.
pub const TRANSFER_DELAY: Duration = Duration::from_secs(8);

const FORWARD_URL: &str = "http://twimlets.com/forward";

/// Hands the live call to a human at `transfer_number`.
pub struct TransferCall {
    calls: Arc<dyn CallControl>,
    transfer_number: Option<String>,
    delay: Duration,
}

impl TransferCall {
    pub fn new(calls: Arc<dyn CallControl>, transfer_number: Option<String>) -> Self {
        Self {
            calls,
            transfer_number,
            delay: TRANSFER_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn forward_url(number: &str) -> Result<String, ToolError> {
    reqwest::Url::parse_with_params(FORWARD_URL, &[("PhoneNumber", number)])
        .map(String::from)
        .map_err(|e| ToolError::Failed(format!("invalid forward url: {e}")))
}

#[async_trait]
impl Function for TransferCall {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "transfer_call".into(),
            description: "Transfer call to a human, only do this if the user insists on it.".into(),
            parameters: json!({"type": "object", "properties": {}}),
            say: Some("Transferring your call, please wait.".into()),
        }
    }

    async fn call(&self, _args: Value, ctx: &SharedCallContext) -> Result<ToolOutput, ToolError> {
        let number = self
            .transfer_number
            .as_deref()
            .ok_or_else(|| ToolError::Failed("no transfer number is configured".into()))?;
        let call_sid = ctx.lock().await.call_sid.clone();

        tokio::time::sleep(self.delay).await;

        self.calls.redirect_call(&call_sid, &forward_url(number)?).await?;
        tracing::info!("call {} transferred to {}", call_sid, number);
        Ok(ToolOutput::text("Call transferred.").with_control(ToolControl::Transfer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCalls;
    use voxline_core::call_context::CallContext;

    #[test]
    fn forward_url_encodes_the_number() {
        assert_eq!(
            forward_url("+15551234567").unwrap(),
            "http://twimlets.com/forward?PhoneNumber=%2B15551234567"
        );
        assert_eq!(
            forward_url("+1 555&x=#1").unwrap(),
            "http://twimlets.com/forward?PhoneNumber=%2B1+555%26x%3D%231"
        );
    }

    #[tokio::test]
    async fn redirects_the_call_to_the_forwarder() {
        let mut calls = MockCalls::new();
        calls
            .expect_redirect_call()
            .withf(|sid, url| sid == "CA1" && url == "http://twimlets.com/forward?PhoneNumber=%2B15550100")
            .times(1)
            .returning(|_, _| Ok(()));

        let transfer = TransferCall::new(Arc::new(calls), Some("+15550100".into()))
            .with_delay(Duration::ZERO);
        let ctx = CallContext::new("CA1", "", "").shared();
        let output = transfer.call(json!({}), &ctx).await.unwrap();
        assert_eq!(output.control, ToolControl::Transfer);
    }

    #[tokio::test]
    async fn fails_without_a_transfer_number() {
        let transfer = TransferCall::new(Arc::new(MockCalls::new()), None);
        let ctx = CallContext::new("CA1", "", "").shared();
        assert!(matches!(
            transfer.call(json!({}), &ctx).await,
            Err(ToolError::Failed(_))
        ));
    }
}
