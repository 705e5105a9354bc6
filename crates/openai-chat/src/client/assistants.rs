use async_trait::async_trait;

use super::{AssistantsApi, Client, Error, RunRx, check_status, consts, spawn_sse};
use crate::types::{
    AssistantStreamEvent, CreateMessage, CreateRun, RunStatus, SubmitToolOutputs, Thread,
    ToolOutput,
};

impl Client {
    fn assistants_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.post(path)
            .header(consts::OPENAI_BETA_HEADER, consts::ASSISTANTS_BETA)
    }

    fn assistants_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.get(path)
            .header(consts::OPENAI_BETA_HEADER, consts::ASSISTANTS_BETA)
    }

    async fn run_stream(&self, request: reqwest::RequestBuilder) -> Result<RunRx, Error> {
        let response = check_status(request.send().await?).await?;
        Ok(spawn_sse(response, |event| {
            let name = event.event.as_deref().unwrap_or("message");
            match AssistantStreamEvent::parse(name, &event.data) {
                Ok(AssistantStreamEvent::Other(name)) => {
                    tracing::trace!("ignoring run event {}", name);
                    None
                }
                Ok(parsed) => Some(Ok(parsed)),
                Err(e) => Some(Err(Error::InvalidResponse(format!("{name}: {e}")))),
            }
        }))
    }
}

#[async_trait]
impl AssistantsApi for Client {
    async fn create_thread(&self) -> Result<String, Error> {
        let response = self
            .assistants_post("threads")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let thread: Thread = check_status(response).await?.json().await?;
        tracing::info!("created assistant thread {}", thread.id);
        Ok(thread.id)
    }

    async fn add_message(&self, thread_id: &str, content: &str) -> Result<(), Error> {
        let response = self
            .assistants_post(&format!("threads/{thread_id}/messages"))
            .json(&CreateMessage {
                role: "user",
                content,
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: Option<String>,
    ) -> Result<RunRx, Error> {
        let request = self
            .assistants_post(&format!("threads/{thread_id}/runs"))
            .json(&CreateRun {
                assistant_id,
                additional_instructions: instructions.as_deref(),
                stream: true,
            });
        self.run_stream(request).await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunRx, Error> {
        let request = self
            .assistants_post(&format!(
                "threads/{thread_id}/runs/{run_id}/submit_tool_outputs"
            ))
            .json(&SubmitToolOutputs {
                tool_outputs: outputs,
                stream: true,
            });
        self.run_stream(request).await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), Error> {
        let response = self
            .assistants_post(&format!("threads/{thread_id}/runs/{run_id}/cancel"))
            .send()
            .await?;
        let mut run: RunStatus = check_status(response).await?.json().await?;

        for _ in 0..consts::CANCEL_POLLS {
            if !run.is_active() {
                tracing::debug!("run {} is {}", run.id, run.status);
                return Ok(());
            }
            tokio::time::sleep(consts::CANCEL_POLL_INTERVAL).await;
            let response = self
                .assistants_get(&format!("threads/{thread_id}/runs/{run_id}"))
                .send()
                .await?;
            run = check_status(response).await?.json().await?;
        }
        Err(Error::InvalidResponse(format!(
            "run {run_id} still {} after cancelling",
            run.status
        )))
    }
}
