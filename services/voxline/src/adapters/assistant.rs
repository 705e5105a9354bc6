use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openai_chat::AssistantsApi;
use openai_chat::types::{AssistantStreamEvent, ToolOutput};
use voxline_core::error::ServiceError;
use voxline_core::generic_types::{ChatMessage, EventRx, LlmEvent, Role};
use voxline_core::llm_api::LlmService;
use voxline_core::normalizer::{EventHandler, spawn_normalizer};
use voxline_core::tools::{ToolCall, ToolDefinition};

use super::failed_stream;
use super::openai::service_error;

/// An OpenAI assistant behind [`LlmService`].
///
/// The conversation lives server-side in one thread per instance, created on
/// the first turn. Each turn posts only the newest user message. When a run
/// stops for tool calls, the run id is kept so the next turn can submit the
/// tool results to it instead of starting a new run; if the next turn brings
/// no tool results the run is cancelled first. Tool definitions are
/// configured on the assistant itself.
pub struct AssistantChat<A: AssistantsApi> {
    api: Arc<A>,
    assistant_id: String,
    thread_id: tokio::sync::Mutex<Option<String>>,
    pending_run: Arc<Mutex<Option<String>>>,
}

impl<A: AssistantsApi> AssistantChat<A> {
    pub fn new(api: A, assistant_id: &str) -> Self {
        Self {
            api: Arc::new(api),
            assistant_id: assistant_id.to_string(),
            thread_id: tokio::sync::Mutex::new(None),
            pending_run: Arc::new(Mutex::new(None)),
        }
    }

    async fn thread(&self) -> Result<String, openai_chat::Error> {
        let mut thread_id = self.thread_id.lock().await;
        if let Some(id) = thread_id.as_ref() {
            return Ok(id.clone());
        }
        let id = self.api.create_thread().await?;
        tracing::info!("created assistant thread {}", id);
        *thread_id = Some(id.clone());
        Ok(id)
    }

    fn take_pending_run(&self) -> Option<String> {
        match self.pending_run.lock() {
            Ok(mut run) => run.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    async fn start(&self, history: &[ChatMessage]) -> Result<openai_chat::RunRx, openai_chat::Error> {
        let thread_id = self.thread().await?;

        let outputs: Vec<ToolOutput> = trailing_tool_results(history)
            .map(|m| ToolOutput {
                tool_call_id: m.tool_call_id.clone().unwrap_or_default(),
                output: m.content.clone(),
            })
            .collect();

        if let Some(run_id) = self.take_pending_run() {
            if !outputs.is_empty() {
                tracing::debug!("submitting {} tool output(s) to run {}", outputs.len(), run_id);
                return self.api.submit_tool_outputs(&thread_id, &run_id, outputs).await;
            }
            // The turn that requested the tools was interrupted. The run still
            // holds the thread, so it has to end before a new message is posted.
            tracing::info!("cancelling interrupted run {}", run_id);
            if let Err(e) = self.api.cancel_run(&thread_id, &run_id).await {
                tracing::warn!("failed to cancel run {}: {}", run_id, e);
            }
        }

        if let Some(user) = history.iter().rev().find(|m| m.role == Role::User) {
            self.api.add_message(&thread_id, &user.content).await?;
        }
        let instructions = history
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        self.api
            .stream_run(&thread_id, &self.assistant_id, instructions)
            .await
    }
}

/// The tool messages at the end of the history, oldest first.
fn trailing_tool_results(history: &[ChatMessage]) -> impl Iterator<Item = &ChatMessage> {
    let count = history
        .iter()
        .rev()
        .take_while(|m| m.role == Role::Tool)
        .count();
    history[history.len() - count..].iter()
}

#[async_trait]
impl<A: AssistantsApi + 'static> LlmService for AssistantChat<A> {
    fn provider(&self) -> &'static str {
        "assistant"
    }

    async fn stream_turn(
        &self,
        history: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<EventRx<LlmEvent>, ServiceError> {
        match self.start(history).await {
            Ok(events) => Ok(spawn_normalizer(
                RunEvents {
                    pending_run: self.pending_run.clone(),
                },
                events,
            )),
            Err(e) => {
                tracing::error!("assistant run failed to start: {}", e);
                Ok(failed_stream(LlmEvent::Error(service_error(e))))
            }
        }
    }
}

struct RunEvents {
    pending_run: Arc<Mutex<Option<String>>>,
}

impl EventHandler for RunEvents {
    type Raw = Result<AssistantStreamEvent, openai_chat::Error>;
    type Event = LlmEvent;

    fn on_event(&mut self, raw: Self::Raw) -> Vec<LlmEvent> {
        let event = match raw {
            Ok(event) => event,
            Err(e) => return vec![LlmEvent::Error(service_error(e))],
        };

        match event {
            AssistantStreamEvent::RunCreated { run_id } => {
                tracing::debug!("assistant run {} started", run_id);
                Vec::new()
            }
            AssistantStreamEvent::MessageDelta { text } if !text.is_empty() => {
                vec![LlmEvent::ContentDelta(text)]
            }
            AssistantStreamEvent::RequiresAction { run_id, tool_calls } => {
                match self.pending_run.lock() {
                    Ok(mut run) => *run = Some(run_id),
                    Err(poisoned) => *poisoned.into_inner() = Some(run_id),
                }
                tool_calls
                    .into_iter()
                    .map(|call| {
                        LlmEvent::ToolCallRequest(ToolCall {
                            id: call.id,
                            name: call.function.name,
                            arguments: call.function.arguments,
                        })
                    })
                    .collect()
            }
            AssistantStreamEvent::RunCompleted { .. } => vec![LlmEvent::TurnComplete],
            AssistantStreamEvent::RunFailed { message } | AssistantStreamEvent::Error { message } => {
                vec![LlmEvent::Error(ServiceError::connection("assistant", message))]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::{Sequence, mock};
    use openai_chat::RunRx;
    use openai_chat::types::RequestToolCall;
    use tokio::sync::mpsc;

    mock! {
        pub Assistants {}
        #[async_trait]
        impl AssistantsApi for Assistants {
            async fn create_thread(&self) -> Result<String, openai_chat::Error>;
            async fn add_message(&self, thread_id: &str, content: &str) -> Result<(), openai_chat::Error>;
            async fn stream_run(
                &self,
                thread_id: &str,
                assistant_id: &str,
                instructions: Option<String>,
            ) -> Result<RunRx, openai_chat::Error>;
            async fn submit_tool_outputs(
                &self,
                thread_id: &str,
                run_id: &str,
                outputs: Vec<ToolOutput>,
            ) -> Result<RunRx, openai_chat::Error>;
            async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), openai_chat::Error>;
        }
    }

    fn run(events: Vec<AssistantStreamEvent>) -> RunRx {
        let (tx, rx) = mpsc::channel(events.len() + 1);
        for event in events {
            tx.try_send(Ok(event)).unwrap();
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

    #[tokio::test]
    async fn first_turn_creates_a_thread_and_streams_a_run() {
        let mut api = MockAssistants::new();
        api.expect_create_thread()
            .times(1)
            .returning(|| Ok("thread_1".to_string()));
        api.expect_add_message()
            .withf(|thread, content| thread == "thread_1" && content == "Hello")
            .times(2)
            .returning(|_, _| Ok(()));
        api.expect_stream_run()
            .withf(|thread, assistant, instructions| {
                thread == "thread_1" && assistant == "asst_1" && instructions.as_deref() == Some("Be brief.")
            })
            .times(2)
            .returning(|_, _, _| {
                Ok(run(vec![
                    AssistantStreamEvent::RunCreated { run_id: "run_1".into() },
                    AssistantStreamEvent::MessageDelta { text: "Hi.".into() },
                    AssistantStreamEvent::RunCompleted { run_id: "run_1".into() },
                ]))
            });

        let llm = AssistantChat::new(api, "asst_1");
        let history = [ChatMessage::system("Be brief."), ChatMessage::user("Hello")];

        for _ in 0..2 {
            let rx = llm.stream_turn(&history, &[]).await.unwrap();
            assert_eq!(
                collect(rx).await,
                vec![
                    LlmEvent::ContentDelta("Hi.".into()),
                    LlmEvent::TurnComplete,
                    LlmEvent::StreamClosed,
                ]
            );
        }
    }

    #[tokio::test]
    async fn tool_results_are_submitted_to_the_paused_run() {
        let mut api = MockAssistants::new();
        api.expect_create_thread().returning(|| Ok("thread_1".to_string()));
        api.expect_add_message().times(1).returning(|_, _| Ok(()));
        api.expect_stream_run().times(1).returning(|_, _, _| {
            Ok(run(vec![AssistantStreamEvent::RequiresAction {
                run_id: "run_1".into(),
                tool_calls: vec![RequestToolCall::function("call_1", "end_call", "{}")],
            }]))
        });
        api.expect_submit_tool_outputs()
            .withf(|thread, run_id, outputs| {
                thread == "thread_1"
                    && run_id == "run_1"
                    && outputs.len() == 1
                    && outputs[0].tool_call_id == "call_1"
                    && outputs[0].output == "done"
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(run(vec![AssistantStreamEvent::RunCompleted { run_id: "run_1".into() }]))
            });

        let llm = AssistantChat::new(api, "asst_1");
        let mut history = vec![ChatMessage::user("Bye")];
        let rx = llm.stream_turn(&history, &[]).await.unwrap();
        let call = ToolCall {
            id: "call_1".into(),
            name: "end_call".into(),
            arguments: "{}".into(),
        };
        assert_eq!(
            collect(rx).await,
            vec![LlmEvent::ToolCallRequest(call.clone()), LlmEvent::StreamClosed]
        );

        history.push(ChatMessage::assistant_tool_calls("", vec![call]));
        history.push(ChatMessage::tool("call_1", "end_call", "done"));
        let rx = llm.stream_turn(&history, &[]).await.unwrap();
        assert_eq!(
            collect(rx).await,
            vec![LlmEvent::TurnComplete, LlmEvent::StreamClosed]
        );
    }

    #[tokio::test]
    async fn interrupted_run_is_cancelled_before_the_next_message() {
        let mut seq = Sequence::new();
        let mut api = MockAssistants::new();
        api.expect_create_thread().returning(|| Ok("thread_1".to_string()));
        api.expect_add_message()
            .withf(|_, content| content == "Transfer me")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_stream_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(run(vec![AssistantStreamEvent::RequiresAction {
                    run_id: "run_1".into(),
                    tool_calls: vec![RequestToolCall::function("call_1", "transfer_call", "{}")],
                }]))
            });
        api.expect_cancel_run()
            .withf(|thread, run_id| thread == "thread_1" && run_id == "run_1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_add_message()
            .withf(|_, content| content == "Actually, never mind")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_stream_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(run(vec![
                    AssistantStreamEvent::MessageDelta { text: "Sure.".into() },
                    AssistantStreamEvent::RunCompleted { run_id: "run_2".into() },
                ]))
            });
        api.expect_submit_tool_outputs().never();

        let llm = AssistantChat::new(api, "asst_1");
        let call = ToolCall {
            id: "call_1".into(),
            name: "transfer_call".into(),
            arguments: "{}".into(),
        };
        let mut history = vec![ChatMessage::user("Transfer me")];
        collect(llm.stream_turn(&history, &[]).await.unwrap()).await;

        // The caller cut in while the tool ran; the open call was answered
        // before their new words.
        history.push(ChatMessage::assistant_tool_calls("", vec![call]));
        history.push(ChatMessage::tool(
            "call_1",
            "transfer_call",
            "Cancelled: the caller interrupted.",
        ));
        history.push(ChatMessage::user("Actually, never mind"));
        let rx = llm.stream_turn(&history, &[]).await.unwrap();
        assert_eq!(
            collect(rx).await,
            vec![
                LlmEvent::ContentDelta("Sure.".into()),
                LlmEvent::TurnComplete,
                LlmEvent::StreamClosed,
            ]
        );
    }

    #[tokio::test]
    async fn failed_run_is_a_provider_error() {
        let mut api = MockAssistants::new();
        api.expect_create_thread().returning(|| Ok("thread_1".to_string()));
        api.expect_add_message().returning(|_, _| Ok(()));
        api.expect_stream_run().returning(|_, _, _| {
            Ok(run(vec![AssistantStreamEvent::RunFailed {
                message: "quota".into(),
            }]))
        });

        let llm = AssistantChat::new(api, "asst_1");
        let rx = llm.stream_turn(&[ChatMessage::user("Hi")], &[]).await.unwrap();
        assert_eq!(
            collect(rx).await,
            vec![
                LlmEvent::Error(ServiceError::connection("assistant", "quota")),
                LlmEvent::StreamClosed,
            ]
        );
    }

    #[test]
    fn only_trailing_tool_messages_are_collected() {
        let history = [
            ChatMessage::tool("old", "end_call", "x"),
            ChatMessage::user("Hi"),
            ChatMessage::tool("a", "t", "1"),
            ChatMessage::tool("b", "t", "2"),
        ];
        let ids: Vec<_> = trailing_tool_results(&history)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
