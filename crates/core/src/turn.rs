//! Drives one conversational turn against an [`LlmService`].
//!
//! A turn may span several model round trips: whenever the model requests
//! tools, their results are appended to the call transcript and the model is
//! asked again, until it answers in text or a tool ends the conversation.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Command;
use crate::call_context::SharedCallContext;
use crate::error::ServiceError;
use crate::generic_types::{ChatMessage, LlmEvent, TextChunk};
use crate::llm_api::LlmService;
use crate::sentence::SentenceChunker;
use crate::tools::{ToolCall, ToolControl, ToolInvoker, ToolOutput};

/// Upper bound on model round trips caused by tool calls within one turn.
pub const MAX_TOOL_ROUNDS: usize = 8;

/// Receives the commands a turn issues.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Returns `false` once nobody is listening.
    async fn send(&self, command: Command) -> bool;
}

#[async_trait]
impl CommandSink for mpsc::Sender<Command> {
    async fn send(&self, command: Command) -> bool {
        mpsc::Sender::send(self, command).await.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered; `reply` is the full text of its final round.
    Completed { reply: String },
    /// A tool ended or handed off the conversation.
    Ended(ToolControl),
}

pub async fn run_turn(
    llm: &dyn LlmService,
    tools: &dyn ToolInvoker,
    ctx: &SharedCallContext,
    chunker: &mut SentenceChunker,
    sink: &dyn CommandSink,
) -> Result<TurnOutcome, ServiceError> {
    let definitions = tools.definitions();

    for round in 0..MAX_TOOL_ROUNDS {
        let history = ctx.lock().await.history();
        let mut events = llm.stream_turn(&history, &definitions).await?;

        let mut reply = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();

        while let Some(event) = events.recv().await {
            match event {
                LlmEvent::ContentDelta(delta) => {
                    reply.push_str(&delta);
                    for chunk in chunker.push(&delta) {
                        if !sink.send(Command::Speak(chunk)).await {
                            tracing::debug!("command sink closed mid-turn");
                            return Ok(TurnOutcome::Completed { reply });
                        }
                    }
                }
                LlmEvent::ToolCallRequest(call) => calls.push(call),
                LlmEvent::TurnComplete => {}
                LlmEvent::Error(e) => {
                    // The fragment already holds an index; speak it so no gap is left.
                    if let Some(chunk) = chunker.flush() {
                        sink.send(Command::Speak(chunk)).await;
                    }
                    return Err(e);
                }
                LlmEvent::StreamClosed => break,
            }
        }

        if let Some(chunk) = chunker.flush() {
            sink.send(Command::Speak(chunk)).await;
        }

        if calls.is_empty() {
            let mut guard = ctx.lock().await;
            if !reply.trim().is_empty() {
                guard.push_message(ChatMessage::assistant(reply.clone()));
            }
            guard.interaction_count += 1;
            return Ok(TurnOutcome::Completed { reply });
        }

        tracing::info!(
            "{} requested {} tool call(s) in round {}",
            llm.provider(),
            calls.len(),
            round
        );
        ctx.lock()
            .await
            .push_message(ChatMessage::assistant_tool_calls(reply, calls.clone()));

        let mut control = ToolControl::Continue;
        for call in &calls {
            let say = definitions
                .iter()
                .find(|d| d.name == call.name)
                .and_then(|d| d.say.clone());
            if let Some(say) = say {
                sink.send(Command::Speak(TextChunk::immediate(say))).await;
            }

            let output = match tools.invoke(call, ctx).await {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!("tool call {} failed: {}", call.name, e);
                    ToolOutput::text(e.to_string())
                }
            };
            ctx.lock().await.push_message(ChatMessage::tool(
                call.id.clone(),
                call.name.clone(),
                output.content,
            ));
            if output.control != ToolControl::Continue {
                control = output.control;
            }
        }

        if control != ToolControl::Continue {
            ctx.lock().await.interaction_count += 1;
            sink.send(Command::SessionComplete(control)).await;
            return Ok(TurnOutcome::Ended(control));
        }
    }

    Err(ServiceError::tool(
        "*",
        format!("gave up after {MAX_TOOL_ROUNDS} tool rounds"),
    ))
}
