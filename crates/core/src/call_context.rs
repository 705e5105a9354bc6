use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::generic_types::ChatMessage;

/// How long a stream task gets to wind down after its shutdown signal.
pub const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Llm,
    Stt,
    Tts,
}

/// A running provider stream owned by a call.
pub struct StreamHandle {
    kind: ServiceKind,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// A stream that is stopped by aborting its task.
    pub fn new(kind: ServiceKind, task: JoinHandle<()>) -> Self {
        Self {
            kind,
            shutdown: None,
            task,
        }
    }

    /// A stream that is asked to stop first and only aborted if it lingers.
    pub fn with_shutdown(
        kind: ServiceKind,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn close(mut self) {
        match self.shutdown.take() {
            Some(shutdown) => {
                let _ = shutdown.send(());
                if tokio::time::timeout(STREAM_CLOSE_TIMEOUT, &mut self.task)
                    .await
                    .is_err()
                {
                    tracing::warn!("{:?} stream did not stop in time, aborting", self.kind);
                    self.task.abort();
                }
            }
            None => {
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
        tracing::debug!("{:?} stream closed", self.kind);
    }
}

/// At most one stream of each kind.
#[derive(Default)]
pub struct StreamRegistry {
    handles: HashMap<ServiceKind, StreamHandle>,
}

impl StreamRegistry {
    /// Registers `handle`, returning the handle it replaces so the caller can
    /// close it without holding the context lock.
    pub fn attach(&mut self, handle: StreamHandle) -> Option<StreamHandle> {
        self.handles.insert(handle.kind, handle)
    }

    pub fn take(&mut self, kind: ServiceKind) -> Option<StreamHandle> {
        self.handles.remove(&kind)
    }

    pub fn drain(&mut self) -> Vec<StreamHandle> {
        self.handles.drain().map(|(_, h)| h).collect()
    }

    /// Streams whose task is still running.
    pub fn open_count(&self) -> usize {
        self.handles.values().filter(|h| !h.is_finished()).count()
    }
}

/// Everything known about one phone call.
pub struct CallContext {
    pub call_sid: String,
    pub stream_sid: Option<String>,
    pub call_ended: bool,
    pub system_message: String,
    pub initial_message: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub final_status: Option<String>,
    pub to_number: Option<String>,
    pub from_number: Option<String>,
    /// Completed LLM turns.
    pub interaction_count: u32,
    transcript: Vec<ChatMessage>,
    streams: StreamRegistry,
}

pub type SharedCallContext = Arc<tokio::sync::Mutex<CallContext>>;

impl CallContext {
    pub fn new(
        call_sid: impl Into<String>,
        system_message: impl Into<String>,
        initial_message: impl Into<String>,
    ) -> Self {
        Self {
            call_sid: call_sid.into(),
            stream_sid: None,
            call_ended: false,
            system_message: system_message.into(),
            initial_message: initial_message.into(),
            start_time: Utc::now(),
            end_time: None,
            final_status: None,
            to_number: None,
            from_number: None,
            interaction_count: 0,
            transcript: Vec::new(),
            streams: StreamRegistry::default(),
        }
    }

    pub fn shared(self) -> SharedCallContext {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.transcript.push(message);
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// The history sent to the model: system message first, then the transcript.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut history = Vec::with_capacity(self.transcript.len() + 1);
        if !self.system_message.is_empty() {
            history.push(ChatMessage::system(self.system_message.clone()));
        }
        history.extend(self.transcript.iter().cloned());
        history
    }

    /// Spoken lines only, one per line, prefixed by speaker.
    pub fn transcript_text(&self) -> String {
        self.transcript
            .iter()
            .filter(|m| m.tool_calls.is_empty() && !m.content.is_empty())
            .filter_map(|m| {
                let speaker = match m.role {
                    crate::generic_types::Role::User => "user",
                    crate::generic_types::Role::Assistant => "assistant",
                    _ => return None,
                };
                Some(format!("{speaker}: {}", m.content))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn attach_stream(&mut self, handle: StreamHandle) -> Option<StreamHandle> {
        self.streams.attach(handle)
    }

    pub fn take_stream(&mut self, kind: ServiceKind) -> Option<StreamHandle> {
        self.streams.take(kind)
    }

    pub fn take_streams(&mut self) -> Vec<StreamHandle> {
        self.streams.drain()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.open_count()
    }

    /// Stamps the end of the call and hands back its streams for closing.
    pub fn finish(&mut self, status: impl Into<String>) -> Vec<StreamHandle> {
        self.call_ended = true;
        self.end_time.get_or_insert_with(Utc::now);
        self.final_status.get_or_insert_with(|| status.into());
        self.take_streams()
    }
}

/// Registers a stream on the call, closing any stream of the same kind.
pub async fn attach_stream(ctx: &SharedCallContext, handle: StreamHandle) {
    let replaced = ctx.lock().await.attach_stream(handle);
    if let Some(previous) = replaced {
        previous.close().await;
    }
}

/// Closes one stream of the call, if open.
pub async fn close_stream(ctx: &SharedCallContext, kind: ServiceKind) {
    let handle = ctx.lock().await.take_stream(kind);
    if let Some(handle) = handle {
        handle.close().await;
    }
}

/// Ends the call and closes every stream it owns.
pub async fn close_call(ctx: &SharedCallContext, status: &str) {
    let (call_sid, handles) = {
        let mut guard = ctx.lock().await;
        let handles = guard.finish(status);
        (guard.call_sid.clone(), handles)
    };
    let count = handles.len();
    for handle in handles {
        handle.close().await;
    }
    tracing::info!("call {} closed ({} streams)", call_sid, count);
}
