//! One phone call, end to end.
//!
//! A [`Pipeline`] is shared by every media-stream connection. For each
//! connection it waits for Twilio's `start` message and then runs a call
//! session: caller audio goes to transcription, final transcripts start LLM
//! turns, reply sentences go to speech synthesis, and synthesized audio is
//! streamed back in order. All provider output is funnelled into one event
//! channel that the session consumes alongside the media stream, so call
//! state is only ever touched from the session loop and the turn task.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use twilio::media::StartMetadata;
use twilio::{CallControl, InboundMessage, OutboundMessage};
use voxline_core::Command;
use voxline_core::call_context::{
    CallContext, ServiceKind, SharedCallContext, StreamHandle, attach_stream, close_call,
    close_stream,
};
use voxline_core::error::ServiceError;
use voxline_core::generic_types::{ChatMessage, SpeechEvent, TextChunk, TranscriptEvent};
use voxline_core::llm_api::LlmService;
use voxline_core::sentence::SentenceChunker;
use voxline_core::stt_api::TranscriptionService;
use voxline_core::tools::{ToolCall, ToolControl, ToolInvoker};
use voxline_core::tts_api::TtsService;
use voxline_core::turn::{CommandSink, TurnOutcome, run_turn};
use voxline_persistence::DatabaseManager;
use voxline_utils::audio::decode_payload;

use crate::call_store::{CallStore, persist_call};
use crate::factory::ServiceFactory;
use crate::prompt_loader::Prompts;
use crate::stream_service::{MediaStreamClosed, StreamService};

/// Spoken when a turn fails; the call stays up.
pub const APOLOGY: &str = "I'm sorry, I'm having trouble answering right now. Could you say that again?";

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Media(#[from] MediaStreamClosed),

    #[error("media stream closed before it started")]
    NotStarted,
}

/// Everything the provider streams and the turn task report back.
enum SessionEvent {
    Transcript(TranscriptEvent),
    Speech {
        generation: u64,
        event: SpeechEvent,
    },
    Command {
        generation: u64,
        command: Command,
    },
    TurnFinished {
        generation: u64,
        result: Result<TurnOutcome, ServiceError>,
    },
}

/// Tags a turn's commands with the speech generation they belong to.
struct TurnSink {
    generation: u64,
    events: mpsc::Sender<SessionEvent>,
}

#[async_trait]
impl CommandSink for TurnSink {
    async fn send(&self, command: Command) -> bool {
        self.events
            .send(SessionEvent::Command {
                generation: self.generation,
                command,
            })
            .await
            .is_ok()
    }
}

struct Services {
    llm: Arc<dyn LlmService>,
    tts: Arc<dyn TtsService>,
    stt: Arc<dyn TranscriptionService>,
}

impl Services {
    fn create(factory: &dyn ServiceFactory) -> Result<Self, ServiceError> {
        Ok(Self {
            llm: factory.llm()?,
            tts: factory.tts()?,
            stt: factory.stt()?,
        })
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: CallStore,
    db: DatabaseManager,
    calls: Arc<dyn CallControl>,
    factory: Arc<dyn ServiceFactory>,
    tools: Arc<dyn ToolInvoker>,
    prompts: Arc<Prompts>,
}

impl Pipeline {
    pub fn new(
        store: CallStore,
        db: DatabaseManager,
        calls: Arc<dyn CallControl>,
        factory: Arc<dyn ServiceFactory>,
        tools: Arc<dyn ToolInvoker>,
        prompts: Prompts,
    ) -> Self {
        Self {
            store,
            db,
            calls,
            factory,
            tools,
            prompts: Arc::new(prompts),
        }
    }

    /// Serves one media stream until Twilio stops it or the socket closes.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Result<(), PipelineError> {
        let start = loop {
            match inbound.recv().await {
                Some(InboundMessage::Start { start }) => break start,
                Some(InboundMessage::Connected { protocol }) => {
                    tracing::info!("media stream connected ({})", protocol.unwrap_or_default());
                }
                Some(_) => tracing::debug!("ignoring media stream message before start"),
                None => return Err(PipelineError::NotStarted),
            }
        };

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
        let mut session = CallSession::start(self, start, outbound, events_tx).await?;

        let status = loop {
            let flow = tokio::select! {
                message = inbound.recv() => session.on_message(message).await,
                Some(event) = events_rx.recv() => session.on_event(event).await,
            };
            if let ControlFlow::Break(status) = flow {
                break status;
            }
        };

        session.finish(status).await;
        Ok(())
    }
}

struct CallSession {
    pipeline: Pipeline,
    ctx: SharedCallContext,
    call_sid: String,
    services: Services,
    stream: StreamService,
    events: mpsc::Sender<SessionEvent>,
    chunker: Arc<Mutex<SentenceChunker>>,
    /// `None` once synthesis has failed; replies are then text only.
    text_tx: Option<mpsc::Sender<TextChunk>>,
    /// Bumped whenever speech is restarted; older output is discarded.
    generation: u64,
    /// Marks sent to Twilio that have not been echoed back yet.
    marks: HashSet<String>,
    /// Chunks handed to synthesis whose audio has not arrived.
    unsynthesized: usize,
    turn_running: bool,
    /// Final transcripts heard while a turn was running. They join the
    /// transcript once the turn is over so tool results stay adjacent to
    /// the request that produced them.
    queued_finals: Vec<String>,
    /// A tool ended or transferred the conversation; no further turns run.
    handed_off: bool,
    hangup_pending: bool,
    hung_up: bool,
}

impl CallSession {
    async fn start(
        pipeline: &Pipeline,
        start: StartMetadata,
        outbound: mpsc::Sender<OutboundMessage>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, PipelineError> {
        let call_sid = start.call_sid.clone();
        tracing::info!("media stream {} started for call {}", start.stream_sid, call_sid);

        let prompts = pipeline.prompts.clone();
        let ctx = pipeline.store.get_or_insert_with(&call_sid, || {
            CallContext::new(
                call_sid.as_str(),
                prompts.system_message.as_str(),
                prompts.initial_message.as_str(),
            )
        });
        {
            let mut guard = ctx.lock().await;
            guard.stream_sid = Some(start.stream_sid.clone());
            if guard.from_number.is_none() {
                guard.from_number = start.parameter("from").map(str::to_owned);
            }
        }

        let services = match Services::create(pipeline.factory.as_ref()) {
            Ok(services) => services,
            Err(e) => {
                tracing::error!("cannot serve call {}: {}", call_sid, e);
                close_call(&ctx, STATUS_FAILED).await;
                pipeline.store.remove(&call_sid);
                return Err(e.into());
            }
        };

        let mut session = Self {
            pipeline: pipeline.clone(),
            ctx,
            call_sid,
            services,
            stream: StreamService::new(start.stream_sid, outbound),
            events,
            chunker: Arc::new(Mutex::new(SentenceChunker::new())),
            text_tx: None,
            generation: 0,
            marks: HashSet::new(),
            unsynthesized: 0,
            turn_running: false,
            queued_finals: Vec::new(),
            handed_off: false,
            hangup_pending: false,
            hung_up: false,
        };

        if let Err(e) = session.connect_transcription().await {
            tracing::error!("transcription unavailable for call {}: {}", session.call_sid, e);
            session.finish(STATUS_FAILED).await;
            return Err(e.into());
        }
        session.restart_speech().await;
        session.greet().await;
        Ok(session)
    }

    async fn connect_transcription(&self) -> Result<(), ServiceError> {
        let mut transcripts = self.services.stt.connect().await?;
        let stt = self.services.stt.clone();
        let events = self.events.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = transcripts.recv() => match event {
                        Some(event) => {
                            if events.send(SessionEvent::Transcript(event)).await.is_err() {
                                tracing::warn!("Session event receiver dropped, stopping transcription task.");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            stt.disconnect().await;
        });

        attach_stream(
            &self.ctx,
            StreamHandle::with_shutdown(ServiceKind::Stt, shutdown_tx, task),
        )
        .await;
        Ok(())
    }

    /// Opens a fresh synthesis stream, dropping whatever the old one still had queued.
    async fn restart_speech(&mut self) {
        close_stream(&self.ctx, ServiceKind::Tts).await;
        self.generation += 1;
        self.unsynthesized = 0;
        self.text_tx = None;

        let (text_tx, text_rx) = mpsc::channel(EVENT_BUFFER);
        let mut speech = match self.services.tts.stream_speech(text_rx).await {
            Ok(speech) => speech,
            Err(e) => {
                tracing::error!(
                    "{} speech unavailable, continuing without audio: {}",
                    self.services.tts.provider(),
                    e
                );
                return;
            }
        };

        let tts = self.services.tts.clone();
        let events = self.events.clone();
        let generation = self.generation;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tts.disconnect().await;
                        break;
                    }
                    event = speech.recv() => match event {
                        Some(event) => {
                            if events.send(SessionEvent::Speech { generation, event }).await.is_err() {
                                tracing::warn!("Session event receiver dropped, stopping speech task.");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        attach_stream(
            &self.ctx,
            StreamHandle::with_shutdown(ServiceKind::Tts, shutdown_tx, task),
        )
        .await;
        self.text_tx = Some(text_tx);
    }

    async fn greet(&mut self) {
        let greeting = {
            let mut guard = self.ctx.lock().await;
            let greeting = guard.initial_message.clone();
            if greeting.is_empty() || !guard.transcript().is_empty() {
                return;
            }
            guard.push_message(ChatMessage::assistant(greeting.clone()));
            greeting
        };
        self.speak(TextChunk::immediate(greeting)).await;
    }

    async fn on_message(&mut self, message: Option<InboundMessage>) -> ControlFlow<&'static str> {
        match message {
            Some(InboundMessage::Media { media }) => self.forward_audio(&media.payload).await,
            Some(InboundMessage::Mark { mark }) => {
                self.marks.remove(&mark.name);
                self.hang_up_when_drained().await;
            }
            Some(InboundMessage::Stop {}) => {
                tracing::info!("media stream stopped for call {}", self.call_sid);
                return ControlFlow::Break(STATUS_COMPLETED);
            }
            Some(InboundMessage::Start { start }) => {
                tracing::warn!("ignoring second start for call {}", start.call_sid);
            }
            Some(_) => {}
            None => {
                tracing::info!("media stream socket closed for call {}", self.call_sid);
                return ControlFlow::Break(STATUS_COMPLETED);
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_event(&mut self, event: SessionEvent) -> ControlFlow<&'static str> {
        match event {
            SessionEvent::Transcript(event) => return self.on_transcript(event).await,

            SessionEvent::Speech { generation, .. } | SessionEvent::Command { generation, .. }
                if generation != self.generation =>
            {
                tracing::debug!("dropping output of speech generation {}", generation);
            }
            SessionEvent::Speech { event, .. } => return self.on_speech(event).await,
            SessionEvent::Command { command, .. } => match command {
                Command::Speak(chunk) => self.speak(chunk).await,
                Command::SessionComplete(ToolControl::EndCall) => {
                    self.hangup_pending = true;
                    self.hang_up_when_drained().await;
                }
                Command::SessionComplete(control) => {
                    tracing::info!("call {} handed off ({:?})", self.call_sid, control);
                }
            },

            SessionEvent::TurnFinished { generation, .. } if generation != self.generation => {}
            SessionEvent::TurnFinished { result, .. } => {
                self.turn_running = false;
                match result {
                    Ok(TurnOutcome::Completed { reply }) => {
                        tracing::debug!("turn complete on call {}: {}", self.call_sid, reply);
                    }
                    Ok(TurnOutcome::Ended(control)) => {
                        tracing::info!("conversation on call {} ended ({:?})", self.call_sid, control);
                        self.handed_off = true;
                    }
                    Err(e) => {
                        tracing::error!("{} turn failed: {}", self.services.llm.provider(), e);
                        self.ctx
                            .lock()
                            .await
                            .push_message(ChatMessage::assistant(APOLOGY));
                        self.speak(TextChunk::immediate(APOLOGY)).await;
                    }
                }
                self.answer_queued_finals().await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_transcript(&mut self, event: TranscriptEvent) -> ControlFlow<&'static str> {
        match event {
            TranscriptEvent::Utterance(text) => {
                if !self.marks.is_empty() {
                    tracing::info!("caller interrupted on call {}: {}", self.call_sid, text);
                    return self.barge_in().await;
                }
            }
            TranscriptEvent::Final(text) => {
                tracing::info!("caller on {}: {}", self.call_sid, text);
                if self.turn_running {
                    self.queued_finals.push(text);
                } else {
                    self.ctx.lock().await.push_message(ChatMessage::user(text));
                    self.start_turn().await;
                }
            }
            TranscriptEvent::Error(e) => {
                tracing::error!("transcription failed on call {}: {}", self.call_sid, e);
                self.hang_up().await;
                return ControlFlow::Break(STATUS_FAILED);
            }
            TranscriptEvent::StreamClosed => {
                tracing::warn!("transcription closed on call {}, ending call", self.call_sid);
                self.hang_up().await;
                return ControlFlow::Break(STATUS_FAILED);
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_speech(&mut self, event: SpeechEvent) -> ControlFlow<&'static str> {
        match event {
            SpeechEvent::Audio(frame) => {
                self.unsynthesized = self.unsynthesized.saturating_sub(1);
                match self.stream.buffer(frame).await {
                    Ok(labels) => self.marks.extend(labels),
                    Err(e) => {
                        tracing::warn!("call {}: {}", self.call_sid, e);
                        return ControlFlow::Break(STATUS_COMPLETED);
                    }
                }
                self.hang_up_when_drained().await;
            }
            SpeechEvent::TurnComplete => {}
            SpeechEvent::Error(e) => {
                tracing::error!("speech failed on call {}, continuing as text: {}", self.call_sid, e);
                self.text_tx = None;
                self.unsynthesized = 0;
            }
            SpeechEvent::StreamClosed => {
                self.text_tx = None;
                self.unsynthesized = 0;
                self.hang_up_when_drained().await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn forward_audio(&self, payload: &str) {
        match decode_payload(payload) {
            Ok(audio) => {
                if let Err(e) = self.services.stt.send(audio).await {
                    tracing::debug!("dropping caller audio: {}", e);
                }
            }
            Err(e) => tracing::warn!("invalid media payload on call {}: {}", self.call_sid, e),
        }
    }

    async fn speak(&mut self, chunk: TextChunk) {
        let Some(text_tx) = &self.text_tx else {
            tracing::info!("(text only) assistant on {}: {}", self.call_sid, chunk.text);
            return;
        };
        if text_tx.send(chunk).await.is_ok() {
            self.unsynthesized += 1;
        } else {
            tracing::warn!("speech stream for call {} is gone", self.call_sid);
            self.text_tx = None;
            self.unsynthesized = 0;
        }
    }

    async fn start_turn(&mut self) {
        if self.handed_off || self.ctx.lock().await.call_ended {
            tracing::debug!("call {} has ended, not starting a turn", self.call_sid);
            return;
        }
        self.turn_running = true;

        let generation = self.generation;
        let llm = self.services.llm.clone();
        let tools = self.pipeline.tools.clone();
        let ctx = self.ctx.clone();
        let chunker = self.chunker.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let sink = TurnSink {
                generation,
                events: events.clone(),
            };
            let result = {
                let mut chunker = chunker.lock().await;
                run_turn(llm.as_ref(), tools.as_ref(), &ctx, &mut chunker, &sink).await
            };
            if events
                .send(SessionEvent::TurnFinished { generation, result })
                .await
                .is_err()
            {
                tracing::warn!("Session event receiver dropped, stopping turn task.");
            }
        });

        attach_stream(&self.ctx, StreamHandle::new(ServiceKind::Llm, task)).await;
    }

    /// The caller talked over the assistant: drop unplayed audio and the
    /// reply being generated, then answer what they said instead.
    async fn barge_in(&mut self) -> ControlFlow<&'static str> {
        if self.stream.clear().await.is_err() {
            return ControlFlow::Break(STATUS_COMPLETED);
        }
        self.stream.reset();
        self.marks.clear();

        close_stream(&self.ctx, ServiceKind::Llm).await;
        if std::mem::take(&mut self.turn_running) {
            settle_interrupted_turn(&self.ctx).await;
        }
        self.chunker.lock().await.reset();
        self.restart_speech().await;

        self.answer_queued_finals().await;
        self.hang_up_when_drained().await;
        ControlFlow::Continue(())
    }

    /// Appends what the caller said during the last turn and answers it.
    async fn answer_queued_finals(&mut self) {
        if self.queued_finals.is_empty() {
            return;
        }
        {
            let mut guard = self.ctx.lock().await;
            for text in self.queued_finals.drain(..) {
                guard.push_message(ChatMessage::user(text));
            }
        }
        self.start_turn().await;
    }

    async fn hang_up_when_drained(&mut self) {
        if self.hangup_pending && self.marks.is_empty() && self.unsynthesized == 0 {
            self.hang_up().await;
        }
    }

    async fn hang_up(&mut self) {
        self.hangup_pending = false;
        if std::mem::replace(&mut self.hung_up, true) {
            return;
        }
        tracing::info!("hanging up call {}", self.call_sid);
        if let Err(e) = self.pipeline.calls.complete_call(&self.call_sid).await {
            tracing::error!("failed to hang up call {}: {}", self.call_sid, e);
        }
    }

    /// Closes every stream, stores the call and forgets it.
    async fn finish(self, status: &'static str) {
        close_call(&self.ctx, status).await;
        persist_call(&self.pipeline.db, &self.ctx).await;

        self.pipeline.store.remove(&self.call_sid);
        tracing::info!("call {} finished ({})", self.call_sid, status);
    }
}

/// Answers tool calls that a cancelled turn left open, so the history
/// stays acceptable to the model.
async fn settle_interrupted_turn(ctx: &SharedCallContext) {
    let mut guard = ctx.lock().await;
    let transcript = guard.transcript();
    let Some(position) = transcript.iter().rposition(|m| !m.tool_calls.is_empty()) else {
        return;
    };
    let answered: HashSet<&str> = transcript[position + 1..]
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    let open: Vec<ToolCall> = transcript[position]
        .tool_calls
        .iter()
        .filter(|call| !answered.contains(call.id.as_str()))
        .cloned()
        .collect();

    for call in open {
        guard.push_message(ChatMessage::tool(
            call.id,
            call.name,
            "Cancelled: the caller interrupted.",
        ));
    }
}
