//! Test doubles shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mockall::mock;
use tempfile::TempDir;
use tokio::sync::mpsc;
use twilio::CallControl;
use voxline_core::error::ServiceError;
use voxline_core::generic_types::{ChatMessage, EventRx, LlmEvent, TranscriptEvent};
use voxline_core::llm_api::LlmService;
use voxline_core::stt_api::TranscriptionService;
use voxline_core::tools::ToolDefinition;
use voxline_core::tts_api::{ClipSynthesizer, SynthesizedSpeech, TtsService};
use voxline_persistence::{DatabaseManager, DbRuntimeSettings};

use crate::factory::ServiceFactory;

mock! {
    pub Calls {}
    #[async_trait]
    impl CallControl for Calls {
        async fn create_call(&self, to: &str, from: &str, url: &str) -> Result<String, twilio::Error>;
        async fn fetch_status(&self, call_sid: &str) -> Result<String, twilio::Error>;
        async fn complete_call(&self, call_sid: &str) -> Result<(), twilio::Error>;
        async fn redirect_call(&self, call_sid: &str, url: &str) -> Result<(), twilio::Error>;
    }
}

mock! {
    pub Llm {}
    #[async_trait]
    impl LlmService for Llm {
        fn provider(&self) -> &'static str;
        async fn stream_turn(
            &self,
            history: &[ChatMessage],
            tools: &[ToolDefinition],
        ) -> Result<EventRx<LlmEvent>, ServiceError>;
    }
}

pub fn llm_stream(events: Vec<LlmEvent>) -> EventRx<LlmEvent> {
    let (tx, rx) = mpsc::channel(events.len() + 1);
    for event in events {
        tx.try_send(event).unwrap();
    }
    rx
}

/// Transcription fed by the test through the returned sender.
pub struct ScriptedStt {
    transcripts: Mutex<Option<EventRx<TranscriptEvent>>>,
    audio: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedStt {
    pub fn new() -> (Arc<Self>, mpsc::Sender<TranscriptEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let stt = Self {
            transcripts: Mutex::new(Some(rx)),
            audio: Mutex::new(Vec::new()),
        };
        (Arc::new(stt), tx)
    }

    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.audio.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptionService for ScriptedStt {
    fn provider(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self) -> Result<EventRx<TranscriptEvent>, ServiceError> {
        self.transcripts
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ServiceError::connection("scripted", "already connected"))
    }

    async fn send(&self, audio: Vec<u8>) -> Result<(), ServiceError> {
        self.audio.lock().unwrap().push(audio);
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// "Synthesizes" text into its own UTF-8 bytes.
pub struct EchoSynth;

#[async_trait]
impl ClipSynthesizer for EchoSynth {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, ServiceError> {
        Ok(text.as_bytes().to_vec())
    }
}

pub fn echo_tts() -> Arc<dyn TtsService> {
    Arc::new(SynthesizedSpeech::new("echo", EchoSynth, "test-voice"))
}

/// Hands out the same service instances for every call.
pub struct StaticFactory {
    pub llm: Arc<dyn LlmService>,
    pub tts: Arc<dyn TtsService>,
    pub stt: Arc<dyn TranscriptionService>,
}

impl ServiceFactory for StaticFactory {
    fn llm(&self) -> Result<Arc<dyn LlmService>, ServiceError> {
        Ok(self.llm.clone())
    }

    fn tts(&self) -> Result<Arc<dyn TtsService>, ServiceError> {
        Ok(self.tts.clone())
    }

    fn stt(&self) -> Result<Arc<dyn TranscriptionService>, ServiceError> {
        Ok(self.stt.clone())
    }
}

pub fn temp_db() -> (TempDir, DatabaseManager) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxline.db");
    let db = DatabaseManager::open(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    (dir, db)
}
