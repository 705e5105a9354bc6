use async_trait::async_trait;
use deepgram::{LiveClient, LiveConfig, LiveEvent, LiveMessage};
use tokio::sync::Mutex;
use voxline_core::error::ServiceError;
use voxline_core::generic_types::{EventRx, TranscriptEvent};
use voxline_core::normalizer::{EventHandler, spawn_normalizer};
use voxline_core::stt_api::TranscriptionService;

const PROVIDER: &str = "deepgram";

/// Deepgram live transcription behind [`TranscriptionService`].
pub struct DeepgramTranscription {
    config: LiveConfig,
    client: Mutex<Option<LiveClient>>,
}

impl DeepgramTranscription {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TranscriptionService for DeepgramTranscription {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn connect(&self) -> Result<EventRx<TranscriptEvent>, ServiceError> {
        let (client, events) = deepgram::connect(self.config.clone())
            .await
            .map_err(|e| ServiceError::connection(PROVIDER, e))?;
        if self.client.lock().await.replace(client).is_some() {
            tracing::warn!("replaced an open Deepgram connection");
        }
        Ok(spawn_normalizer(TranscriptAccumulator::default(), events))
    }

    async fn send(&self, audio: Vec<u8>) -> Result<(), ServiceError> {
        let client = self.client.lock().await;
        let client = client
            .as_ref()
            .ok_or_else(|| ServiceError::connection(PROVIDER, "not connected"))?;
        client
            .send_audio(audio)
            .await
            .map_err(|e| ServiceError::connection(PROVIDER, e))
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.close().await {
                tracing::debug!("Deepgram connection already closed: {}", e);
            }
        }
    }
}

/// Collects final results until Deepgram reports the end of speech.
///
/// Final fragments accumulate; `speech_final` or an `UtteranceEnd` that
/// arrives before speech was final emits the accumulated text as one
/// transcript. Interim results are reported as utterances.
#[derive(Default)]
struct TranscriptAccumulator {
    pending: String,
    speech_final: bool,
}

impl TranscriptAccumulator {
    fn take(&mut self) -> TranscriptEvent {
        TranscriptEvent::Final(std::mem::take(&mut self.pending))
    }
}

impl EventHandler for TranscriptAccumulator {
    type Raw = LiveEvent;
    type Event = TranscriptEvent;

    fn on_event(&mut self, raw: LiveEvent) -> Vec<TranscriptEvent> {
        match raw {
            LiveEvent::Message(LiveMessage::Results(results)) => {
                let text = results.transcript().trim();
                if text.is_empty() {
                    return Vec::new();
                }
                if !results.is_final {
                    return vec![TranscriptEvent::Utterance(text.to_string())];
                }
                if !self.pending.is_empty() {
                    self.pending.push(' ');
                }
                self.pending.push_str(text);
                if results.speech_final {
                    self.speech_final = true;
                    vec![self.take()]
                } else {
                    self.speech_final = false;
                    Vec::new()
                }
            }
            LiveEvent::Message(LiveMessage::UtteranceEnd(_)) => {
                if self.speech_final || self.pending.is_empty() {
                    return Vec::new();
                }
                tracing::info!("utterance ended before speech was final: {}", self.pending);
                self.speech_final = true;
                vec![self.take()]
            }
            LiveEvent::Message(_) => Vec::new(),
            LiveEvent::Closed(reason) => {
                tracing::info!("Deepgram stream closed: {:?}", reason);
                vec![TranscriptEvent::StreamClosed]
            }
            LiveEvent::Error(message) => {
                vec![TranscriptEvent::Error(ServiceError::connection(PROVIDER, message))]
            }
        }
    }
}
