use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::ServiceError;
use crate::generic_types::{AudioFrame, EventRx, SpeechEvent, TextChunk};
use crate::normalizer::{EventHandler, EventNormalizer};

/// A streaming text-to-speech session for one call.
///
/// Text chunks go in, audio frames come out in the same order. When the text
/// channel closes, the stream ends with `TurnComplete` and `StreamClosed`.
/// A failed request is terminal: `Error` then `StreamClosed`.
#[async_trait]
pub trait TtsService: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Changes the voice used for chunks synthesized from now on.
    fn set_voice(&self, voice: &str);

    async fn stream_speech(
        &self,
        text_rx: mpsc::Receiver<TextChunk>,
    ) -> Result<EventRx<SpeechEvent>, ServiceError>;

    async fn disconnect(&self);
}

/// A request/response synthesis backend producing one clip per call.
#[async_trait]
pub trait ClipSynthesizer: Send + Sync + 'static {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Adapts a [`ClipSynthesizer`] into a streaming [`TtsService`].
pub struct SynthesizedSpeech<S: ClipSynthesizer> {
    provider: &'static str,
    synthesizer: Arc<S>,
    voice: Arc<RwLock<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ClipSynthesizer> SynthesizedSpeech<S> {
    pub fn new(provider: &'static str, synthesizer: S, voice: impl Into<String>) -> Self {
        Self {
            provider,
            synthesizer: Arc::new(synthesizer),
            voice: Arc::new(RwLock::new(voice.into())),
            worker: Mutex::new(None),
        }
    }

    pub fn voice(&self) -> String {
        current_voice(&self.voice)
    }
}

fn current_voice(voice: &RwLock<String>) -> String {
    match voice.read() {
        Ok(v) => v.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Maps each synthesis result onto speech events.
struct ClipEvents;

impl EventHandler for ClipEvents {
    type Raw = Result<AudioFrame, ServiceError>;
    type Event = SpeechEvent;

    fn on_event(&mut self, raw: Self::Raw) -> Vec<SpeechEvent> {
        match raw {
            Ok(frame) => vec![SpeechEvent::Audio(frame)],
            Err(e) => vec![SpeechEvent::Error(e)],
        }
    }

    fn on_end(&mut self) -> Vec<SpeechEvent> {
        vec![SpeechEvent::TurnComplete]
    }
}

#[async_trait]
impl<S: ClipSynthesizer> TtsService for SynthesizedSpeech<S> {
    fn provider(&self) -> &'static str {
        self.provider
    }

    fn set_voice(&self, voice: &str) {
        match self.voice.write() {
            Ok(mut v) => *v = voice.to_string(),
            Err(poisoned) => *poisoned.into_inner() = voice.to_string(),
        }
    }

    async fn stream_speech(
        &self,
        mut text_rx: mpsc::Receiver<TextChunk>,
    ) -> Result<EventRx<SpeechEvent>, ServiceError> {
        let (tx, rx) = mpsc::channel(128);
        let synthesizer = self.synthesizer.clone();
        let voice = self.voice.clone();
        let provider = self.provider;

        let task = tokio::spawn(async move {
            let mut normalizer = EventNormalizer::new(ClipEvents);

            while let Some(chunk) = text_rx.recv().await {
                let text = chunk.text.trim();
                if text.is_empty() {
                    continue;
                }
                let voice = current_voice(&voice);
                let result = synthesizer
                    .synthesize(text, &voice)
                    .await
                    .map(|payload| AudioFrame {
                        index: chunk.index,
                        payload,
                        label: text.to_string(),
                    });
                if let Err(e) = &result {
                    tracing::error!("{} synthesis failed: {}", provider, e);
                }

                for event in normalizer.push(result) {
                    if tx.send(event).await.is_err() {
                        tracing::warn!("Speech event receiver dropped, stopping {} worker.", provider);
                        return;
                    }
                }
                if normalizer.is_closed() {
                    return;
                }
            }

            for event in normalizer.finish() {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.worker.lock().await.replace(task) {
            previous.abort();
        }

        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
            tracing::debug!("{} speech worker stopped", self.provider);
        }
    }
}
