use async_trait::async_trait;
use deepgram::SpeakClient;
use voxline_core::error::ServiceError;
use voxline_core::tts_api::ClipSynthesizer;
use voxline_utils::audio::{MULAW_SAMPLE_RATE, trim_leading};

/// Milliseconds cut from the start of every clip; Deepgram clips open with a click.
pub const LEADING_TRIM_MS: u32 = 10;

/// Deepgram Speak as a [`ClipSynthesizer`]. The voice is the Aura model name.
pub struct DeepgramVoice {
    client: SpeakClient,
}

impl DeepgramVoice {
    pub fn new(client: SpeakClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClipSynthesizer for DeepgramVoice {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ServiceError> {
        let audio = self.client.speak(text, voice).await.map_err(|e| match e {
            deepgram::Error::RateLimited(body) => ServiceError::rate_limited("deepgram", body),
            other => ServiceError::connection("deepgram", other),
        })?;
        Ok(trim_leading(&audio, LEADING_TRIM_MS, MULAW_SAMPLE_RATE).to_vec())
    }
}
