use async_trait::async_trait;
use voxline_core::error::ServiceError;
use voxline_core::tts_api::ClipSynthesizer;

/// ElevenLabs streaming synthesis as a [`ClipSynthesizer`]. The voice is a voice id.
pub struct ElevenLabsVoice {
    client: elevenlabs::Client,
}

impl ElevenLabsVoice {
    pub fn new(client: elevenlabs::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClipSynthesizer for ElevenLabsVoice {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ServiceError> {
        self.client
            .synthesize(text, voice)
            .await
            .map_err(|e| match e {
                elevenlabs::Error::RateLimited(body) => {
                    ServiceError::rate_limited("elevenlabs", body)
                }
                other => ServiceError::connection("elevenlabs", other),
            })
    }
}
