//! Minimal ElevenLabs streaming text-to-speech client.

use secrecy::{ExposeSecret, SecretString};

pub const BASE_URL: &str = "https://api.elevenlabs.io/v1";
pub const DEFAULT_MODEL_ID: &str = "eleven_turbo_v2";
const API_KEY_HEADER: &str = "xi-api-key";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, serde::Serialize)]
struct SynthesisRequest<'a> {
    model_id: &'a str,
    text: &'a str,
}

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model_id: String,
}

impl Client {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            api_key,
            model_id: DEFAULT_MODEL_ID.to_string(),
        }
    }

    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn stream_url(&self, voice_id: &str) -> String {
        format!(
            "{}/text-to-speech/{}/stream?output_format=ulaw_8000&optimize_streaming_latency=4",
            self.base_url, voice_id
        )
    }

    /// Synthesizes `text` in `voice_id`, returning 8 kHz mu-law audio.
    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .http
            .post(self.stream_url(voice_id))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(&SynthesisRequest {
                model_id: &self.model_id,
                text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("ElevenLabs request failed with {}: {}", status, body);
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::RateLimited(body));
            }
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
