use secrecy::{ExposeSecret, SecretString};

use crate::{Error, consts};

#[derive(serde::Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
}

/// REST text-to-speech returning 8 kHz mu-law clips.
pub struct SpeakClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl SpeakClient {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: consts::REST_BASE_URL.to_string(),
            api_key,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn default_model() -> &'static str {
        consts::DEFAULT_SPEAK_MODEL
    }

    fn speak_url(&self, model: &str) -> String {
        format!(
            "{}/speak?model={}&encoding=mulaw&sample_rate=8000",
            self.base_url, model
        )
    }

    /// Synthesizes `text` with the given Aura model, returning raw audio.
    pub async fn speak(&self, text: &str, model: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .http
            .post(self.speak_url(model))
            .header(
                consts::AUTHORIZATION_HEADER,
                format!("Token {}", self.api_key.expose_secret()),
            )
            .json(&SpeakRequest { text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::RateLimited(body));
            }
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?;
        tracing::debug!("Deepgram speak returned {} bytes for {:?}", audio.len(), text);
        Ok(audio.to_vec())
    }
}
