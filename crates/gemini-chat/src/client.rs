use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use voxline_utils::sse::SseDecoder;

use crate::types::{GenerateContentRequest, GenerateContentResponse};

pub const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const API_KEY_HEADER: &str = "x-goog-api-key";

pub type ResponseRx = mpsc::Receiver<Result<GenerateContentResponse, Error>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait GenerateApi: Send + Sync {
    async fn stream_generate(&self, request: GenerateContentRequest) -> Result<ResponseRx, Error>;
}

/// A client for the Gemini `streamGenerateContent` endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl GenerateApi for GeminiClient {
    async fn stream_generate(&self, request: GenerateContentRequest) -> Result<ResponseRx, Error> {
        let response = self
            .http
            .post(self.stream_url())
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Gemini request failed with {}: {}", status, body);
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::RateLimited(body));
            }
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut pending = Vec::new();

            loop {
                match body.next().await {
                    Some(Ok(bytes)) => pending.extend(decoder.push(&bytes)),
                    Some(Err(e)) => {
                        tracing::error!("failed to read Gemini stream: {}", e);
                        let _ = tx.send(Err(Error::Http(e))).await;
                        return;
                    }
                    None => {
                        pending.extend(decoder.finish());
                        break;
                    }
                }
                if !forward(&tx, &mut pending).await {
                    return;
                }
            }
            forward(&tx, &mut pending).await;
        });

        Ok(rx)
    }
}

/// Sends every decoded event; `false` once the receiver is gone.
async fn forward(
    tx: &mpsc::Sender<Result<GenerateContentResponse, Error>>,
    events: &mut Vec<voxline_utils::sse::SseEvent>,
) -> bool {
    for event in events.drain(..) {
        let item = serde_json::from_str::<GenerateContentResponse>(&event.data)
            .map_err(|e| Error::InvalidResponse(e.to_string()));
        if tx.send(item).await.is_err() {
            tracing::warn!("Gemini response receiver dropped, stopping reader task.");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_targets_the_model() {
        let client = GeminiClient::new("key".to_string().into())
            .with_model("gemini-1.5-pro")
            .with_base_url("http://localhost:9000/v1beta/");
        assert_eq!(
            client.stream_url(),
            "http://localhost:9000/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(client.model(), "gemini-1.5-pro");
    }
}
