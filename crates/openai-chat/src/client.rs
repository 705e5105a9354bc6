use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use voxline_utils::sse::{SseDecoder, SseEvent};

use crate::types::{self, AssistantStreamEvent, ChatCompletionChunk, ChatRequest, ToolOutput};

mod assistants;
mod config;
mod consts;
mod stats;

pub use config::{Config, ConfigBuilder};
pub use stats::Stats;

pub type ChunkRx = mpsc::Receiver<Result<ChatCompletionChunk, Error>>;
pub type RunRx = mpsc::Receiver<Result<AssistantStreamEvent, Error>>;

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

/// Streaming chat completions.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkRx, Error>;
}

/// The subset of the Assistants API used for voice conversations.
#[async_trait]
pub trait AssistantsApi: Send + Sync {
    async fn create_thread(&self) -> Result<String, Error>;

    async fn add_message(&self, thread_id: &str, content: &str) -> Result<(), Error>;

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: Option<String>,
    ) -> Result<RunRx, Error>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunRx, Error>;

    /// Cancels a run and waits until it no longer blocks the thread.
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), Error>;
}

pub struct Client {
    http: reqwest::Client,
    config: Config,
    stats: Arc<Mutex<Stats>>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> Stats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url(), path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .bearer_auth(self.config.api_key().expose_secret())
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .bearer_auth(self.config.api_key().expose_secret())
    }
}

#[async_trait]
impl ChatApi for Client {
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkRx, Error> {
        tracing::debug!(
            "chat completion: model={}, messages={}, tools={}",
            request.model(),
            request.messages().len(),
            request.tools().len()
        );
        let response = self.post("chat/completions").json(&request).send().await?;
        let response = check_status(response).await?;

        let stats = self.stats.clone();
        Ok(spawn_sse(response, move |event| {
            match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                Ok(chunk) => {
                    if let Some(usage) = &chunk.usage {
                        record_usage(&stats, usage);
                    }
                    Some(Ok(chunk))
                }
                Err(e) => Some(Err(Error::InvalidResponse(e.to_string()))),
            }
        }))
    }
}

fn record_usage(stats: &Mutex<Stats>, usage: &types::Usage) {
    match stats.lock() {
        Ok(mut guard) => guard.update_usage(
            usage.total_tokens,
            usage.prompt_tokens,
            usage.completion_tokens,
        ),
        Err(_) => tracing::error!("failed to update stats"),
    }
    tracing::debug!(
        "total_tokens: {}, prompt_tokens: {}, completion_tokens: {}",
        usage.total_tokens,
        usage.prompt_tokens,
        usage.completion_tokens
    );
}

/// Maps 429 to [`Error::RateLimited`] and every other failure to [`Error::Api`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited(body));
    }
    Err(Error::Api {
        status: status.as_u16(),
        body,
    })
}

/// Reads an event-stream body on a background task, parsing each event.
///
/// `parse` returning `None` skips the event. The stream ends at `[DONE]`,
/// at the end of the body, or when the receiver is dropped.
fn spawn_sse<T, F>(response: reqwest::Response, mut parse: F) -> mpsc::Receiver<Result<T, Error>>
where
    T: Send + 'static,
    F: FnMut(SseEvent) -> Option<Result<T, Error>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(consts::CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("failed to read event stream: {}", e);
                    let _ = tx.send(Err(Error::Http(e))).await;
                    return;
                }
            };
            for event in decoder.push(&bytes) {
                if event.is_done() {
                    return;
                }
                if let Some(item) = parse(event) {
                    if tx.send(item).await.is_err() {
                        tracing::warn!("event stream receiver dropped, stopping reader task.");
                        return;
                    }
                }
            }
        }

        if let Some(event) = decoder.finish() {
            if !event.is_done() {
                if let Some(item) = parse(event) {
                    let _ = tx.send(item).await;
                }
            }
        }
    });

    rx
}
