use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::{Error, consts};

/// Query options of a live transcription session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveOptions {
    pub model: String,
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub punctuate: bool,
    pub interim_results: bool,
    pub endpointing: u32,
    pub utterance_end_ms: u32,
}

impl Default for LiveOptions {
    /// Telephony defaults: 8 kHz mono mu-law with interim results.
    fn default() -> Self {
        Self {
            model: consts::DEFAULT_LIVE_MODEL.to_string(),
            language: "en-US".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            channels: 1,
            punctuate: true,
            interim_results: true,
            endpointing: 200,
            utterance_end_ms: 1000,
        }
    }
}

impl LiveOptions {
    pub fn to_query(&self) -> String {
        format!(
            "model={}&language={}&encoding={}&sample_rate={}&channels={}&punctuate={}&interim_results={}&endpointing={}&utterance_end_ms={}",
            self.model,
            self.language,
            self.encoding,
            self.sample_rate,
            self.channels,
            self.punctuate,
            self.interim_results,
            self.endpointing,
            self.utterance_end_ms
        )
    }
}

#[derive(Clone)]
pub struct LiveConfig {
    base_url: String,
    api_key: SecretString,
    options: LiveOptions,
}

impl LiveConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            base_url: consts::LIVE_BASE_URL.to_string(),
            api_key,
            options: LiveOptions::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_options(mut self, options: LiveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn url(&self) -> String {
        format!("{}/listen?{}", self.base_url, self.options.to_query())
    }
}

fn build_request(config: &LiveConfig) -> Result<Request, Error> {
    let mut request = config.url().into_client_request()?;
    let token = format!("Token {}", config.api_key.expose_secret());
    let value = HeaderValue::from_str(&token)
        .map_err(|e| Error::InvalidRequest(format!("authorization header: {e}")))?;
    request
        .headers_mut()
        .insert(consts::AUTHORIZATION_HEADER, value);
    Ok(request)
}

/// Messages Deepgram sends on a live connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum LiveMessage {
    Results(ResultsMessage),
    UtteranceEnd(UtteranceEndMessage),
    Metadata(MetadataMessage),
    SpeechStarted(SpeechStartedMessage),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultsMessage {
    pub channel: Channel,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub speech_final: bool,
}

impl ResultsMessage {
    /// Transcript of the top alternative.
    pub fn transcript(&self) -> &str {
        self.channel
            .alternatives
            .first()
            .map(|a| a.transcript.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UtteranceEndMessage {
    #[serde(default)]
    pub last_word_end: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetadataMessage {
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeechStartedMessage {
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Message(LiveMessage),
    Closed(Option<String>),
    Error(String),
}

enum Outgoing {
    Audio(Vec<u8>),
    Close,
}

/// Sending half of a live transcription connection.
pub struct LiveClient {
    tx: mpsc::Sender<Outgoing>,
}

impl LiveClient {
    pub async fn send_audio(&self, audio: Vec<u8>) -> Result<(), Error> {
        self.tx
            .send(Outgoing::Audio(audio))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Asks Deepgram to flush pending results and close the stream.
    pub async fn close(&self) -> Result<(), Error> {
        self.tx
            .send(Outgoing::Close)
            .await
            .map_err(|_| Error::NotConnected)
    }
}

/// Opens a live transcription connection.
///
/// Returns the sending half and a receiver of everything Deepgram reports.
/// The receiver always ends with [`LiveEvent::Closed`] or [`LiveEvent::Error`].
pub async fn connect(config: LiveConfig) -> Result<(LiveClient, mpsc::Receiver<LiveEvent>), Error> {
    let request = build_request(&config)?;
    let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
    tracing::info!("connected to Deepgram live ({})", config.options.model);

    let (mut write, mut read) = ws_stream.split();
    let (c_tx, mut c_rx) = mpsc::channel::<Outgoing>(256);
    let (s_tx, s_rx) = mpsc::channel(128);

    tokio::spawn(async move {
        while let Some(outgoing) = c_rx.recv().await {
            let (message, last) = match outgoing {
                Outgoing::Audio(audio) => (Message::Binary(audio), false),
                Outgoing::Close => (Message::Text(consts::CLOSE_STREAM.to_string()), true),
            };
            if let Err(e) = write.send(message).await {
                tracing::error!("failed to send message: {}", e);
                break;
            }
            if last {
                break;
            }
        }
        tracing::debug!("Deepgram writer finished");
    });

    tokio::spawn(async move {
        let mut terminal = None;
        while let Some(message) = read.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("failed to read message: {}", e);
                    terminal = Some(LiveEvent::Error(e.to_string()));
                    break;
                }
            };
            match message {
                Message::Text(text) => match serde_json::from_str::<LiveMessage>(&text) {
                    Ok(parsed) => {
                        if s_tx.send(LiveEvent::Message(parsed)).await.is_err() {
                            tracing::warn!("Deepgram event receiver dropped, stopping reader task.");
                            return;
                        }
                    }
                    Err(e) => tracing::error!("failed to deserialize message: {}, text=> {:?}", e, text),
                },
                Message::Close(reason) => {
                    tracing::info!("connection closed: {:?}", reason);
                    terminal = Some(LiveEvent::Closed(reason.map(|r| r.reason.to_string())));
                    break;
                }
                Message::Binary(bin) => {
                    tracing::warn!("unexpected binary message: {} bytes", bin.len());
                }
                _ => {}
            }
        }
        let _ = s_tx.send(terminal.unwrap_or(LiveEvent::Closed(None))).await;
    });

    Ok((LiveClient { tx: c_tx }, s_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_telephony_options() {
        let config = LiveConfig::new("key".to_string().into()).with_base_url("ws://localhost:1234/v1/");
        assert_eq!(
            config.url(),
            "ws://localhost:1234/v1/listen?model=nova-2&language=en-US&encoding=mulaw&sample_rate=8000&channels=1&punctuate=true&interim_results=true&endpointing=200&utterance_end_ms=1000"
        );
    }

    #[test]
    fn request_uses_token_auth() {
        let config = LiveConfig::new("secret".to_string().into());
        let request = build_request(&config).unwrap();
        assert_eq!(request.headers()["Authorization"], "Token secret");
    }

    #[test]
    fn parses_live_messages() {
        let results = r#"{"type":"Results","channel_index":[0,1],"duration":1.2,"start":0.0,"is_final":true,"speech_final":false,"channel":{"alternatives":[{"transcript":"hello there","confidence":0.98,"words":[]}]}}"#;
        match serde_json::from_str::<LiveMessage>(results).unwrap() {
            LiveMessage::Results(r) => {
                assert_eq!(r.transcript(), "hello there");
                assert!(r.is_final);
                assert!(!r.speech_final);
            }
            other => panic!("unexpected {other:?}"),
        }

        let end = r#"{"type":"UtteranceEnd","channel":[0,1],"last_word_end":2.5}"#;
        assert!(matches!(
            serde_json::from_str::<LiveMessage>(end).unwrap(),
            LiveMessage::UtteranceEnd(_)
        ));

        let other = r#"{"type":"Warning","description":"slow"}"#;
        assert_eq!(serde_json::from_str::<LiveMessage>(other).unwrap(), LiveMessage::Unknown);
    }
}
