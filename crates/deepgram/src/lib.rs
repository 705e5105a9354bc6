mod consts;
pub mod live;
pub mod speak;

pub use live::{LiveClient, LiveConfig, LiveEvent, LiveMessage, LiveOptions, connect};
pub use speak::SpeakClient;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not connected")]
    NotConnected,
}
