pub const LIVE_BASE_URL: &str = "wss://api.deepgram.com/v1";
pub const REST_BASE_URL: &str = "https://api.deepgram.com/v1";

pub const AUTHORIZATION_HEADER: &str = "Authorization";

pub const DEFAULT_LIVE_MODEL: &str = "nova-2";
pub const DEFAULT_SPEAK_MODEL: &str = "aura-asteria-en";

pub const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;
