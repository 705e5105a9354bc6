//! Application Configuration Module
//!
//! Settings are read once at startup from the environment (and a `.env` file
//! when present) into a single [`Config`] that is passed down explicitly.

use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::SecretString;
use tracing::Level;

use crate::factory::{LlmProvider, TtsProvider};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";
pub const DEFAULT_DATABASE_PATH: &str = "voxline.db";
pub const DEFAULT_PROMPTS_DIR: &str = "prompts";
pub const DEFAULT_ELEVENLABS_MODEL: &str = "eleven_turbo_v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Public host name Twilio reaches us on, without scheme.
    pub server: String,
    pub llm_provider: LlmProvider,
    pub tts_provider: TtsProvider,
    pub openai_api_key: Option<SecretString>,
    pub openai_model: String,
    pub assistant_id: Option<String>,
    pub gemini_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub deepgram_api_key: Option<SecretString>,
    pub deepgram_voice: String,
    pub elevenlabs_api_key: Option<SecretString>,
    pub elevenlabs_voice_id: Option<String>,
    pub elevenlabs_model_id: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: SecretString,
    pub app_number: Option<String>,
    pub transfer_number: Option<String>,
    /// Overrides `system_message.md` when set.
    pub system_message: Option<String>,
    /// Overrides `initial_message.md` when set.
    pub initial_message: Option<String>,
    pub database_path: String,
    pub prompts_dir: PathBuf,
    pub log_level: Level,
    pub log_format: LogFormat,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Unknown {kind} provider: {key}")]
    UnknownProvider { kind: &'static str, key: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `LLM_SERVICE`: `openai` (default), `gemini` or `assistant`.
    /// *   `TTS_SERVICE`: `deepgram` (default) or `elevenlabs`.
    /// *   `OPENAI_API_KEY`, `OPENAI_MODEL`, `ASSISTANT_ID`: OpenAI chat and Assistants.
    /// *   `GEMINI_API_KEY`, `GEMINI_MODEL`: Gemini.
    /// *   `DEEPGRAM_API_KEY`: required, used for transcription and Deepgram speech.
    /// *   `VOICE_MODEL`: Deepgram voice. Defaults to `aura-asteria-en`.
    /// *   `ELEVENLABS_API_KEY`, `ELEVENLABS_VOICE_ID`, `ELEVENLABS_MODEL_ID`: ElevenLabs.
    /// *   `TWILIO_ACCOUNT_SID`, `TWILIO_AUTH_TOKEN`: required.
    /// *   `APP_NUMBER`, `TRANSFER_NUMBER`: caller id for outbound calls and the transfer target.
    /// *   `SERVER`: public host name for TwiML and call callbacks.
    /// *   `SYSTEM_MESSAGE`, `INITIAL_MESSAGE`: prompt overrides.
    /// *   `BIND_ADDRESS` (or `PORT`), `DATABASE_PATH`, `PROMPTS_DIR`.
    /// *   `RUST_LOG`: log level, defaults to `INFO`. `LOG_FORMAT=json` switches to JSON output.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| var(key).map(SecretString::from);
        let required = |key: &str| var(key).ok_or_else(|| ConfigError::MissingVar(key.to_string()));

        let bind_address_str = match (var("BIND_ADDRESS"), var("PORT")) {
            (Some(address), _) => address,
            (None, Some(port)) => format!("0.0.0.0:{port}"),
            (None, None) => DEFAULT_BIND_ADDRESS.to_string(),
        };
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let llm_key = var("LLM_SERVICE").unwrap_or_else(|| "openai".to_string());
        let llm_provider =
            LlmProvider::from_key(&llm_key).map_err(|_| ConfigError::UnknownProvider {
                kind: "LLM",
                key: llm_key.clone(),
            })?;
        let tts_key = var("TTS_SERVICE").unwrap_or_else(|| "deepgram".to_string());
        let tts_provider =
            TtsProvider::from_key(&tts_key).map_err(|_| ConfigError::UnknownProvider {
                kind: "TTS",
                key: tts_key.clone(),
            })?;

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;
        let log_format = match var("LOG_FORMAT").map(|f| f.to_lowercase()).as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "LOG_FORMAT".to_string(),
                    format!("'{other}' is not one of text, json"),
                ));
            }
        };

        let config = Self {
            bind_address,
            server: strip_scheme(&var("SERVER").unwrap_or_default()),
            llm_provider,
            tts_provider,
            openai_api_key: secret("OPENAI_API_KEY"),
            openai_model: var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            assistant_id: var("ASSISTANT_ID"),
            gemini_api_key: secret("GEMINI_API_KEY"),
            gemini_model: var("GEMINI_MODEL")
                .unwrap_or_else(|| gemini_chat::DEFAULT_MODEL.to_string()),
            deepgram_api_key: secret("DEEPGRAM_API_KEY"),
            deepgram_voice: var("VOICE_MODEL")
                .unwrap_or_else(|| deepgram::SpeakClient::default_model().to_string()),
            elevenlabs_api_key: secret("ELEVENLABS_API_KEY"),
            elevenlabs_voice_id: var("ELEVENLABS_VOICE_ID"),
            elevenlabs_model_id: var("ELEVENLABS_MODEL_ID")
                .unwrap_or_else(|| DEFAULT_ELEVENLABS_MODEL.to_string()),
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: SecretString::from(required("TWILIO_AUTH_TOKEN")?),
            app_number: var("APP_NUMBER"),
            transfer_number: var("TRANSFER_NUMBER"),
            system_message: var("SYSTEM_MESSAGE"),
            initial_message: var("INITIAL_MESSAGE"),
            database_path: var("DATABASE_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            prompts_dir: PathBuf::from(
                var("PROMPTS_DIR").unwrap_or_else(|| DEFAULT_PROMPTS_DIR.to_string()),
            ),
            log_level,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks that the selected providers have their credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = |name: &str, provider: &str| {
            ConfigError::MissingVar(format!("{name} must be set for '{provider}' provider"))
        };

        match self.llm_provider {
            LlmProvider::OpenAI if self.openai_api_key.is_none() => {
                return Err(missing("OPENAI_API_KEY", "openai"));
            }
            LlmProvider::Assistant if self.openai_api_key.is_none() => {
                return Err(missing("OPENAI_API_KEY", "assistant"));
            }
            LlmProvider::Assistant if self.assistant_id.is_none() => {
                return Err(missing("ASSISTANT_ID", "assistant"));
            }
            LlmProvider::Gemini if self.gemini_api_key.is_none() => {
                return Err(missing("GEMINI_API_KEY", "gemini"));
            }
            _ => {}
        }

        match self.tts_provider {
            TtsProvider::ElevenLabs if self.elevenlabs_api_key.is_none() => {
                return Err(missing("ELEVENLABS_API_KEY", "elevenlabs"));
            }
            TtsProvider::ElevenLabs if self.elevenlabs_voice_id.is_none() => {
                return Err(missing("ELEVENLABS_VOICE_ID", "elevenlabs"));
            }
            _ => {}
        }

        if self.deepgram_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "DEEPGRAM_API_KEY must be set for transcription".to_string(),
            ));
        }

        Ok(())
    }

    /// TwiML stream target for inbound calls.
    pub fn stream_url(&self) -> String {
        format!("wss://{}/connection", self.server)
    }

    /// Webhook Twilio fetches when an outbound call is answered.
    pub fn incoming_url(&self) -> String {
        format!("https://{}/incoming", self.server)
    }
}

fn strip_scheme(server: &str) -> String {
    server
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("TWILIO_ACCOUNT_SID", "AC123"),
        ("TWILIO_AUTH_TOKEN", "token"),
        ("OPENAI_API_KEY", "sk-test"),
        ("DEEPGRAM_API_KEY", "dg-test"),
    ];

    fn with(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut vars = BASE.to_vec();
        vars.extend_from_slice(extra);
        vars
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let config = Config::from_lookup(lookup(BASE)).unwrap();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS.parse().unwrap());
        assert_eq!(config.llm_provider, LlmProvider::OpenAI);
        assert_eq!(config.tts_provider, TtsProvider::Deepgram);
        assert_eq!(config.openai_model, "gpt-4o");
        assert_eq!(config.deepgram_voice, "aura-asteria-en");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.prompts_dir, PathBuf::from("prompts"));
    }

    #[test]
    fn port_is_used_when_no_bind_address_is_given() {
        let config = Config::from_lookup(lookup(&with(&[("PORT", "8080")]))).unwrap();
        assert_eq!(config.bind_address.port(), 8080);
    }

    #[test]
    fn server_scheme_is_stripped() {
        let config =
            Config::from_lookup(lookup(&with(&[("SERVER", "https://abc.ngrok.app/")]))).unwrap();
        assert_eq!(config.stream_url(), "wss://abc.ngrok.app/connection");
        assert_eq!(config.incoming_url(), "https://abc.ngrok.app/incoming");
    }

    #[test]
    fn provider_keys_are_case_insensitive() {
        let config = Config::from_lookup(lookup(&with(&[
            ("LLM_SERVICE", "Gemini"),
            ("GEMINI_API_KEY", "g-test"),
            ("TTS_SERVICE", "ELEVENLABS"),
            ("ELEVENLABS_API_KEY", "el-test"),
            ("ELEVENLABS_VOICE_ID", "voice"),
        ])))
        .unwrap();
        assert_eq!(config.llm_provider, LlmProvider::Gemini);
        assert_eq!(config.tts_provider, TtsProvider::ElevenLabs);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = Config::from_lookup(lookup(&with(&[("LLM_SERVICE", "bard")]))).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { kind: "LLM", .. }));
    }

    #[test]
    fn missing_credentials_for_the_selected_provider_are_rejected() {
        let err = Config::from_lookup(lookup(&with(&[("LLM_SERVICE", "assistant")]))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref m) if m.contains("ASSISTANT_ID")));

        let err = Config::from_lookup(lookup(&with(&[("TTS_SERVICE", "elevenlabs")]))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref m) if m.contains("ELEVENLABS_API_KEY")));

        let err = Config::from_lookup(lookup(&BASE[..3])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref m) if m.contains("DEEPGRAM_API_KEY")));
    }

    #[test]
    fn twilio_credentials_are_required() {
        let err = Config::from_lookup(lookup(&BASE[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref m) if m == "TWILIO_ACCOUNT_SID"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = Config::from_lookup(lookup(&with(&[("RUST_LOG", "loud")]))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "RUST_LOG"));

        let err = Config::from_lookup(lookup(&with(&[("LOG_FORMAT", "xml")]))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "LOG_FORMAT"));

        let err = Config::from_lookup(lookup(&with(&[("BIND_ADDRESS", "nowhere")]))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "BIND_ADDRESS"));
    }
}
