//! Configuration-driven construction of provider services.
//!
//! Callers only ever see the capability traits; which vendor sits behind
//! them is decided here from the provider keys in [`Config`].

use std::sync::Arc;

use deepgram::{LiveConfig, SpeakClient};
use gemini_chat::GeminiClient;
use secrecy::SecretString;
use voxline_core::error::ServiceError;
use voxline_core::llm_api::LlmService;
use voxline_core::stt_api::TranscriptionService;
use voxline_core::tts_api::{SynthesizedSpeech, TtsService};

use crate::adapters::{
    AssistantChat, DeepgramTranscription, DeepgramVoice, ElevenLabsVoice, GeminiChat, OpenAiChat,
};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Assistant,
}

impl LlmProvider {
    /// Parses a provider key, ignoring case.
    pub fn from_key(key: &str) -> Result<Self, ServiceError> {
        match key.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "assistant" => Ok(Self::Assistant),
            other => Err(ServiceError::Configuration(format!(
                "unknown LLM service '{other}', expected one of openai, gemini, assistant"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    Deepgram,
    ElevenLabs,
}

impl TtsProvider {
    /// Parses a provider key, ignoring case.
    pub fn from_key(key: &str) -> Result<Self, ServiceError> {
        match key.trim().to_lowercase().as_str() {
            "deepgram" => Ok(Self::Deepgram),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(ServiceError::Configuration(format!(
                "unknown TTS service '{other}', expected one of deepgram, elevenlabs"
            ))),
        }
    }
}

/// Creates the per-call provider services.
///
/// Every call gets fresh instances; nothing is shared across calls.
pub trait ServiceFactory: Send + Sync {
    fn llm(&self) -> Result<Arc<dyn LlmService>, ServiceError>;
    fn tts(&self) -> Result<Arc<dyn TtsService>, ServiceError>;
    fn stt(&self) -> Result<Arc<dyn TranscriptionService>, ServiceError>;
}

fn credential<'a>(
    value: &'a Option<SecretString>,
    name: &str,
) -> Result<&'a SecretString, ServiceError> {
    value
        .as_ref()
        .ok_or_else(|| ServiceError::Configuration(format!("{name} is not set")))
}

/// Builds the LLM service for `provider`.
pub fn create_llm(provider: LlmProvider, config: &Config) -> Result<Arc<dyn LlmService>, ServiceError> {
    match provider {
        LlmProvider::OpenAI => {
            let client = openai_chat::Client::new(
                openai_chat::Config::builder()
                    .with_api_key(credential(&config.openai_api_key, "OPENAI_API_KEY")?.clone())
                    .with_model(&config.openai_model)
                    .build(),
            );
            Ok(Arc::new(OpenAiChat::new(client, &config.openai_model)))
        }
        LlmProvider::Assistant => {
            let api_key = credential(&config.openai_api_key, "OPENAI_API_KEY")?.clone();
            let assistant_id = config
                .assistant_id
                .as_deref()
                .ok_or_else(|| ServiceError::Configuration("ASSISTANT_ID is not set".into()))?;
            let client = openai_chat::Client::new(
                openai_chat::Config::builder().with_api_key(api_key).build(),
            );
            Ok(Arc::new(AssistantChat::new(client, assistant_id)))
        }
        LlmProvider::Gemini => {
            let client = GeminiClient::new(credential(&config.gemini_api_key, "GEMINI_API_KEY")?.clone())
                .with_model(&config.gemini_model);
            Ok(Arc::new(GeminiChat::new(client)))
        }
    }
}

/// Builds the TTS service for `provider`.
pub fn create_tts(provider: TtsProvider, config: &Config) -> Result<Arc<dyn TtsService>, ServiceError> {
    match provider {
        TtsProvider::Deepgram => {
            let client = SpeakClient::new(credential(&config.deepgram_api_key, "DEEPGRAM_API_KEY")?.clone());
            Ok(Arc::new(SynthesizedSpeech::new(
                "deepgram",
                DeepgramVoice::new(client),
                config.deepgram_voice.clone(),
            )))
        }
        TtsProvider::ElevenLabs => {
            let api_key = credential(&config.elevenlabs_api_key, "ELEVENLABS_API_KEY")?.clone();
            let voice_id = config
                .elevenlabs_voice_id
                .clone()
                .ok_or_else(|| ServiceError::Configuration("ELEVENLABS_VOICE_ID is not set".into()))?;
            let client = elevenlabs::Client::new(api_key).with_model_id(&config.elevenlabs_model_id);
            Ok(Arc::new(SynthesizedSpeech::new(
                "elevenlabs",
                ElevenLabsVoice::new(client),
                voice_id,
            )))
        }
    }
}

pub fn create_stt(config: &Config) -> Result<Arc<dyn TranscriptionService>, ServiceError> {
    let api_key = credential(&config.deepgram_api_key, "DEEPGRAM_API_KEY")?.clone();
    Ok(Arc::new(DeepgramTranscription::new(LiveConfig::new(api_key))))
}

/// The factory used in production: providers come from the loaded [`Config`].
pub struct ConfiguredFactory {
    config: Arc<Config>,
}

impl ConfiguredFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ServiceFactory for ConfiguredFactory {
    fn llm(&self) -> Result<Arc<dyn LlmService>, ServiceError> {
        create_llm(self.config.llm_provider, &self.config)
    }

    fn tts(&self) -> Result<Arc<dyn TtsService>, ServiceError> {
        create_tts(self.config.tts_provider, &self.config)
    }

    fn stt(&self) -> Result<Arc<dyn TranscriptionService>, ServiceError> {
        create_stt(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_from_key(key: &str, config: &Config) -> Result<Arc<dyn LlmService>, ServiceError> {
        create_llm(LlmProvider::from_key(key)?, config)
    }

    fn tts_from_key(key: &str, config: &Config) -> Result<Arc<dyn TtsService>, ServiceError> {
        create_tts(TtsProvider::from_key(key)?, config)
    }

    fn config() -> Config {
        Config::from_lookup(|key| match key {
            "TWILIO_ACCOUNT_SID" => Some("AC123".into()),
            "TWILIO_AUTH_TOKEN" => Some("token".into()),
            "OPENAI_API_KEY" => Some("sk-test".into()),
            "DEEPGRAM_API_KEY" => Some("dg-test".into()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn keys_are_case_insensitive() {
        assert_eq!(LlmProvider::from_key("OpenAI").unwrap(), LlmProvider::OpenAI);
        assert_eq!(LlmProvider::from_key(" assistant ").unwrap(), LlmProvider::Assistant);
        assert_eq!(TtsProvider::from_key("ElevenLabs").unwrap(), TtsProvider::ElevenLabs);
    }

    #[test]
    fn unknown_keys_are_configuration_errors() {
        let config = config();
        assert!(matches!(
            llm_from_key("bard", &config),
            Err(ServiceError::Configuration(_))
        ));
        assert!(matches!(
            tts_from_key("polly", &config),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[test]
    fn selected_providers_are_built() {
        let config = config();
        assert_eq!(llm_from_key("openai", &config).unwrap().provider(), "openai");
        assert_eq!(tts_from_key("deepgram", &config).unwrap().provider(), "deepgram");
        assert_eq!(create_stt(&config).unwrap().provider(), "deepgram");

        let factory = ConfiguredFactory::new(Arc::new(config));
        assert_eq!(factory.llm().unwrap().provider(), "openai");
        assert_eq!(factory.tts().unwrap().provider(), "deepgram");
    }

    #[test]
    fn missing_credentials_are_configuration_errors() {
        let config = config();
        let err = llm_from_key("gemini", &config).err().unwrap();
        assert_eq!(err, ServiceError::Configuration("GEMINI_API_KEY is not set".into()));

        let err = llm_from_key("assistant", &config).err().unwrap();
        assert_eq!(err, ServiceError::Configuration("ASSISTANT_ID is not set".into()));

        let err = tts_from_key("elevenlabs", &config).err().unwrap();
        assert_eq!(err, ServiceError::Configuration("ELEVENLABS_API_KEY is not set".into()));
    }
}
