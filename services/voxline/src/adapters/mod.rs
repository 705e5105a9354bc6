//! Provider adapters: each one wraps a vendor client and exposes it through
//! a capability trait from `voxline-core`, translating the vendor's event
//! shapes with an [`EventHandler`](voxline_core::normalizer::EventHandler).

pub mod assistant;
pub mod deepgram_stt;
pub mod deepgram_tts;
pub mod elevenlabs_tts;
pub mod gemini;
pub mod openai;

use tokio::sync::mpsc;
use voxline_core::generic_types::EventRx;
use voxline_core::normalizer::NormalizedEvent;

pub use assistant::AssistantChat;
pub use deepgram_stt::DeepgramTranscription;
pub use deepgram_tts::DeepgramVoice;
pub use elevenlabs_tts::ElevenLabsVoice;
pub use gemini::GeminiChat;
pub use openai::OpenAiChat;

/// A stream that reports one error and closes.
///
/// Used when a turn fails before the provider streamed anything, so callers
/// see the same error shape as a mid-stream failure.
pub(crate) fn failed_stream<E: NormalizedEvent>(error: E) -> EventRx<E> {
    let (tx, rx) = mpsc::channel(2);
    let _ = tx.try_send(error);
    let _ = tx.try_send(E::stream_closed());
    rx
}
