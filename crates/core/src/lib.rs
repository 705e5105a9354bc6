pub mod call_context;
pub mod error;
pub mod generic_types;
pub mod llm_api;
pub mod normalizer;
pub mod sentence;
pub mod stt_api;
pub mod tools;
pub mod tts_api;
pub mod turn;

use generic_types::TextChunk;
use tools::ToolControl;

/// Commands that a running LLM turn issues to the call pipeline.
///
/// The turn driver only decides what should happen; the pipeline owns the
/// side effects (synthesizing speech, hanging up).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Speak the given chunk to the caller.
    Speak(TextChunk),
    /// A tool ended the conversation; no further turns should run.
    SessionComplete(ToolControl),
}
