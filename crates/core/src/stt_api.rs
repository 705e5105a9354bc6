use async_trait::async_trait;

use crate::error::ServiceError;
use crate::generic_types::{EventRx, TranscriptEvent};

/// A live speech-to-text session for one call.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Opens the upstream connection. Can be called once per instance.
    async fn connect(&self) -> Result<EventRx<TranscriptEvent>, ServiceError>;

    /// Forwards raw caller audio, in arrival order.
    async fn send(&self, audio: Vec<u8>) -> Result<(), ServiceError>;

    async fn disconnect(&self);
}
