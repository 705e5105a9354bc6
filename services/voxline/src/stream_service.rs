//! Ordered playback of synthesized audio onto the Twilio media stream.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use twilio::OutboundMessage;
use uuid::Uuid;
use voxline_core::generic_types::AudioFrame;
use voxline_utils::audio::encode_payload;

#[derive(Debug, thiserror::Error)]
#[error("media stream writer is gone")]
pub struct MediaStreamClosed;

/// Sends audio frames to the caller in partial-response order.
///
/// Frames without an index bypass the ordering. Each frame that goes out is
/// followed by a `mark` whose label is returned to the caller; Twilio echoes
/// it once the audio has played.
pub struct StreamService {
    stream_sid: String,
    outbound: mpsc::Sender<OutboundMessage>,
    expected_index: u32,
    pending: BTreeMap<u32, AudioFrame>,
}

impl StreamService {
    pub fn new(stream_sid: impl Into<String>, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            outbound,
            expected_index: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    pub fn expected_index(&self) -> u32 {
        self.expected_index
    }

    /// Queues `frame`, sending it and any buffered successors once its turn
    /// comes. Returns the mark labels of everything sent.
    pub async fn buffer(&mut self, frame: AudioFrame) -> Result<Vec<String>, MediaStreamClosed> {
        let mut marks = Vec::new();
        match frame.index {
            None => marks.extend(self.send_audio(frame).await?),
            Some(index) if index == self.expected_index => {
                marks.extend(self.send_audio(frame).await?);
                self.expected_index += 1;
                while let Some(next) = self.pending.remove(&self.expected_index) {
                    marks.extend(self.send_audio(next).await?);
                    self.expected_index += 1;
                }
            }
            Some(index) if index < self.expected_index => {
                tracing::warn!("dropping stale audio frame {} ({})", index, frame.label);
            }
            Some(index) => {
                self.pending.insert(index, frame);
            }
        }
        Ok(marks)
    }

    /// Forgets buffered frames and expects index 0 next.
    pub fn reset(&mut self) {
        self.expected_index = 0;
        self.pending.clear();
    }

    /// Tells Twilio to drop audio it has not played yet.
    pub async fn clear(&self) -> Result<(), MediaStreamClosed> {
        self.send(OutboundMessage::clear(&self.stream_sid)).await
    }

    async fn send_audio(&self, frame: AudioFrame) -> Result<Option<String>, MediaStreamClosed> {
        if frame.payload.is_empty() {
            return Ok(None);
        }
        self.send(OutboundMessage::media(
            &self.stream_sid,
            encode_payload(&frame.payload),
        ))
        .await?;

        let label = Uuid::new_v4().to_string();
        self.send(OutboundMessage::mark(&self.stream_sid, &label)).await?;
        tracing::debug!("sent audio {:?} \"{}\" as mark {}", frame.index, frame.label, label);
        Ok(Some(label))
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), MediaStreamClosed> {
        self.outbound.send(message).await.map_err(|_| MediaStreamClosed)
    }
}
