//! Normalization of provider event streams.
//!
//! Every provider reports progress in its own shape: SSE chunks, run events,
//! WebSocket messages. An [`EventHandler`] translates one raw provider event
//! into zero or more normalized events, and [`EventNormalizer`] wraps it to
//! enforce the stream rules every consumer relies on:
//!
//! - a turn completes at most once until new content arrives;
//! - an error is always followed by `StreamClosed`;
//! - nothing follows `StreamClosed`;
//! - a source that ends without closing gets a `StreamClosed`.

use tokio::sync::mpsc;

use crate::generic_types::EventRx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Content,
    TurnComplete,
    Error,
    StreamClosed,
}

/// A member of one of the normalized event taxonomies.
pub trait NormalizedEvent: Send + 'static {
    fn kind(&self) -> EventKind;

    /// A turn-complete that carries its own payload is never a duplicate.
    fn carries_content(&self) -> bool {
        false
    }

    fn stream_closed() -> Self;
}

/// Provider-specific translation of raw events.
pub trait EventHandler: Send + 'static {
    type Raw: Send + 'static;
    type Event: NormalizedEvent;

    fn on_event(&mut self, raw: Self::Raw) -> Vec<Self::Event>;

    /// Called once when the raw source is exhausted.
    fn on_end(&mut self) -> Vec<Self::Event> {
        Vec::new()
    }
}

pub struct EventNormalizer<H: EventHandler> {
    handler: H,
    turn_completed: bool,
    closed: bool,
}

impl<H: EventHandler> EventNormalizer<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            turn_completed: false,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn push(&mut self, raw: H::Raw) -> Vec<H::Event> {
        if self.closed {
            return Vec::new();
        }
        let events = self.handler.on_event(raw);
        self.admit(events)
    }

    /// Ends the stream, closing it if the handler did not.
    pub fn finish(&mut self) -> Vec<H::Event> {
        if self.closed {
            return Vec::new();
        }
        let events = self.handler.on_end();
        let mut out = self.admit(events);
        if !self.closed {
            self.closed = true;
            out.push(H::Event::stream_closed());
        }
        out
    }

    fn admit(&mut self, events: Vec<H::Event>) -> Vec<H::Event> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            if self.closed {
                break;
            }
            match event.kind() {
                EventKind::Content => {
                    self.turn_completed = false;
                    out.push(event);
                }
                EventKind::TurnComplete => {
                    if self.turn_completed && !event.carries_content() {
                        tracing::trace!("dropping duplicate turn-complete");
                        continue;
                    }
                    self.turn_completed = true;
                    out.push(event);
                }
                EventKind::Error => {
                    out.push(event);
                    out.push(H::Event::stream_closed());
                    self.closed = true;
                }
                EventKind::StreamClosed => {
                    out.push(event);
                    self.closed = true;
                }
            }
        }
        out
    }
}

/// Runs `handler` over every raw event from `raw_rx` on a background task.
///
/// The task stops once the stream closes or the returned receiver is dropped.
pub fn spawn_normalizer<H: EventHandler>(
    handler: H,
    mut raw_rx: mpsc::Receiver<H::Raw>,
) -> EventRx<H::Event> {
    let (tx, rx) = mpsc::channel(128);

    tokio::spawn(async move {
        let mut normalizer = EventNormalizer::new(handler);

        while let Some(raw) = raw_rx.recv().await {
            for event in normalizer.push(raw) {
                if tx.send(event).await.is_err() {
                    tracing::warn!("Normalized event receiver dropped, stopping adapter task.");
                    return;
                }
            }
            if normalizer.is_closed() {
                return;
            }
        }

        for event in normalizer.finish() {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    rx
}
