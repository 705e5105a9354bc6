pub mod media;
mod rest;
pub mod twiml;

pub use media::{InboundMessage, OutboundMessage};
pub use rest::{CallControl, Error, TwilioClient};
