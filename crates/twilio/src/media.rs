//! Twilio Media Streams WebSocket messages.

use serde::{Deserialize, Serialize};

/// Messages Twilio sends over a media stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        start: StartMetadata,
    },
    Media {
        media: InboundMedia,
    },
    Mark {
        mark: MarkName,
    },
    Stop {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub custom_parameters: serde_json::Map<String, serde_json::Value>,
}

impl StartMetadata {
    /// A non-empty custom parameter passed through `<Parameter>` in the TwiML.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.custom_parameters
            .get(name)
            .and_then(serde_json::Value::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMedia {
    /// Base64 mu-law audio.
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

/// Messages sent back to Twilio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkName,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl OutboundMessage {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia { payload },
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkName {
                name: name.to_string(),
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_lifecycle() {
        let start = r#"{"event":"start","sequenceNumber":"1","start":{"accountSid":"AC1","streamSid":"MZ1","callSid":"CA1","tracks":["inbound"],"mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1},"customParameters":{}},"streamSid":"MZ1"}"#;
        match serde_json::from_str::<InboundMessage>(start).unwrap() {
            InboundMessage::Start { start } => {
                assert_eq!(start.stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
            }
            other => panic!("unexpected {other:?}"),
        }

        let media = r#"{"event":"media","sequenceNumber":"3","media":{"track":"inbound","chunk":"1","timestamp":"5","payload":"/w=="},"streamSid":"MZ1"}"#;
        assert_eq!(
            serde_json::from_str::<InboundMessage>(media).unwrap(),
            InboundMessage::Media {
                media: InboundMedia {
                    payload: "/w==".into(),
                    track: Some("inbound".into())
                }
            }
        );

        let stop = r#"{"event":"stop","sequenceNumber":"5","stop":{"accountSid":"AC1","callSid":"CA1"},"streamSid":"MZ1"}"#;
        assert_eq!(serde_json::from_str::<InboundMessage>(stop).unwrap(), InboundMessage::Stop {});

        let dtmf = r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#;
        assert_eq!(serde_json::from_str::<InboundMessage>(dtmf).unwrap(), InboundMessage::Unknown);
    }

    #[test]
    fn custom_parameters_are_read_from_the_start_message() {
        let start = r#"{"event":"start","start":{"streamSid":"MZ1","callSid":"CA1","customParameters":{"from":"+15550100","to":""}}}"#;
        let InboundMessage::Start { start } = serde_json::from_str(start).unwrap() else {
            panic!("expected a start message");
        };
        assert_eq!(start.parameter("from"), Some("+15550100"));
        assert_eq!(start.parameter("to"), None);
        assert_eq!(start.parameter("missing"), None);
    }

    #[test]
    fn outbound_messages_carry_the_stream_sid() {
        let json = serde_json::to_value(OutboundMessage::mark("MZ1", "abc")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "mark", "streamSid": "MZ1", "mark": {"name": "abc"}})
        );
        let json = serde_json::to_value(OutboundMessage::clear("MZ1")).unwrap();
        assert_eq!(json, serde_json::json!({"event": "clear", "streamSid": "MZ1"}));
    }
}
