use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of `call_contexts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_sid: String,
    pub stream_sid: Option<String>,
    pub call_ended: bool,
    /// The conversation as a JSON array of chat messages.
    pub user_context: serde_json::Value,
    pub system_message: String,
    pub initial_message: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub final_status: Option<String>,
    pub to_number: String,
    pub from_number: String,
    pub contact_id: Option<i64>,
}

impl CallRecord {
    pub fn new(call_sid: &str) -> Self {
        Self {
            call_sid: call_sid.to_string(),
            stream_sid: None,
            call_ended: false,
            user_context: serde_json::Value::Array(Vec::new()),
            system_message: String::new(),
            initial_message: String::new(),
            start_time: Utc::now(),
            end_time: None,
            final_status: None,
            to_number: String::new(),
            from_number: String::new(),
            contact_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: i64,
    pub phone_number: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub transcription_id: i64,
    pub call_sid: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}
