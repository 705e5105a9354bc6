use std::time::Duration;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

pub const BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

pub const OPENAI_BETA_HEADER: &str = "OpenAI-Beta";
pub const ASSISTANTS_BETA: &str = "assistants=v2";

pub const CANCEL_POLLS: usize = 10;
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub const CHANNEL_CAPACITY: usize = 128;
