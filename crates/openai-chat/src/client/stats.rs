/// Token usage accumulated over the lifetime of a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    total_tokens: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl Stats {
    pub(crate) fn update_usage(&mut self, total: u64, prompt: u64, completion: u64) {
        self.total_tokens += total;
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }
}
