use thiserror::Error;

/// Errors surfaced by provider services and tools.
///
/// Values are cloneable because they travel inside normalized events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{provider} connection error: {message}")]
    ProviderConnection { provider: String, message: String },

    #[error("{provider} rate limit exceeded: {message}")]
    RateLimited { provider: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },
}

impl ServiceError {
    pub fn connection(provider: impl Into<String>, message: impl ToString) -> Self {
        Self::ProviderConnection {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn rate_limited(provider: impl Into<String>, message: impl ToString) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl ToString) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}
