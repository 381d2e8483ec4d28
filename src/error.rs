use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("invalid function arguments: {0}")]
    InvalidFunctionArguments(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl LLMError {
    /// Transport-level failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            LLMError::Http(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error
                        .status()
                        .map_or(false, |status| status.is_server_error() || status.as_u16() == 429)
            }
            _ => false,
        }
    }
}
