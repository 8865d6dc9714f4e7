use std::result;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error(
        "LLM API key not configured. Set the {key_env} environment variable."
    )]
    MissingApiKey { key_env: &'static str },

    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response from LLM: {reason}")]
    InvalidResponse { reason: String },
}

pub(crate) type Result<T> = result::Result<T, LlmError>;
