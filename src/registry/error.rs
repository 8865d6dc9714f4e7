use std::result;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub(crate) type Result<T> = result::Result<T, RegistryError>;
