use thiserror::Error;

/// Errors surfaced by the dispatcher service.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kv store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("scoring callback to {uri} failed: {source}")]
    Callback {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
