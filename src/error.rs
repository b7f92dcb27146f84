use thiserror::Error;

/// Errors raised by the storage and persistence layers.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("storage I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed persisted data under '{key}': {reason}")]
    Malformed { key: String, reason: String },
}

impl MemoryError {
    pub(crate) fn json(what: &'static str, source: serde_json::Error) -> Self {
        MemoryError::Json { what, source }
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
