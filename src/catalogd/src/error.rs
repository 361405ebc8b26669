use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The input cannot succeed without human intervention: invalid
    /// reference, missing image, bad signature policy, digest-pin violation.
    #[error("{0}")]
    Unrecoverable(String),

    /// Transient registry or network fault, retried with backoff.
    #[error("registry error: {0}")]
    Registry(String),

    #[error("cache error: {0}")]
    Cache(String),

    /// Unpack succeeded but serializing or publishing the content failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cleanup on catalog deletion failed; blocks finalizer removal.
    #[error("delete error: {0}")]
    Delete(String),
}

impl Error {
    /// Faults that no amount of retrying will fix.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Unrecoverable(_) | Error::Config(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Error::Delete(_))
    }
}
