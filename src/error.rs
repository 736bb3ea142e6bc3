//! Cache error types
//!
//! Every public operation returns [`CacheResult`]. Configuration and provider
//! availability failures are raised at the call site, engine failures keep
//! their original source error.

use crate::backend::Key;
use crate::transform::ChainId;
use thiserror::Error;

/// Errors that can occur in the cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Storage path or options cannot be mapped to a backend/chain
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stored chain references a provider that is not installed here
    #[error("Chain {chain_id} needs provider `{provider}`, which is not available")]
    UnavailableProvider { chain_id: ChainId, provider: String },

    /// A row references a chain that metadata does not describe
    #[error("Unknown chain {0}: no descriptor in metadata")]
    UnknownChain(ChainId),

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Storage engine failure, source error kept as-is
    #[error("{engine} backend error: {source}")]
    Backend {
        engine: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested key does not exist
    #[error("Key not found: {0}")]
    KeyNotFound(Key),

    /// Dictionary could not be trained from the sample
    #[error("Dictionary training failed: {0}")]
    DictionaryTraining(String),

    /// The compressor in use has no dictionary support
    #[error("Compressor `{0}` does not support shared dictionaries")]
    DictionaryUnsupported(String),

    /// Metadata is unreadable or written by a newer format version
    #[error("Corrupt metadata: {0}")]
    Corruption(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Backend {
            engine: "sqlite",
            source: Box::new(err),
        }
    }
}

impl From<sled::Error> for CacheError {
    fn from(err: sled::Error) -> Self {
        CacheError::Backend {
            engine: "sled",
            source: Box::new(err),
        }
    }
}

#[cfg(feature = "bincode")]
impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
