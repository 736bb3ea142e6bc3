//! # blobcache
//!
//! Disk-persistent, compressed key-value cache. Values of any serde type are
//! stored under integer, text or byte keys, passing through the best
//! serializer and compressor available in this build, on top of an embedded
//! storage engine picked by file extension.
//!
//! ## Features
//!
//! - **Pluggable engines**: SQLite (`.sqlite`, `.sqlite3`, `.db`) and sled (`.sled`)
//! - **Automatic codec selection**: bincode/json serializers, zstd/lz4/deflate compressors
//! - **Trained dictionaries**: `optimize_compression()` trains a shared
//!   dictionary and recompresses existing rows atomically
//! - **Explicit failures**: data written with a codec missing here is
//!   reported, never misread
//!
//! ## Modules
//!
//! - [`cache`]: the [`Cache`] facade, metadata layout and recompression engine
//! - [`transform`]: serializers, compressors, chains and provider selection
//! - [`backend`]: storage engine abstraction and its implementations
//! - [`config`]: options, TOML loading and environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blobcache::{open_cache, CacheOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Profile {
//!     name: String,
//!     visits: u32,
//! }
//!
//! fn main() -> Result<(), blobcache::CacheError> {
//!     let mut cache = open_cache::<Profile>(&CacheOptions::new("profiles.sqlite"))?;
//!
//!     cache.insert("ada", &Profile { name: "Ada".into(), visits: 3 })?;
//!     let profile = cache.get("ada")?;
//!     println!("{} visited {} times", profile.name, profile.visits);
//!
//!     // once a few thousand similar records are in
//!     let report = cache.optimize_compression(None)?;
//!     println!("{}", report);
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod transform;

pub use backend::{Backend, BackendKind, DataSize, Key, TableName};
pub use cache::{Cache, RecompressionReport};
pub use config::{CacheConfig, CacheOptions, ChainSpec, ConfigError, LoggingConfig};
pub use error::{CacheError, CacheResult};
pub use transform::{ChainId, Dictionary, ProviderRegistry, StageList, ValueHint};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Open a cache for values of type `V`
///
/// The backend comes from `options.backend` or the path extension, the
/// chain from `options.chain`; see [`CacheOptions`].
pub fn open_cache<V>(options: &CacheOptions) -> CacheResult<Cache<V>>
where
    V: Serialize + DeserializeOwned,
{
    Cache::open(options)
}
