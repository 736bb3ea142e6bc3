//! Configuration System
//!
//! Cache options can be built in code or loaded from a TOML file, with
//! environment variable overrides applied on top.

use crate::backend::BackendKind;
use crate::error::CacheResult;
use crate::transform::{ProviderRegistry, StageList, ValueHint};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub cache: CacheOptions,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Commit interval for a new store opened without one
pub const DEFAULT_COMMIT_INTERVAL: u64 = 1;

/// Everything needed to open a cache
#[derive(Debug, Clone, Deserialize)]
pub struct CacheOptions {
    /// Store location; the extension picks the backend unless `backend` is set
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub backend: Option<BackendKind>,

    #[serde(default)]
    pub chain: ChainSpec,

    /// Writes between automatic commits; 0 commits only on explicit request.
    /// Unset keeps the interval stored in the cache, else
    /// [`DEFAULT_COMMIT_INTERVAL`].
    #[serde(default)]
    pub commit_interval: Option<u64>,

    /// Initialise a missing store instead of failing
    #[serde(default = "default_create")]
    pub create: bool,

    #[serde(default)]
    pub compression_level: Option<i32>,
}

fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .map(|p| p.join("blobcache").join("cache.sqlite"))
        .unwrap_or_else(|| PathBuf::from("./blobcache.sqlite"))
}

fn default_create() -> bool {
    true
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            backend: None,
            chain: ChainSpec::default(),
            commit_interval: None,
            create: default_create(),
            compression_level: None,
        }
    }
}

impl CacheOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    pub fn chain(mut self, chain: ChainSpec) -> Self {
        self.chain = chain;
        self
    }

    pub fn serializer(mut self, name: impl Into<String>) -> Self {
        self.chain.serializer = Some(name.into());
        self
    }

    pub fn compressor(mut self, name: impl Into<String>) -> Self {
        self.chain.compressor = Some(name.into());
        self
    }

    pub fn hint(mut self, hint: ValueHint) -> Self {
        self.chain.hint = hint;
        self
    }

    pub fn commit_interval(mut self, ops: u64) -> Self {
        self.commit_interval = Some(ops);
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Explicit backend, else by path extension
    pub fn backend_kind(&self) -> CacheResult<BackendKind> {
        match self.backend {
            Some(kind) => Ok(kind),
            None => BackendKind::from_path(&self.path),
        }
    }
}

/// Which chain a cache writes with
///
/// Unset stages are auto-selected from the available providers; with
/// both unset a reopened store keeps the chain it was using.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChainSpec {
    #[serde(default)]
    pub serializer: Option<String>,

    #[serde(default)]
    pub compressor: Option<String>,

    #[serde(default)]
    pub hint: ValueHint,
}

impl ChainSpec {
    pub fn auto(hint: ValueHint) -> Self {
        Self {
            hint,
            ..Self::default()
        }
    }

    pub fn explicit(serializer: impl Into<String>, compressor: impl Into<String>) -> Self {
        Self {
            serializer: Some(serializer.into()),
            compressor: Some(compressor.into()),
            hint: ValueHint::default(),
        }
    }

    pub fn is_auto(&self) -> bool {
        self.serializer.is_none() && self.compressor.is_none()
    }

    /// Stage list chosen under `registry`
    pub fn resolve(&self, registry: &ProviderRegistry) -> CacheResult<StageList> {
        if let (Some(serializer), Some(compressor)) = (&self.serializer, &self.compressor) {
            return Ok(StageList::new([serializer.as_str(), compressor.as_str()]));
        }
        let best = registry.select(self.hint)?;
        let names = best.names();
        let serializer = self.serializer.as_deref().unwrap_or(names[0].as_str());
        let compressor = self.compressor.as_deref().unwrap_or(names[1].as_str());
        Ok(StageList::new([serializer, compressor]))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: CacheConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = CacheConfig::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("blobcache").join("config.toml")),
            Some(PathBuf::from("./blobcache.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::debug!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `BLOBCACHE_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("BLOBCACHE_PATH") {
            self.cache.path = PathBuf::from(path);
        }
        if let Some(backend) = lookup("BLOBCACHE_BACKEND") {
            match BackendKind::from_name(&backend) {
                Some(kind) => self.cache.backend = Some(kind),
                None => tracing::warn!("Ignoring unknown BLOBCACHE_BACKEND `{}`", backend),
            }
        }
        if let Some(serializer) = lookup("BLOBCACHE_SERIALIZER") {
            self.cache.chain.serializer = Some(serializer);
        }
        if let Some(compressor) = lookup("BLOBCACHE_COMPRESSOR") {
            self.cache.chain.compressor = Some(compressor);
        }
        if let Some(interval) = lookup("BLOBCACHE_COMMIT_INTERVAL") {
            if let Ok(n) = interval.parse() {
                self.cache.commit_interval = Some(n);
            }
        }

        if let Some(level) = lookup("BLOBCACHE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("BLOBCACHE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# blobcache configuration
#
# Environment variables override these settings:
# - BLOBCACHE_PATH
# - BLOBCACHE_BACKEND
# - BLOBCACHE_SERIALIZER
# - BLOBCACHE_COMPRESSOR
# - BLOBCACHE_COMMIT_INTERVAL
# - BLOBCACHE_LOG_LEVEL
# - BLOBCACHE_LOG_FORMAT

[cache]
# Store location. The extension picks the backend:
# .sqlite / .sqlite3 / .db -> sqlite, .sled -> sled
path = "./cache.sqlite"

# Force a backend regardless of extension
# backend = "sqlite"

# Writes between automatic commits (0 = explicit commit only).
# Unset keeps the interval stored in the cache, 1 for a new one.
# commit_interval = 1

# Initialise the store if it does not exist yet
create = true

# Compression level passed to the compressor, if it has one
# compression_level = 3

[cache.chain]
# Leave unset to pick the best available provider
# serializer = "bincode"
# compressor = "zstd"

# typed or self_describing
hint = "typed"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_generated_config_parses() {
        let config: CacheConfig = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.cache.path, PathBuf::from("./cache.sqlite"));
        assert_eq!(config.cache.commit_interval, None);
        assert!(config.cache.create);
        assert!(config.cache.chain.is_auto());
        assert_eq!(config.cache.chain.hint, ValueHint::Typed);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobcache.toml");
        std::fs::write(
            &path,
            r#"
[cache]
path = "/var/cache/app/store.sled"
commit_interval = 250

[cache.chain]
serializer = "json"
compressor = "lz4"
"#,
        )
        .unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.cache.backend_kind().unwrap(), BackendKind::Sled);
        assert_eq!(config.cache.commit_interval, Some(250));
        assert_eq!(config.cache.chain, ChainSpec::explicit("json", "lz4"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            CacheConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[cache\npath = 3").unwrap();
        assert!(matches!(
            CacheConfig::load(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BLOBCACHE_PATH", "/tmp/other.db"),
            ("BLOBCACHE_BACKEND", "sled"),
            ("BLOBCACHE_COMPRESSOR", "deflate"),
            ("BLOBCACHE_COMMIT_INTERVAL", "not-a-number"),
            ("BLOBCACHE_LOG_FORMAT", "json"),
        ]);
        let mut config = CacheConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.cache.path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.cache.backend_kind().unwrap(), BackendKind::Sled);
        assert_eq!(config.cache.chain.compressor.as_deref(), Some("deflate"));
        assert_eq!(config.cache.chain.serializer, None);
        assert_eq!(config.cache.commit_interval, None);
        assert_eq!(config.logging.format, "json");
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_partial_chain_fills_from_registry() {
        let registry = ProviderRegistry::only(["json", "none", "deflate"]);
        let chain = ChainSpec::auto(ValueHint::Typed);
        assert_eq!(
            chain.resolve(&registry).unwrap(),
            StageList::new(["json", "deflate"])
        );

        let chain = ChainSpec {
            compressor: Some("none".to_string()),
            ..ChainSpec::default()
        };
        assert_eq!(
            chain.resolve(&registry).unwrap(),
            StageList::new(["json", "none"])
        );
    }

    #[test]
    fn test_builder() {
        let options = CacheOptions::new("cache.db")
            .serializer("json")
            .compressor("zstd")
            .commit_interval(100)
            .create(false);
        assert_eq!(options.backend_kind().unwrap(), BackendKind::Sqlite);
        assert_eq!(options.chain, ChainSpec::explicit("json", "zstd"));
        assert!(!options.create);
        assert_eq!(options.commit_interval, Some(100));
    }
}
