//! Configuration loading.
//!
//! Settings are layered with figment: built-in defaults, then an optional
//! TOML file, then `SEMCHE_`-prefixed environment variables. Nested keys
//! use a double underscore, so `SEMCHE_COLLECTION__NAME` sets
//! `collection.name` and `SEMCHE_EMBEDDING__PROVIDER` sets
//! `embedding.provider`.
//!
//! ```toml
//! [collection]
//! name = "semche_documents"
//! persist_directory = "./data/semche"
//! metric = "cosine"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use std::path::{Path, PathBuf};

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use semche_core::chunk::ChunkOptions;
use semche_core::models::{CollectionConfig, DistanceMetric};
use semche_core::store::StoreOptions;
use semche_core::Error;

pub const ENV_PREFIX: &str = "SEMCHE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collection: CollectionSettings,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSettings {
    #[serde(default = "default_collection_name")]
    pub name: String,
    #[serde(default = "default_persist_directory")]
    pub persist_directory: PathBuf,
    #[serde(default = "default_metric")]
    pub metric: DistanceMetric,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Accepted so existing configs keep loading. Only `false` is valid:
    /// this build has no telemetry to enable.
    #[serde(default)]
    pub anonymized_telemetry: bool,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            name: default_collection_name(),
            persist_directory: default_persist_directory(),
            metric: default_metric(),
            ef_construction: default_ef_construction(),
            m: default_m(),
            ef_search: default_ef_search(),
            anonymized_telemetry: false,
        }
    }
}

fn default_collection_name() -> String {
    "semche_documents".to_string()
}
fn default_persist_directory() -> PathBuf {
    PathBuf::from("./data/semche")
}
fn default_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}
fn default_ef_construction() -> usize {
    100
}
fn default_m() -> usize {
    16
}
fn default_ef_search() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// One of `hash`, `openai`, `ollama`, `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override for HTTP providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            normalize: false,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    semche_core::chunk::DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    semche_core::chunk::DEFAULT_CHUNK_OVERLAP
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const PROVIDERS: &[&str] = &["hash", "openai", "ollama", "local"];

impl Config {
    /// Collection parameters for an index whose vectors have `dimension`.
    pub fn collection_config(&self, dimension: usize) -> CollectionConfig {
        CollectionConfig {
            name: self.collection.name.clone(),
            dimension,
            metric: self.collection.metric,
            ef_construction: self.collection.ef_construction,
            m: self.collection.m,
            ef_search: self.collection.ef_search,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            chunk: ChunkOptions::new(self.chunking.chunk_size, self.chunking.chunk_overlap),
            embed_concurrency: self.embedding.concurrency,
            embed_batch_size: self.embedding.batch_size,
            normalize_embeddings: self.embedding.normalize,
        }
    }

    /// Where the collection snapshot lives.
    pub fn snapshot_path(&self) -> PathBuf {
        self.collection
            .persist_directory
            .join(format!("{}.json", self.collection.name))
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        let c = &self.collection;
        if c.name.trim().is_empty() {
            return Err(Error::Config("collection.name must not be empty".into()));
        }
        if c.name.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "collection.name '{}' must not contain path separators",
                c.name
            )));
        }
        if c.persist_directory.as_os_str().is_empty() {
            return Err(Error::Config(
                "collection.persist_directory must not be empty".into(),
            ));
        }
        if c.ef_construction == 0 {
            return Err(Error::Config("collection.ef_construction must be > 0".into()));
        }
        if c.m < 2 {
            return Err(Error::Config("collection.m must be >= 2".into()));
        }
        if c.ef_search == 0 {
            return Err(Error::Config("collection.ef_search must be > 0".into()));
        }
        if c.anonymized_telemetry {
            return Err(Error::Config(
                "collection.anonymized_telemetry is not supported; remove it or set it to false".into(),
            ));
        }

        let e = &self.embedding;
        if !PROVIDERS.contains(&e.provider.as_str()) {
            return Err(Error::Config(format!(
                "unknown embedding.provider '{}'; must be one of {}",
                e.provider,
                PROVIDERS.join(", ")
            )));
        }
        if e.dims == Some(0) {
            return Err(Error::Config("embedding.dims must be > 0".into()));
        }
        if matches!(e.provider.as_str(), "openai" | "ollama") {
            if e.model.is_none() {
                return Err(Error::Config(format!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                )));
            }
            if e.dims.is_none() {
                return Err(Error::Config(format!(
                    "embedding.dims must be specified when provider is '{}'",
                    e.provider
                )));
            }
        }
        if e.batch_size == 0 {
            return Err(Error::Config("embedding.batch_size must be > 0".into()));
        }
        if e.concurrency == 0 {
            return Err(Error::Config("embedding.concurrency must be > 0".into()));
        }

        self.store_options()
            .chunk
            .validate()
            .map_err(|_| {
                Error::Config(format!(
                    "chunking.chunk_size ({}) must be > 0 and greater than chunking.chunk_overlap ({})",
                    self.chunking.chunk_size, self.chunking.chunk_overlap
                ))
            })?;

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "logging.level '{}' must be one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

/// The layered figment for an optional config file.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate configuration. A missing file is an error only when
/// it was named explicitly.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(Error::Config(format!("config file not found: {}", path.display())).into());
        }
    }
    from_figment(figment(path))
}

pub fn from_figment(figment: Figment) -> Result<Config> {
    let config: Config = figment
        .extract()
        .map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn config_error(result: Result<Config>) -> String {
        let err = result.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Config(msg)) => msg.clone(),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.collection.name, "semche_documents");
        assert_eq!(config.collection.metric, DistanceMetric::Cosine);
        assert_eq!(config.collection.ef_construction, 100);
        assert_eq!(config.collection.m, 16);
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.embedding.provider, "hash");
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "semche.toml",
                r#"
                [collection]
                name = "notes"
                metric = "l2"

                [chunking]
                chunk_size = 500
                chunk_overlap = 50
                "#,
            )?;
            let config = load_config(Some(Path::new("semche.toml"))).unwrap();
            assert_eq!(config.collection.name, "notes");
            assert_eq!(config.collection.metric, DistanceMetric::Euclidean);
            assert_eq!(config.chunking.chunk_size, 500);
            assert_eq!(config.collection.m, 16);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("semche.toml", "[collection]\nname = \"from-file\"\n")?;
            jail.set_env("SEMCHE_COLLECTION__NAME", "from-env");
            jail.set_env("SEMCHE_COLLECTION__METRIC", "ip");
            jail.set_env("SEMCHE_EMBEDDING__DIMS", "64");
            let config = load_config(Some(Path::new("semche.toml"))).unwrap();
            assert_eq!(config.collection.name, "from-env");
            assert_eq!(config.collection.metric, DistanceMetric::InnerProduct);
            assert_eq!(config.embedding.dims, Some(64));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_empty_collection_name() {
        Jail::expect_with(|jail| {
            jail.set_env("SEMCHE_COLLECTION__NAME", "\"\"");
            let msg = config_error(load_config(None));
            assert!(msg.contains("collection.name"));
            Ok(())
        });
    }

    #[test]
    fn test_telemetry_cannot_be_enabled() {
        Jail::expect_with(|jail| {
            jail.set_env("SEMCHE_COLLECTION__ANONYMIZED_TELEMETRY", "false");
            assert!(load_config(None).is_ok());
            jail.set_env("SEMCHE_COLLECTION__ANONYMIZED_TELEMETRY", "true");
            let msg = config_error(load_config(None));
            assert!(msg.contains("anonymized_telemetry"));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_unknown_metric() {
        Jail::expect_with(|jail| {
            jail.set_env("SEMCHE_COLLECTION__METRIC", "manhattan");
            config_error(load_config(None));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_overlap_not_below_size() {
        let mut config = Config::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunking.chunk_size"));
    }

    #[test]
    fn test_http_providers_need_model_and_dims() {
        let mut config = Config::default();
        config.embedding.provider = "openai".into();
        assert!(config.validate().unwrap_err().to_string().contains("embedding.model"));
        config.embedding.model = Some("text-embedding-3-small".into());
        assert!(config.validate().unwrap_err().to_string().contains("embedding.dims"));
        config.embedding.dims = Some(1536);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let msg = config_error(load_config(Some(Path::new("/nonexistent/semche.toml"))));
        assert!(msg.contains("not found"));
    }
}
