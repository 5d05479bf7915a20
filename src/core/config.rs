use super::error::{Error, Result};
use crate::search::provider::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default base directory
pub const HOME_ENV_VAR: &str = "DOCVEC_HOME";

const CONFIG_FILE_NAME: &str = "config.json";

/// Configuration for docvec
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for docvec data
    pub base_dir: PathBuf,
    /// Directory holding the persisted index snapshots
    pub index_dir: PathBuf,
    /// Directory for cached models
    pub models_dir: PathBuf,
    /// Indexing and retrieval tunables
    pub settings: IndexSettings,
}

/// Tunables read from `config.json`. Missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Glob (gitignore syntax, relative to the corpus root) selecting documents
    pub glob: String,
    /// Maximum fragment length in characters
    pub max_chunk_size: usize,
    /// Characters shared by consecutive fragments
    pub chunk_overlap: usize,
    /// Texts per embedding request
    pub batch_size: usize,
    /// Embedding requests allowed in flight at once
    pub max_concurrent_batches: usize,
    /// Deadline for a single embedding request
    pub embed_timeout_secs: u64,
    /// Extra attempts after a failed embedding request
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub retry_backoff_ms: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            glob: "*.md".to_string(),
            max_chunk_size: 1000,
            chunk_overlap: 200,
            batch_size: 32,
            max_concurrent_batches: 4,
            embed_timeout_secs: 30,
            max_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

impl IndexSettings {
    /// Reject settings the chunker and embedder cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.glob.trim().is_empty() {
            return Err(Error::Config("glob must not be empty".to_string()));
        }
        if self.max_chunk_size == 0 {
            return Err(Error::Config("max_chunk_size must be greater than 0".to_string()));
        }
        if self.chunk_overlap >= self.max_chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than max_chunk_size ({})",
                self.chunk_overlap, self.max_chunk_size
            )));
        }
        if self.batch_size == 0 || self.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "batch_size and max_concurrent_batches must be greater than 0".to_string(),
            ));
        }
        if self.embed_timeout_secs == 0 {
            return Err(Error::Config("embed_timeout_secs must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.embed_timeout_secs),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

impl Config {
    /// Get the default configuration directory
    pub fn default_base_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(HOME_ENV_VAR) {
            return Ok(PathBuf::from(dir));
        }
        dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
            .map(|home| home.join(".docvec"))
    }

    /// Create a new configuration, reading `config.json` from the base directory when present
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => Self::default_base_dir().unwrap_or_else(|_| PathBuf::from(".docvec")),
        };

        let settings = Self::read_settings(&base_dir.join(CONFIG_FILE_NAME))?;
        settings.validate()?;

        Ok(Self {
            index_dir: base_dir.join("index"),
            models_dir: base_dir.join("models"),
            base_dir,
            settings,
        })
    }

    fn read_settings(path: &Path) -> Result<IndexSettings> {
        if !path.exists() {
            return Ok(IndexSettings::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Path of the settings file
    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }

    /// Initialize the configuration directories and write the settings file if missing
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        std::fs::create_dir_all(&self.models_dir)?;

        let config_path = self.config_path();
        if !config_path.exists() {
            let json = serde_json::to_string_pretty(&self.settings)
                .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;
            std::fs::write(&config_path, json)?;
        }
        Ok(())
    }

    /// Check if the configuration is already initialized
    pub fn is_initialized(&self) -> bool {
        self.base_dir.exists() && self.index_dir.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(IndexSettings::default().validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let settings = IndexSettings {
            max_chunk_size: 100,
            chunk_overlap: 100,
            ..IndexSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_new_uses_defaults_without_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().join("docvec"))).unwrap();
        assert_eq!(config.settings, IndexSettings::default());
        assert_eq!(config.index_dir, temp_dir.path().join("docvec").join("index"));
    }

    #[test]
    fn test_init_writes_config_and_partial_file_merges_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let base_dir = temp_dir.path().join("docvec");
        let config = Config::new(Some(base_dir.clone())).unwrap();
        assert!(!config.is_initialized());

        config.init().unwrap();
        assert!(config.is_initialized());
        assert!(config.config_path().exists());

        std::fs::write(config.config_path(), r#"{"max_chunk_size": 400, "chunk_overlap": 40}"#)
            .unwrap();
        let reloaded = Config::new(Some(base_dir)).unwrap();
        assert_eq!(reloaded.settings.max_chunk_size, 400);
        assert_eq!(reloaded.settings.chunk_overlap, 40);
        assert_eq!(reloaded.settings.batch_size, IndexSettings::default().batch_size);
    }

    #[test]
    fn test_invalid_config_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let base_dir = temp_dir.path().join("docvec");
        std::fs::create_dir_all(&base_dir).unwrap();
        std::fs::write(base_dir.join("config.json"), "not json").unwrap();

        assert!(matches!(Config::new(Some(base_dir)), Err(Error::Config(_))));
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let settings = IndexSettings {
            embed_timeout_secs: 5,
            max_retries: 1,
            retry_backoff_ms: 10,
            ..IndexSettings::default()
        };
        let policy = settings.retry_policy();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
    }
}
