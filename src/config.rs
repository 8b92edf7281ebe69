use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Server-level configuration.
///
/// Loaded from a TOML file; every field has a default so an empty file (or a
/// missing one, via [`ServerConfig::default`]) yields a working server rooted
/// at `./corpus-data`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Root of the metadata, blob, and index subtrees.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // Default session limits (can be overridden per-session)
    #[serde(default = "default_max_tool_calls")]
    pub default_max_tool_calls: i64,
    #[serde(default = "default_max_chars_per_response")]
    pub default_max_chars_per_response: usize,
    #[serde(default = "default_max_chars_per_peek")]
    pub default_max_chars_per_peek: usize,

    /// Semaphore capacity for `docs.load`: at most this many files are held
    /// in memory at once.
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,
    /// Per-file size cap in `docs.load`, in megabytes.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Name of the tokenizer the lexical index must be built with. Part of
    /// the index staleness contract.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,

    // Logging configuration
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Strict by default: startup fails when the transport cannot register
    /// canonical dotted tool names verbatim. Set to true to fall back to
    /// fabricated names with a one-time warning.
    #[serde(default)]
    pub allow_noncanonical_tool_names: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./corpus-data")
}
fn default_max_tool_calls() -> i64 {
    500
}
fn default_max_chars_per_response() -> usize {
    50_000
}
fn default_max_chars_per_peek() -> usize {
    10_000
}
fn default_max_concurrent_loads() -> usize {
    8
}
fn default_max_file_size_mb() -> u64 {
    50
}
fn default_tokenizer() -> String {
    "unicode-v1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_structured_logging() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl ServerConfig {
    /// Path of the SQLite metadata store file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("corpus.db")
    }

    /// Root of the content-addressed blob tree.
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Root of the per-session index snapshots.
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("indexes")
    }
}

/// Load server configuration from a TOML file.
///
/// A missing file yields the defaults; a present file must parse and pass
/// validation.
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        return Ok(ServerConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ServerConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.default_max_tool_calls < 1 {
        anyhow::bail!("default_max_tool_calls must be >= 1");
    }
    if config.default_max_chars_per_response < 1000 {
        anyhow::bail!("default_max_chars_per_response must be >= 1000");
    }
    if config.default_max_chars_per_peek < 100 {
        anyhow::bail!("default_max_chars_per_peek must be >= 100");
    }
    if config.max_concurrent_loads == 0 {
        anyhow::bail!("max_concurrent_loads must be >= 1");
    }
    if config.max_file_size_mb == 0 {
        anyhow::bail!("max_file_size_mb must be >= 1");
    }
    if crate::index::tokenizer::resolve(&config.tokenizer).is_none() {
        anyhow::bail!(
            "Unknown tokenizer: '{}'. Available: {}",
            config.tokenizer,
            crate::index::tokenizer::available_names().join(", ")
        );
    }

    Ok(config)
}

/// Ensure the data directory and its subtrees exist.
pub fn ensure_directories(config: &ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.blob_dir())?;
    std::fs::create_dir_all(config.index_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.default_max_tool_calls, 500);
        assert_eq!(config.max_concurrent_loads, 8);
        assert_eq!(config.tokenizer, "unicode-v1");
        assert!(!config.allow_noncanonical_tool_names);
        assert!(config.database_path().ends_with("corpus.db"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/corpus.toml")).unwrap();
        assert_eq!(config.default_max_chars_per_peek, 10_000);
    }

    #[test]
    fn test_rejects_unknown_tokenizer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corpus.toml");
        std::fs::write(&path, "tokenizer = \"does-not-exist\"").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown tokenizer"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corpus.toml");
        std::fs::write(&path, "max_concurrent_loads = 0").unwrap();
        assert!(load_config(&path).is_err());
    }
}
