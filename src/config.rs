//! Server configuration.
//!
//! Values come from the CLI surface; paths for persisted state (model cache,
//! catalog, logs, instance lock) are derived from the cache root.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::recipe::{ModelClass, OptionValue, RawOptions};

/// Maximum number of concurrently loaded backends, per model class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassQuotas {
    pub llm: usize,
    pub embedding: usize,
    pub reranking: usize,
    pub audio: usize,
}

impl Default for ClassQuotas {
    fn default() -> Self {
        Self {
            llm: 1,
            embedding: 1,
            reranking: 1,
            audio: 1,
        }
    }
}

impl ClassQuotas {
    pub fn get(&self, class: ModelClass) -> usize {
        match class {
            ModelClass::Llm => self.llm,
            ModelClass::Embedding => self.embedding,
            ModelClass::Reranking => self.reranking,
            ModelClass::Audio => self.audio,
        }
    }
}

impl FromStr for ClassQuotas {
    type Err = String;

    /// Parse `llm=2,embedding=1,reranking=1,audio=1`.  Unlisted classes keep
    /// their default of 1; a quota must be at least 1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut quotas = ClassQuotas::default();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let (class, count) = part
                .split_once('=')
                .ok_or_else(|| format!("expected class=N, got '{part}'"))?;
            let count: usize = count
                .trim()
                .parse()
                .map_err(|_| format!("invalid quota count in '{part}'"))?;
            if count == 0 {
                return Err(format!("quota for '{}' must be at least 1", class.trim()));
            }
            match class.trim().parse::<ModelClass>()? {
                ModelClass::Llm => quotas.llm = count,
                ModelClass::Embedding => quotas.embedding = count,
                ModelClass::Reranking => quotas.reranking = count,
                ModelClass::Audio => quotas.audio = count,
            }
        }
        Ok(quotas)
    }
}

/// Everything the running server needs to know, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Server-scope recipe option layer (from `--ctx-size` and friends).
    pub server_options: RawOptions,
    pub quotas: ClassQuotas,
    pub extra_models_dir: Option<PathBuf>,
    pub cache_root: PathBuf,
    pub log_dir: Option<PathBuf>,
    /// Health-poll budget for a starting backend.
    pub load_timeout: Duration,
    /// Grace given to a backend between SIGTERM and a hard kill.
    pub stop_grace: Duration,
    /// Server-default deadline carried by every slot acquisition.
    pub acquire_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            server_options: RawOptions::new(),
            quotas: ClassQuotas::default(),
            extra_models_dir: None,
            cache_root: default_cache_root(),
            log_dir: None,
            load_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
            acquire_deadline: Duration::from_secs(600),
        }
    }
}

impl ServerConfig {
    pub fn models_dir(&self) -> PathBuf {
        self.cache_root.join("models")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.cache_root.join("catalog.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.cache_root.join("modeld.lock")
    }

    /// Path of the text log consumed by `/logs/stream`, when file logging is
    /// configured.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| dir.join("server.log"))
    }

    pub fn set_server_option(&mut self, key: &str, value: OptionValue) {
        if !value.is_empty() {
            self.server_options.insert(key.to_string(), value);
        }
    }
}

/// Platform cache root, overridable via `--cache-dir`.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modeld")
}

/// True when `path` lives under `root` (used before deleting cached model
/// trees, so a descriptor pointing outside the cache is never removed from
/// disk).
pub fn is_under(path: &Path, root: &Path) -> bool {
    path.ancestors().any(|p| p == root)
}
