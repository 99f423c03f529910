//! Configuration file support for kbsearch
//!
//! Config files are loaded in order (later overrides earlier):
//! 1. `~/.config/kbsearch/config.toml` (user defaults)
//! 2. `.kbsearch.toml` in the working directory (project overrides)
//!
//! CLI flags override all config file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::engine::{EngineConfig, SearchConfig};
use crate::pool::PoolConfig;

/// Project config file name
pub const PROJECT_CONFIG: &str = ".kbsearch.toml";

/// `[cache]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_size: Option<usize>,
    pub default_ttl_ms: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub persist_to_disk: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub disk_path: Option<PathBuf>,
}

/// `[pool]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_readers: Option<usize>,
    pub max_writers: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub enable_wal: Option<bool>,
}

/// `[search]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub limit: Option<usize>,
    pub strategy_timeout_ms: Option<u64>,
    pub slow_warn_ms: Option<u64>,
    pub slow_critical_ms: Option<u64>,
}

/// Configuration options loaded from config files
///
/// # Example
///
/// ```toml
/// # ~/.config/kbsearch/config.toml or .kbsearch.toml
/// database = "/srv/kb/kb.db"
///
/// [cache]
/// max_size = 1000
/// default_ttl_ms = 300000
/// persist_to_disk = true
///
/// [pool]
/// max_readers = 5
/// acquire_timeout_ms = 30000
///
/// [search]
/// limit = 10
/// slow_warn_ms = 500
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store file (overridden by --db)
    pub database: Option<PathBuf>,
    /// Enable verbose logging by default
    pub verbose: Option<bool>,
    pub cache: CacheSection,
    pub pool: PoolSection,
    pub search: SearchSection,
}

impl Config {
    /// Load configuration from user and project config files
    pub fn load(project_root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("kbsearch/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();

        let project_config =
            Self::load_file(&project_root.join(PROJECT_CONFIG)).unwrap_or_default();

        // Project overrides user
        let merged = user_config.override_with(project_config);
        tracing::debug!(
            database = ?merged.database,
            cache = ?merged.cache,
            pool = ?merged.pool,
            search = ?merged.search,
            "Effective config after merge"
        );
        merged
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Layer another config on top (other overrides self where present)
    pub fn override_with(self, other: Self) -> Self {
        Config {
            database: other.database.or(self.database),
            verbose: other.verbose.or(self.verbose),
            cache: CacheSection {
                max_size: other.cache.max_size.or(self.cache.max_size),
                default_ttl_ms: other.cache.default_ttl_ms.or(self.cache.default_ttl_ms),
                max_memory_mb: other.cache.max_memory_mb.or(self.cache.max_memory_mb),
                persist_to_disk: other.cache.persist_to_disk.or(self.cache.persist_to_disk),
                compression_enabled: other
                    .cache
                    .compression_enabled
                    .or(self.cache.compression_enabled),
                disk_path: other.cache.disk_path.or(self.cache.disk_path),
            },
            pool: PoolSection {
                max_readers: other.pool.max_readers.or(self.pool.max_readers),
                max_writers: other.pool.max_writers.or(self.pool.max_writers),
                acquire_timeout_ms: other.pool.acquire_timeout_ms.or(self.pool.acquire_timeout_ms),
                idle_timeout_ms: other.pool.idle_timeout_ms.or(self.pool.idle_timeout_ms),
                enable_wal: other.pool.enable_wal.or(self.pool.enable_wal),
            },
            search: SearchSection {
                limit: other.search.limit.or(self.search.limit),
                strategy_timeout_ms: other
                    .search
                    .strategy_timeout_ms
                    .or(self.search.strategy_timeout_ms),
                slow_warn_ms: other.search.slow_warn_ms.or(self.search.slow_warn_ms),
                slow_critical_ms: other.search.slow_critical_ms.or(self.search.slow_critical_ms),
            },
        }
    }

    // ===== Accessors with defaults =====

    pub const DEFAULT_DATABASE: &'static str = "kb.db";

    /// Store path: configured, else `<data dir>/kbsearch/kb.db`, else `kb.db`
    pub fn database_or_default(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("kbsearch").join(Self::DEFAULT_DATABASE))
                .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_DATABASE))
        })
    }

    /// Get result limit with default fallback
    pub fn limit_or_default(&self) -> usize {
        self.search.limit.unwrap_or(crate::query::DEFAULT_LIMIT)
    }

    /// Get verbose mode with default fallback (false)
    pub fn verbose_or_default(&self) -> bool {
        self.verbose.unwrap_or(false)
    }

    /// Resolve every section against the built-in defaults
    pub fn engine_config(&self) -> EngineConfig {
        let cache = CacheConfig::default();
        let pool = PoolConfig::default();
        let search = SearchConfig::default();
        EngineConfig {
            cache: CacheConfig {
                max_size: self.cache.max_size.unwrap_or(cache.max_size),
                default_ttl_ms: self.cache.default_ttl_ms.unwrap_or(cache.default_ttl_ms),
                max_memory_mb: self.cache.max_memory_mb.unwrap_or(cache.max_memory_mb),
                persist_to_disk: self.cache.persist_to_disk.unwrap_or(cache.persist_to_disk),
                compression_enabled: self
                    .cache
                    .compression_enabled
                    .unwrap_or(cache.compression_enabled),
                disk_path: self.cache.disk_path.clone().or(cache.disk_path),
            },
            pool: PoolConfig {
                max_readers: self.pool.max_readers.unwrap_or(pool.max_readers),
                max_writers: self.pool.max_writers.unwrap_or(pool.max_writers),
                acquire_timeout_ms: self.pool.acquire_timeout_ms.unwrap_or(pool.acquire_timeout_ms),
                idle_timeout_ms: self.pool.idle_timeout_ms.unwrap_or(pool.idle_timeout_ms),
                enable_wal: self.pool.enable_wal.unwrap_or(pool.enable_wal),
            },
            search: SearchConfig {
                strategy_timeout_ms: self.search.strategy_timeout_ms.or(search.strategy_timeout_ms),
                slow_warn_ms: self.search.slow_warn_ms.unwrap_or(search.slow_warn_ms),
                slow_critical_ms: self.search.slow_critical_ms.unwrap_or(search.slow_critical_ms),
            },
        }
    }
}

/// Write `database = <path>` into a config file (read-modify-write,
/// preserves unknown fields)
pub fn set_database_in_config(config_path: &Path, database: &Path) -> anyhow::Result<()> {
    let content = match std::fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let mut table: toml::Table = if content.is_empty() {
        toml::Table::new()
    } else {
        content
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", config_path.display(), e))?
    };

    table.insert(
        "database".to_string(),
        toml::Value::String(database.display().to_string()),
    );
    std::fs::write(config_path, toml::to_string_pretty(&table)?)?;
    Ok(())
}
