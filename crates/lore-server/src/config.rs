// crates/lore-server/src/config.rs
// File-based configuration from ~/.lore/config.toml plus LORE_* env overrides

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{LoreError, Result};

/// Supported embedding dimensions. Anything else is rejected at open.
pub const SUPPORTED_EMBEDDING_DIMS: [usize; 2] = [384, 2000];

/// Top-level config structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoreConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
}

/// Storage engine configuration section
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Database file path. Defaults to ~/.lore/lore.db.
    pub db_path: Option<PathBuf>,
    /// Pool size (max open connections).
    #[serde(default = "StoreConfig::default_max_conns")]
    pub max_conns: usize,
    /// tracing filter directive ("info", "lore=debug", ...).
    #[serde(default = "StoreConfig::default_log_level")]
    pub log_level: String,
    /// Embedding vector dimension; 384 or 2000. Read once at open and
    /// enforced against every vector written thereafter.
    #[serde(default = "StoreConfig::default_embedding_dim")]
    pub embedding_dim: usize,
    /// Health snapshot cache TTL in seconds.
    #[serde(default = "StoreConfig::default_health_cache_ttl_secs")]
    pub health_cache_ttl_secs: u64,
    /// Per-project cap on non-archived observations.
    #[serde(default = "StoreConfig::default_max_per_project")]
    pub max_per_project: usize,
    /// Days a superseded observation survives after its detecting conflict.
    #[serde(default = "StoreConfig::default_superseded_retention_days")]
    pub superseded_retention_days: i64,
    /// Default age for archive_old.
    #[serde(default = "StoreConfig::default_auto_archive_days")]
    pub auto_archive_days: i64,
    /// Global cap on stored user prompts.
    #[serde(default = "StoreConfig::default_prompt_global_cap")]
    pub prompt_global_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_conns: 10,
            log_level: "info".to_string(),
            embedding_dim: 384,
            health_cache_ttl_secs: 5,
            max_per_project: 100,
            superseded_retention_days: 3,
            auto_archive_days: 90,
            prompt_global_cap: 500,
        }
    }
}

impl StoreConfig {
    fn default_max_conns() -> usize {
        10
    }
    fn default_log_level() -> String {
        "info".to_string()
    }
    fn default_embedding_dim() -> usize {
        384
    }
    fn default_health_cache_ttl_secs() -> u64 {
        5
    }
    fn default_max_per_project() -> usize {
        100
    }
    fn default_superseded_retention_days() -> i64 {
        3
    }
    fn default_auto_archive_days() -> i64 {
        90
    }
    fn default_prompt_global_cap() -> usize {
        500
    }

    /// Resolved database path: config value, else ~/.lore/lore.db.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(ref p) = self.db_path {
            return p.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lore")
            .join("lore.db")
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_ttl_secs)
    }
}

/// Pattern detector configuration section
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Seconds between background analysis passes.
    #[serde(default = "DetectorConfig::default_analysis_interval_secs")]
    pub analysis_interval_secs: u64,
    /// Bound on the in-memory candidate pool.
    #[serde(default = "DetectorConfig::default_max_candidates")]
    pub max_candidates: usize,
    /// Minimum Jaccard similarity for an observation to join a pattern.
    #[serde(default = "DetectorConfig::default_min_match_score")]
    pub min_match_score: f64,
    /// Observations a candidate needs before promotion.
    #[serde(default = "DetectorConfig::default_min_frequency_for_pattern")]
    pub min_frequency_for_pattern: usize,
    /// Days before an untouched candidate is swept.
    #[serde(default = "DetectorConfig::default_candidate_ttl_days")]
    pub candidate_ttl_days: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            analysis_interval_secs: 300,
            max_candidates: 500,
            min_match_score: 0.3,
            min_frequency_for_pattern: 2,
            candidate_ttl_days: 7,
        }
    }
}

impl DetectorConfig {
    fn default_analysis_interval_secs() -> u64 {
        300
    }
    fn default_max_candidates() -> usize {
        500
    }
    fn default_min_match_score() -> f64 {
        0.3
    }
    fn default_min_frequency_for_pattern() -> usize {
        2
    }
    fn default_candidate_ttl_days() -> i64 {
        7
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }
}

impl LoreConfig {
    /// Load from ~/.lore/config.toml, then apply env overrides.
    /// Missing file means pure defaults; a malformed file is a warning, not a
    /// failure.
    pub fn load() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lore")
            .join("config.toml");
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str::<LoreConfig>(&text) {
                Ok(c) => {
                    debug!("Loaded config from {}", path.display());
                    c
                }
                Err(e) => {
                    warn!("Ignoring malformed config {}: {}", path.display(), e);
                    LoreConfig::default()
                }
            },
            Err(_) => LoreConfig::default(),
        };
        config.apply_env_overrides();
        config
    }

    /// Apply LORE_* environment overrides on top of file/default values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LORE_DB_PATH") {
            if !v.is_empty() {
                self.store.db_path = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = parse_usize_env("LORE_MAX_CONNS") {
            self.store.max_conns = v;
        }
        if let Some(v) = parse_usize_env("LORE_EMBEDDING_DIM") {
            self.store.embedding_dim = v;
        }
        if let Ok(v) = std::env::var("LORE_LOG_LEVEL") {
            if !v.is_empty() {
                self.store.log_level = v;
            }
        }
    }

    /// Validate open-time invariants. Called once by `Store::open`.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_EMBEDDING_DIMS.contains(&self.store.embedding_dim) {
            return Err(LoreError::Config(format!(
                "unsupported embedding dimension {} (supported: {:?})",
                self.store.embedding_dim, SUPPORTED_EMBEDDING_DIMS
            )));
        }
        if self.store.max_conns == 0 {
            return Err(LoreError::Config("max_conns must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.detector.min_match_score) {
            return Err(LoreError::Config(
                "detector.min_match_score must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a usize env var; unset, empty, or unparseable values return None.
fn parse_usize_env(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Initialize tracing from the configured log level, honoring RUST_LOG when
/// set. Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
