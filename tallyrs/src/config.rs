//! Configuration for Tally.
//!
//! TOML-based; every section is optional and falls back to built-in defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TallyConfig {
    pub router: RouterConfig,
    pub optimizer: OptimizerConfig,
    pub schema_cache: SchemaCacheConfig,
    pub validation: ValidationConfig,
    pub bigquery: BigQueryConfig,
    pub duckdb: DuckDbConfig,
}

/// Rollup scoring weights.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Score every usable rollup starts from (default: 100).
    pub base_score: i64,
    /// Bonus when the rollup's dimensions equal the request exactly (default: 50).
    pub exact_match_bonus: i64,
    /// Cost per rollup dimension beyond the request (default: 5).
    pub extra_dimension_penalty: i64,
}

/// Composite-key optimizer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum clustering columns (default: 4, BigQuery's limit).
    pub max_cluster_columns: usize,
    /// Prefix of generated surrogate key columns (default: `_key_`).
    pub key_prefix: String,
    /// Suffix appended to the source table for the optimized copy (default: `_optimized`).
    pub table_suffix: String,
}

/// Schema cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Cache TTL in seconds (default: 3600).
    pub ttl_secs: u64,
    /// Maximum cached schemas (default: 1000).
    pub max_size: usize,
}

/// Validation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Log missing columns instead of failing (default: false).
    pub warn_only: bool,
    /// Dry-run dimension expressions against the warehouse (default: true).
    pub dry_run: bool,
}

/// BigQuery-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BigQueryConfig {
    /// Enable query cache (default: true).
    pub use_query_cache: bool,
    /// Maximum bytes billed per query (0 = unlimited).
    pub maximum_bytes_billed: i64,
    /// Maximum concurrent queries to BigQuery (default: 30).
    pub max_concurrent_queries: usize,
    /// Maximum time (ms) to wait for a query slot before rejecting (default: 1500).
    /// Set to 0 to wait indefinitely.
    pub queue_timeout_ms: u64,
}

/// DuckDB-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    /// Maximum concurrent queries (default: 16).
    pub max_concurrency: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_score: 100,
            exact_match_bonus: 50,
            extra_dimension_penalty: 5,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_cluster_columns: 4,
            key_prefix: "_key_".to_string(),
            table_suffix: "_optimized".to_string(),
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_size: 1000,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            warn_only: false,
            dry_run: true,
        }
    }
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            use_query_cache: true,
            maximum_bytes_billed: 0,
            max_concurrent_queries: 30,
            queue_timeout_ms: 1_500,
        }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
        }
    }
}

impl TallyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TallyError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| TallyError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations.
    ///
    /// Search order:
    /// 1. `TALLY_CONFIG` environment variable
    /// 2. `./tally.toml`
    /// 3. `~/.config/tally/config.toml`
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("TALLY_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from TALLY_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring unreadable TALLY_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("tally.toml") {
            tracing::info!("loaded config from ./tally.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tally").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = TallyConfig::default();
        assert_eq!(cfg.router.base_score, 100);
        assert_eq!(cfg.router.exact_match_bonus, 50);
        assert_eq!(cfg.router.extra_dimension_penalty, 5);
        assert_eq!(cfg.optimizer.max_cluster_columns, 4);
        assert_eq!(cfg.optimizer.key_prefix, "_key_");
        assert_eq!(cfg.schema_cache.ttl_secs, 3600);
        assert!(cfg.validation.dry_run);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[router]
exact_match_bonus = 80

[optimizer]
max_cluster_columns = 2

[bigquery]
maximum_bytes_billed = 1000000000
"#;
        let cfg = TallyConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.router.exact_match_bonus, 80);
        assert_eq!(cfg.router.base_score, 100);
        assert_eq!(cfg.optimizer.max_cluster_columns, 2);
        assert_eq!(cfg.optimizer.key_prefix, "_key_");
        assert_eq!(cfg.bigquery.maximum_bytes_billed, 1_000_000_000);
        assert_eq!(cfg.duckdb.max_concurrency, 16);
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let err = TallyConfig::from_toml("[router\nbase_score = ").unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }
}
