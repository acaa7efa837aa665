use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;
use crate::domain::models::strategy::SelectionStrategy;
use crate::infrastructure::logging::{LogFormat, RotationPolicy};

/// Project configuration directory.
pub const CONFIG_DIR: &str = ".concolic";

/// Prefix of environment overrides, e.g. `CONCOLIC_INTERVAL__TIME=60`.
pub const ENV_PREFIX: &str = "CONCOLIC_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown trace selection strategy: {0}")]
    UnknownTraceStrategy(String),

    #[error("Invalid test pool strategy: {0}. Must be one of: fifo, bfs")]
    InvalidTestStrategy(String),

    #[error("Invalid chunk size: 0. Must be at least 1 byte")]
    ZeroChunkSize,

    #[error("Invalid base cache capacity: 0. Must be at least 1")]
    ZeroCacheCapacity,

    #[error("Seed directories ({seeds}) do not match targets ({items})")]
    SeedMismatch { seeds: usize, items: usize },

    #[error("Unknown architecture: {0}. Must be one of: x86, x64")]
    UnknownArch(String),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Distributed mode needs at least one target in test.items")]
    NoTargets,

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .concolic/config.yaml (project config)
    /// 3. .concolic/local.yaml (project local overrides, optional)
    /// 4. Environment variables (CONCOLIC_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let dir = Path::new(CONFIG_DIR);
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file; environment variables still
    /// override it.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.trace.strategy().is_none() {
            return Err(ConfigError::UnknownTraceStrategy(config.trace.selection.clone()));
        }
        if !config.test_pool.strategy().is_some_and(|s| s.orders_tests()) {
            return Err(ConfigError::InvalidTestStrategy(config.test_pool.strategy.clone()));
        }

        if config.network.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if config.test_pool.base_cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }

        let (seeds, items) = (config.test.seeds.len(), config.test.items.len());
        if seeds != 0 && seeds != items {
            return Err(ConfigError::SeedMismatch { seeds, items });
        }
        if config.is_distributed() && items == 0 {
            return Err(ConfigError::NoTargets);
        }

        if !["x86", "x64"].contains(&config.vm.arch.as_str()) {
            return Err(ConfigError::UnknownArch(config.vm.arch.clone()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if LogFormat::from_str(&config.logging.format).is_none() {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        if RotationPolicy::from_str(&config.logging.rotation).is_none() {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        if config.dispatch.vm_test_multiplier == 0 || config.dispatch.vm_trace_multiplier == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch multipliers must be at least 1".to_string(),
            ));
        }
        if config.image.update && config.image.path.is_none() {
            return Err(ConfigError::ValidationFailed(
                "image.update requires image.path".to_string(),
            ));
        }
        if config.network.connect_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "network.connect_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Strategy names accepted by `trace.selection`.
    pub fn trace_strategies() -> Vec<&'static str> {
        SelectionStrategy::ALL.iter().map(SelectionStrategy::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.network.chunk_size, 64 * 1024);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
mode:
  distributed: true
interval:
  trace: 500
  time: 3600
test:
  items: [base64, md5sum]
  seeds: [seeds/base64, seeds/md5sum]
trace:
  selection: least-treaded
  compress: true
test_pool:
  strategy: bfs
vm:
  arch: x86
logging:
  level: debug
  format: json
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert!(config.is_distributed());
        assert_eq!(config.interval.trace, Some(500));
        assert_eq!(config.interval.tc, None);
        assert_eq!(config.test.items, vec!["base64", "md5sum"]);
        assert_eq!(config.trace.strategy(), Some(SelectionStrategy::LeastTreaded));
        assert!(config.trace.compress);
        assert_eq!(config.vm.arch, "x86");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_unknown_trace_strategy() {
        let mut config = Config::default();
        config.trace.selection = "random".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::UnknownTraceStrategy(s)) if s == "random"
        ));
    }

    #[test]
    fn test_validate_graph_strategy_cannot_order_tests() {
        let mut config = Config::default();
        config.test_pool.strategy = "recursive-descent".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidTestStrategy(_))
        ));
    }

    #[test]
    fn test_validate_zero_chunk_size() {
        let mut config = Config::default();
        config.network.chunk_size = 0;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::ZeroChunkSize)));
    }

    #[test]
    fn test_validate_zero_cache_capacity() {
        let mut config = Config::default();
        config.test_pool.base_cache_capacity = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ZeroCacheCapacity)
        ));
    }

    #[test]
    fn test_validate_seed_mismatch() {
        let mut config = Config::default();
        config.test.items = vec!["a".into(), "b".into()];
        config.test.seeds = vec!["seeds/a".into()];
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::SeedMismatch { seeds: 1, items: 2 })
        ));
    }

    #[test]
    fn test_validate_unknown_arch() {
        let mut config = Config::default();
        config.vm.arch = "arm".to_string();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::UnknownArch(_))));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogFormat(format)) => assert_eq!(format, "xml"),
            other => panic!("Expected InvalidLogFormat error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_distributed_without_targets() {
        let mut config = Config::default();
        config.mode.distributed = true;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::NoTargets)));
    }

    #[test]
    fn test_validate_image_update_without_path() {
        let mut config = Config::default();
        config.image.update = true;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "interval:\n  time: 60\nlogging:\n  level: info").unwrap();
        file.flush().unwrap();

        temp_env::with_vars(
            [
                ("CONCOLIC_INTERVAL__TIME", Some("120")),
                ("CONCOLIC_LOGGING__LEVEL", Some("debug")),
            ],
            || {
                let config = ConfigLoader::load_from_file(file.path()).unwrap();
                assert_eq!(config.interval.time, Some(120));
                assert_eq!(config.logging.level, "debug");
            },
        );
    }

    #[test]
    fn test_env_override_is_validated() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "network:\n  chunk_size: 1024").unwrap();
        file.flush().unwrap();

        temp_env::with_var("CONCOLIC_NETWORK__CHUNK_SIZE", Some("0"), || {
            let err = ConfigLoader::load_from_file(file.path()).unwrap_err();
            assert!(err.to_string().contains("chunk size"));
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigLoader::load_from_file(dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_hierarchical_merging() {
        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "interval:\n  trace: 5\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "interval:\n  trace: 15\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.interval.trace, Some(15), "Override should win");
        assert_eq!(
            config.logging.level, "debug",
            "Override should win for nested fields"
        );
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }
}
