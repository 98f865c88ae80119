//! Application configuration
//!
//! Configuration is plain `key=value` properties. Sources are layered, lowest
//! priority first: built-in defaults, then the configuration file, then
//! `-Dkey=value` / `-Dkey` command-line overrides. The merged map is parsed
//! into a typed config and validated before the daemon starts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use super::cli::Cli;
use super::constants::{
    CONF_DATA_STORE_CLEAR, CONF_DATA_STORE_DIRECTORIES, CONF_DATASTORE_BATCH_MAX_SPANS,
    CONF_DATASTORE_FLUSH_INTERVAL_MS, CONF_DATASTORE_HEARTBEAT_PERIOD_MS,
    CONF_DATASTORE_QUEUE_CAPACITY, CONF_HRPC_ADDRESS, CONF_LOG_LEVEL,
    CONF_METRICS_HEARTBEAT_PERIOD_MS, CONF_METRICS_MAX_ADDR_ENTRIES, CONF_QUERY_TIMEOUT_MS,
    CONF_STARTUP_NOTIFICATION_ADDRESS, CONF_WEB_ADDRESS, CONFIG_FILE_NAME,
    DEFAULT_DATASTORE_BATCH_MAX_SPANS, DEFAULT_DATASTORE_FLUSH_INTERVAL_MS,
    DEFAULT_DATASTORE_HEARTBEAT_PERIOD_MS, DEFAULT_DATASTORE_QUEUE_CAPACITY, DEFAULT_LOG_LEVEL,
    DEFAULT_METRICS_HEARTBEAT_PERIOD_MS, DEFAULT_METRICS_MAX_ADDR_ENTRIES,
    DEFAULT_QUERY_TIMEOUT_MS, DEFAULT_WEB_ADDRESS, DIRECTORY_LIST_SEP,
};
use crate::data::DataStoreConfig;
use crate::data::store::writer::ShardWriterConfig;
use crate::domain::metrics::MetricsSinkConfig;

/// Raw merged key=value map.
#[derive(Debug, Default, Clone)]
pub struct ConfigMap {
    values: BTreeMap<String, String>,
}

impl ConfigMap {
    fn defaults() -> Self {
        let mut values = BTreeMap::new();
        let mut set = |k: &str, v: String| values.insert(k.to_string(), v);
        set(CONF_WEB_ADDRESS, DEFAULT_WEB_ADDRESS.to_string());
        set(CONF_LOG_LEVEL, DEFAULT_LOG_LEVEL.to_string());
        set(
            CONF_METRICS_HEARTBEAT_PERIOD_MS,
            DEFAULT_METRICS_HEARTBEAT_PERIOD_MS.to_string(),
        );
        set(
            CONF_METRICS_MAX_ADDR_ENTRIES,
            DEFAULT_METRICS_MAX_ADDR_ENTRIES.to_string(),
        );
        set(
            CONF_DATASTORE_HEARTBEAT_PERIOD_MS,
            DEFAULT_DATASTORE_HEARTBEAT_PERIOD_MS.to_string(),
        );
        set(
            CONF_DATASTORE_QUEUE_CAPACITY,
            DEFAULT_DATASTORE_QUEUE_CAPACITY.to_string(),
        );
        set(
            CONF_DATASTORE_BATCH_MAX_SPANS,
            DEFAULT_DATASTORE_BATCH_MAX_SPANS.to_string(),
        );
        set(
            CONF_DATASTORE_FLUSH_INTERVAL_MS,
            DEFAULT_DATASTORE_FLUSH_INTERVAL_MS.to_string(),
        );
        set(CONF_QUERY_TIMEOUT_MS, DEFAULT_QUERY_TIMEOUT_MS.to_string());
        ConfigMap { values }
    }

    /// Parse a properties file: one `key=value` per line, `#` comments.
    fn load_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut values = BTreeMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                anyhow::bail!(
                    "{}:{}: expected key=value, got '{}'",
                    path.display(),
                    lineno + 1,
                    line
                );
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(ConfigMap { values })
    }

    /// Overlay another map on top of this one.
    fn merge(&mut self, other: ConfigMap) {
        for (key, value) in other.values {
            tracing::trace!(key = %key, "Merging config key");
            self.values.insert(key, value);
        }
    }

    /// Apply `-Dkey=value` (or `-Dkey`, meaning true) overrides.
    fn apply_defines(&mut self, defines: &[String]) {
        for define in defines {
            match define.split_once('=') {
                Some((key, value)) => {
                    self.values.insert(key.to_string(), value.to_string());
                }
                None => {
                    self.values.insert(define.clone(), "true".to_string());
                }
            }
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|raw| {
                raw.parse()
                    .with_context(|| format!("Configuration key {} is not a number: '{}'", key, raw))
            })
            .transpose()
    }

    fn get_bool(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            None | Some("") => Ok(false),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => anyhow::bail!(
                "Configuration key {} must be true or false, got '{}'",
                key,
                other
            ),
        }
    }
}

/// Final merged application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the REST server binds.
    pub web_address: SocketAddr,
    /// Address the binary RPC server binds; None disables it.
    pub hrpc_address: Option<SocketAddr>,
    /// Shard data directories, in configuration order.
    pub data_store_directories: Vec<PathBuf>,
    /// Wipe the shard directories before initializing.
    pub data_store_clear: bool,
    pub metrics_heartbeat_period: Duration,
    pub metrics_max_addr_entries: usize,
    pub datastore_heartbeat_period: Duration,
    pub datastore_queue_capacity: usize,
    pub datastore_batch_max_spans: usize,
    pub datastore_flush_interval: Duration,
    pub query_timeout: Duration,
    pub log_level: String,
    /// One-shot TCP notification target; None disables it.
    pub startup_notification_address: Option<String>,
}

impl AppConfig {
    /// Load configuration from defaults, the config file, and CLI overrides.
    pub fn load(cli: &Cli) -> Result<AppConfig> {
        tracing::debug!("Loading application configuration");
        let mut map = ConfigMap::defaults();

        let file_path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.clone())
            }
            None => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                local.exists().then_some(local)
            }
        };
        if let Some(path) = &file_path {
            map.merge(ConfigMap::load_file(path)?);
        }
        map.apply_defines(&cli.defines);

        let config = Self::from_map(&map)?;
        config.validate()?;
        tracing::debug!(
            web_address = %config.web_address,
            hrpc_address = ?config.hrpc_address,
            directories = config.data_store_directories.len(),
            clear = config.data_store_clear,
            config_file = ?file_path,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn from_map(map: &ConfigMap) -> Result<AppConfig> {
        let web_address: SocketAddr = map
            .get(CONF_WEB_ADDRESS)
            .unwrap_or(DEFAULT_WEB_ADDRESS)
            .parse()
            .with_context(|| format!("Failed to parse {}", CONF_WEB_ADDRESS))?;

        let hrpc_address = match map.get(CONF_HRPC_ADDRESS) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse()
                    .with_context(|| format!("Failed to parse {}", CONF_HRPC_ADDRESS))?,
            ),
        };

        let data_store_directories = match map.get(CONF_DATA_STORE_DIRECTORIES) {
            None | Some("") => default_data_directories(),
            Some(raw) => raw
                .split(DIRECTORY_LIST_SEP)
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect(),
        };

        Ok(AppConfig {
            web_address,
            hrpc_address,
            data_store_directories,
            data_store_clear: map.get_bool(CONF_DATA_STORE_CLEAR)?,
            metrics_heartbeat_period: Duration::from_millis(
                map.get_u64(CONF_METRICS_HEARTBEAT_PERIOD_MS)?
                    .unwrap_or(DEFAULT_METRICS_HEARTBEAT_PERIOD_MS),
            ),
            metrics_max_addr_entries: map
                .get_u64(CONF_METRICS_MAX_ADDR_ENTRIES)?
                .unwrap_or(DEFAULT_METRICS_MAX_ADDR_ENTRIES as u64)
                as usize,
            datastore_heartbeat_period: Duration::from_millis(
                map.get_u64(CONF_DATASTORE_HEARTBEAT_PERIOD_MS)?
                    .unwrap_or(DEFAULT_DATASTORE_HEARTBEAT_PERIOD_MS),
            ),
            datastore_queue_capacity: map
                .get_u64(CONF_DATASTORE_QUEUE_CAPACITY)?
                .unwrap_or(DEFAULT_DATASTORE_QUEUE_CAPACITY as u64)
                as usize,
            datastore_batch_max_spans: map
                .get_u64(CONF_DATASTORE_BATCH_MAX_SPANS)?
                .unwrap_or(DEFAULT_DATASTORE_BATCH_MAX_SPANS as u64)
                as usize,
            datastore_flush_interval: Duration::from_millis(
                map.get_u64(CONF_DATASTORE_FLUSH_INTERVAL_MS)?
                    .unwrap_or(DEFAULT_DATASTORE_FLUSH_INTERVAL_MS),
            ),
            query_timeout: Duration::from_millis(
                map.get_u64(CONF_QUERY_TIMEOUT_MS)?
                    .unwrap_or(DEFAULT_QUERY_TIMEOUT_MS),
            ),
            log_level: map
                .get(CONF_LOG_LEVEL)
                .unwrap_or(DEFAULT_LOG_LEVEL)
                .to_string(),
            startup_notification_address: map
                .get(CONF_STARTUP_NOTIFICATION_ADDRESS)
                .filter(|raw| !raw.is_empty())
                .map(String::from),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.data_store_directories.is_empty() {
            anyhow::bail!(
                "Configuration error: {} must name at least one directory",
                CONF_DATA_STORE_DIRECTORIES
            );
        }
        if self.datastore_batch_max_spans == 0 {
            anyhow::bail!(
                "Configuration error: {} must be greater than 0",
                CONF_DATASTORE_BATCH_MAX_SPANS
            );
        }
        if self.datastore_queue_capacity == 0 {
            anyhow::bail!(
                "Configuration error: {} must be greater than 0",
                CONF_DATASTORE_QUEUE_CAPACITY
            );
        }
        if let Some(hrpc) = self.hrpc_address {
            if hrpc == self.web_address {
                anyhow::bail!(
                    "Configuration error: {} and {} cannot be the same address",
                    CONF_WEB_ADDRESS,
                    CONF_HRPC_ADDRESS
                );
            }
        }
        Ok(())
    }

    pub fn datastore_config(&self) -> DataStoreConfig {
        DataStoreConfig {
            directories: self.data_store_directories.clone(),
            clear: self.data_store_clear,
            writer: ShardWriterConfig {
                queue_capacity: self.datastore_queue_capacity,
                batch_max_spans: self.datastore_batch_max_spans,
                flush_interval: self.datastore_flush_interval,
            },
            heartbeat_period: self.datastore_heartbeat_period,
        }
    }

    pub fn metrics_config(&self) -> MetricsSinkConfig {
        MetricsSinkConfig {
            max_addr_entries: self.metrics_max_addr_entries,
            heartbeat_period: self.metrics_heartbeat_period,
        }
    }
}

fn default_data_directories() -> Vec<PathBuf> {
    let base = std::env::temp_dir().join("htraced");
    vec![base.join("shard0"), base.join("shard1")]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with(defines: &[&str]) -> Cli {
        Cli {
            defines: defines.iter().map(|s| s.to_string()).collect(),
            config: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::load(&cli_with(&[])).unwrap();
        assert_eq!(config.web_address.to_string(), DEFAULT_WEB_ADDRESS);
        assert!(config.hrpc_address.is_none());
        assert_eq!(config.data_store_directories.len(), 2);
        assert!(!config.data_store_clear);
        assert_eq!(config.metrics_max_addr_entries, 2);
        assert_eq!(config.datastore_queue_capacity, 1024);
        assert_eq!(config.datastore_batch_max_spans, 128);
        assert_eq!(config.datastore_flush_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_defines_override() {
        let config = AppConfig::load(&cli_with(&[
            "web.address=0.0.0.0:8080",
            "data.store.directories=/data/a;/data/b;/data/c",
            "data.store.clear",
        ]))
        .unwrap();
        assert_eq!(config.web_address.to_string(), "0.0.0.0:8080");
        assert_eq!(
            config.data_store_directories,
            vec![
                PathBuf::from("/data/a"),
                PathBuf::from("/data/b"),
                PathBuf::from("/data/c"),
            ]
        );
        assert!(config.data_store_clear);
    }

    #[test]
    fn test_file_then_defines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("htraced.conf");
        std::fs::write(
            &path,
            "# comment\nweb.address=127.0.0.1:7000\nlog.level=debug\n",
        )
        .unwrap();
        let cli = Cli {
            defines: vec!["web.address=127.0.0.1:7001".to_string()],
            config: Some(path),
        };
        let config = AppConfig::load(&cli).unwrap();
        // Command-line -D overrides win over the file.
        assert_eq!(config.web_address.to_string(), "127.0.0.1:7001");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(AppConfig::load(&cli_with(&["web.address=nonsense"])).is_err());
        assert!(AppConfig::load(&cli_with(&["datastore.queue.capacity=abc"])).is_err());
        assert!(AppConfig::load(&cli_with(&["data.store.clear=maybe"])).is_err());
        assert!(
            AppConfig::load(&cli_with(&[
                "web.address=127.0.0.1:9000",
                "hrpc.address=127.0.0.1:9000",
            ]))
            .is_err()
        );
    }
}
