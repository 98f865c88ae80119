//! Configuration keys, defaults, and shared constants

/// Name of the key=value configuration file searched in the working
/// directory when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "htraced.conf";

/// Environment variable naming an explicit configuration file path.
pub const ENV_CONF_PATH: &str = "HTRACED_CONF_PATH";

/// Environment variable overriding the log filter (RUST_LOG also works).
pub const ENV_LOG: &str = "HTRACED_LOG";

// Recognized configuration keys.
pub const CONF_WEB_ADDRESS: &str = "web.address";
pub const CONF_HRPC_ADDRESS: &str = "hrpc.address";
pub const CONF_DATA_STORE_DIRECTORIES: &str = "data.store.directories";
pub const CONF_DATA_STORE_CLEAR: &str = "data.store.clear";
pub const CONF_METRICS_HEARTBEAT_PERIOD_MS: &str = "metrics.heartbeat.period.ms";
pub const CONF_METRICS_MAX_ADDR_ENTRIES: &str = "metrics.max.addr.entries";
pub const CONF_DATASTORE_HEARTBEAT_PERIOD_MS: &str = "datastore.heartbeat.period.ms";
pub const CONF_DATASTORE_QUEUE_CAPACITY: &str = "datastore.queue.capacity";
pub const CONF_DATASTORE_BATCH_MAX_SPANS: &str = "datastore.batch.max.spans";
pub const CONF_DATASTORE_FLUSH_INTERVAL_MS: &str = "datastore.flush.interval.ms";
pub const CONF_QUERY_TIMEOUT_MS: &str = "query.timeout.ms";
pub const CONF_LOG_LEVEL: &str = "log.level";
pub const CONF_STARTUP_NOTIFICATION_ADDRESS: &str = "startup.notification.address";

// Defaults.
pub const DEFAULT_WEB_ADDRESS: &str = "127.0.0.1:9096";
pub const DEFAULT_METRICS_HEARTBEAT_PERIOD_MS: u64 = 45_000;
pub const DEFAULT_METRICS_MAX_ADDR_ENTRIES: usize = 2;
pub const DEFAULT_DATASTORE_HEARTBEAT_PERIOD_MS: u64 = 45_000;
pub const DEFAULT_DATASTORE_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_DATASTORE_BATCH_MAX_SPANS: usize = 128;
pub const DEFAULT_DATASTORE_FLUSH_INTERVAL_MS: u64 = 50;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Separator between entries of the data.store.directories list.
pub const DIRECTORY_LIST_SEP: char = ';';

/// Request header naming the default tracer id for a writeSpans batch.
pub const TRACER_ID_HEADER: &str = "htrace-trid";

/// Cap on writeSpans request bodies.
pub const WRITE_SPANS_BODY_LIMIT: usize = 32 * 1024 * 1024;

/// How long shutdown waits for background tasks.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
