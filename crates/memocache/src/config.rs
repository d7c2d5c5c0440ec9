use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::compression::DEFAULT_COMPRESSION_THRESHOLD;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for memocache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "memocache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the store write queue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WriteQueueConfig {
    /// The number of writes to the store that may be in flight at the same time.
    pub max_concurrent_writes: usize,
    /// The number of writes that may be queued up behind the ones in flight.
    ///
    /// Writes which do not fit into the queue anymore are dropped.
    pub max_write_queue_size: usize,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_writes: 20,
            max_write_queue_size: 400,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long to wait for the store to answer a lookup.
    ///
    /// A lookup that takes longer is treated as a cache miss. The actual budget of a lookup is
    /// further capped by the TTL of the memoized function, if that is fixed.
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,

    /// The time-to-live of results of functions wrapped without an explicit TTL.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// The base namespace of all cache keys.
    pub key_namespace: String,

    /// An additional cache key segment.
    ///
    /// Changing this invalidates all previously stored results at once.
    pub memoize_key_namespace: Option<String>,

    /// When set, lookup and computation times are reported under this prefix.
    pub time_label_prefix: Option<String>,

    /// Encoded results of at least this many bytes are compressed before they are stored.
    pub compression_threshold: usize,

    /// Fine-tune store writes.
    pub writes: WriteQueueConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lookup_timeout: Duration::from_millis(1000),
            default_ttl: Duration::from_millis(120_000),
            key_namespace: "memoize".into(),
            memoize_key_namespace: None,
            time_label_prefix: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            writes: WriteQueueConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
