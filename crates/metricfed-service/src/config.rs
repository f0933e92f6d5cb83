use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::remote::BackendConfig;

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
    /// The log level for the fetch layer.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "metricfed".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning the discovery result cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FindCacheConfig {
    /// Maximum number of cached discovery payloads.
    pub capacity: u64,

    /// How long a cached discovery payload stays valid.
    ///
    /// Cache keys are quantized to this duration, so two queries issued
    /// within the same window share an entry.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for FindCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Runtime configuration for the federated fetch layer.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// The remote backends to federate over.
    pub backends: Arc<[BackendConfig]>,

    /// The timeout for discovery requests against a backend.
    #[serde(with = "humantime_serde")]
    pub find_timeout: Duration,

    /// The timeout for reading and parsing a bulk data response.
    ///
    /// Cached fetch results are swept once they are twice this old, so this
    /// value also bounds how long a stale result can be served.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// The timeout for establishing a connection to a backend.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a backend stays unavailable after a failed request.
    ///
    /// Within this window no new requests are sent to the backend at all.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Number of tracked fetch keys after which the lazy eviction sweep
    /// starts running.
    pub fetch_cache_size_limit: usize,

    /// Fine-tune the discovery result cache.
    pub find_cache: FindCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            backends: Arc::from(vec![]),
            find_timeout: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(6),
            connect_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(60),
            fetch_cache_size_limit: 1_000,
            find_cache: FindCacheConfig::default(),
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

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.retry_delay, Duration::from_secs(60));
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(6));
        assert_eq!(cfg.fetch_cache_size_limit, 1_000);
        assert_eq!(cfg.find_cache.ttl, Duration::from_secs(300));
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn test_timeouts_in_human_units() {
        // Setting one timeout must not affect the defaults of the others.
        let yaml = r#"
            fetch_timeout: 30s
            find_cache:
              ttl: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(30));
        assert_eq!(cfg.find_timeout, Duration::from_secs(3));
        assert_eq!(cfg.find_cache.ttl, Duration::from_secs(3600));
        assert_eq!(cfg.find_cache.capacity, 10_000);
    }

    #[test]
    fn test_backends() {
        let yaml = r#"
            backends:
              - type: graphite
                id: peer-1
                host: "peer-1:8080"
              - type: opentsdb
                id: tsdb
                host: "tsdb:4242"
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[0].id().as_str(), "peer-1");
        assert_eq!(cfg.backends[1].host(), "tsdb:4242");
    }

    #[test]
    fn test_log_level_names() {
        let yaml = r#"
            logging:
              level: debug
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
