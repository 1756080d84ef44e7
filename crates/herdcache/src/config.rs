use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

pub use crate::caching::CacheConfig;

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
    /// The log level for herdcache.
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
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    ///
    /// If this is set, the environment will be read from the `HERDCACHE_ENV`
    /// environment variable.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "herdcache".into(),
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// The memoizing cache and its remote backend.
    pub cache: CacheConfig,
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
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
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
    use std::time::Duration;

    use crate::caching::KeyHashing;

    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache.ttl, Duration::from_secs(60));
        assert!(!cfg.cache.stale.enabled);
        assert!(!cfg.cache.allow_flush);
        assert_eq!(cfg.cache.keys.hashing, KeyHashing::Sha256Lower);
    }

    #[test]
    fn test_empty_config_rejected() {
        let err = Config::from_reader("   \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }

    #[test]
    fn test_cache_config() {
        // Setting a few values must not affect the defaults of the others.
        let yaml = r#"
            logging:
              level: debug
              format: json
            cache:
              hosts: "cache-1:11211,cache-2"
              ttl: 5s
              wait_for_set: true
              stale:
                enabled: true
                additional_ttl: 4s
              keys:
                hashing: xxh3
                prefix: "app:"
              topology:
                poll_interval: 30s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let cache = cfg.cache;
        assert_eq!(cache.hosts, "cache-1:11211,cache-2");
        assert_eq!(cache.ttl, Duration::from_secs(5));
        assert!(cache.wait_for_set);
        assert!(cache.stale.enabled);
        assert_eq!(cache.stale.additional_ttl, Duration::from_secs(4));
        assert_eq!(cache.stale.prefix, "stale");
        assert_eq!(cache.keys.hashing, KeyHashing::Xxh3);
        assert_eq!(cache.keys.prefix.as_deref(), Some("app:"));
        assert_eq!(cache.topology.poll_interval, Duration::from_secs(30));
        assert_eq!(cache.topology.retirement_delay, Duration::from_secs(10));
        assert_eq!(cache.get_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: chatty
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }
}
