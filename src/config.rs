use crate::error::{Result, ScrapeError};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Port appended to bootstrap hosts given without one.
pub const DEFAULT_KAFKA_PORT: u16 = 9092;

/// A regex that can never match; used when no group pattern is configured.
const MATCH_NOTHING: &str = ".^";

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Routes served next to the metrics endpoint.
pub const RESERVED_HTTP_PATHS: [&str; 3] = ["/health", "/ready", "/status"];

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\??([^}:-]+)(?::-([^}]*))?\}").expect("env substitution pattern is valid")
});

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

/// Timing knobs for metadata refresh and offset fetching.
#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub metadata_refresh_interval: Duration,
    /// Floor: a unit is never fetched again sooner than this.
    #[serde(with = "humantime_serde", default = "default_fetch_min_interval")]
    pub fetch_offset_min_interval: Duration,
    /// Ceiling: a unit is always fetched once its data is this old.
    #[serde(with = "humantime_serde", default = "default_fetch_max_interval")]
    pub fetch_offset_max_interval: Duration,
    /// Scheduler wake-up period. Derived from the floor when unset.
    #[serde(with = "humantime_serde", default)]
    pub tick_interval: Option<Duration>,
    /// Cap on concurrent opportunistic fetches. Unbounded when unset.
    #[serde(default)]
    pub max_concurrent_fetches: Option<usize>,
    #[serde(with = "humantime_serde", default = "default_kafka_timeout")]
    pub kafka_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterConfig {
    /// Comma-separated `host[:port]` list.
    #[serde(default)]
    pub bootstrap_servers: String,
    /// Topic inclusion pattern. Empty matches every topic.
    #[serde(default)]
    pub topics: String,
    /// Group inclusion pattern. Empty matches no group.
    #[serde(default)]
    pub groups: String,
    #[serde(default)]
    pub topic_exclude: Vec<String>,
    #[serde(default)]
    pub group_exclude: Vec<String>,
    #[serde(default)]
    pub consumer_properties: HashMap<String, String>,
}

/// Values supplied on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub brokers: Option<String>,
    pub topics: Option<String>,
    pub groups: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub refresh: Option<Duration>,
    pub fetch_min: Option<Duration>,
    pub fetch_max: Option<Duration>,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    9000
}

fn default_metrics_path() -> String {
    "/".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_fetch_min_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_fetch_max_interval() -> Duration {
    Duration::from_secs(40)
}

fn default_kafka_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            metrics_path: default_metrics_path(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            metadata_refresh_interval: default_refresh_interval(),
            fetch_offset_min_interval: default_fetch_min_interval(),
            fetch_offset_max_interval: default_fetch_max_interval(),
            tick_interval: None,
            max_concurrent_fetches: None,
            kafka_timeout: default_kafka_timeout(),
        }
    }
}

impl Config {
    /// Load the configuration file (if any), apply CLI overrides and validate.
    pub fn load(path: Option<&str>, overrides: &Overrides) -> Result<Config> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(config_path: &str) -> Result<Config> {
        if !Path::new(config_path).exists() {
            return Err(ScrapeError::Config(format!(
                "Configuration file not found: {config_path}"
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let content = Self::substitute_env_vars(&content);

        toml::from_str(&content)
            .map_err(|e| ScrapeError::Config(format!("TOML parse error: {e}")))
    }

    fn substitute_env_vars(content: &str) -> String {
        // ${VAR}, ${?VAR} and ${VAR:-default}; unset without default becomes ""
        ENV_VAR_PATTERN
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map_or("", |m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            })
            .to_string()
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(brokers) = &overrides.brokers {
            self.cluster.bootstrap_servers.clone_from(brokers);
        }
        if let Some(topics) = &overrides.topics {
            self.cluster.topics.clone_from(topics);
        }
        if let Some(groups) = &overrides.groups {
            self.cluster.groups.clone_from(groups);
        }
        if let Some(port) = overrides.port {
            self.exporter.http_port = port;
        }
        if let Some(path) = &overrides.path {
            self.exporter.metrics_path.clone_from(path);
        }
        if let Some(refresh) = overrides.refresh {
            self.scrape.metadata_refresh_interval = refresh;
        }
        if let Some(min) = overrides.fetch_min {
            self.scrape.fetch_offset_min_interval = min;
        }
        if let Some(max) = overrides.fetch_max {
            self.scrape.fetch_offset_max_interval = max;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.scrape.validate()?;

        if !self.exporter.metrics_path.starts_with('/') {
            return Err(ScrapeError::Config(format!(
                "metrics_path must start with '/': {}",
                self.exporter.metrics_path
            )));
        }

        if RESERVED_HTTP_PATHS.contains(&self.exporter.metrics_path.as_str()) {
            return Err(ScrapeError::Config(format!(
                "metrics_path {} collides with a built-in endpoint",
                self.exporter.metrics_path
            )));
        }

        Ok(())
    }
}

impl ScrapeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.metadata_refresh_interval.is_zero() {
            return Err(ScrapeError::Config(
                "metadata_refresh_interval must be greater than zero".to_string(),
            ));
        }

        if self.fetch_offset_min_interval.is_zero() {
            return Err(ScrapeError::Config(
                "fetch_offset_min_interval must be greater than zero".to_string(),
            ));
        }

        if self.fetch_offset_max_interval <= self.fetch_offset_min_interval {
            return Err(ScrapeError::Config(format!(
                "fetch_offset_max_interval ({:?}) must exceed fetch_offset_min_interval ({:?})",
                self.fetch_offset_max_interval, self.fetch_offset_min_interval
            )));
        }

        if let Some(tick) = self.tick_interval
            && (tick.is_zero() || tick > self.fetch_offset_min_interval)
        {
            return Err(ScrapeError::Config(format!(
                "tick_interval ({tick:?}) must be non-zero and no coarser than fetch_offset_min_interval ({:?})",
                self.fetch_offset_min_interval
            )));
        }

        if self.max_concurrent_fetches == Some(0) {
            return Err(ScrapeError::Config(
                "max_concurrent_fetches must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Scheduler wake-up period: the configured value, or a third of the floor
    /// clamped to `[100ms, floor]`.
    pub fn effective_tick_interval(&self) -> Duration {
        self.tick_interval.unwrap_or_else(|| {
            (self.fetch_offset_min_interval / 3)
                .max(MIN_TICK_INTERVAL)
                .min(self.fetch_offset_min_interval)
        })
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_hosts().is_empty() {
            return Err(ScrapeError::Config(
                "bootstrap_servers cannot be empty".to_string(),
            ));
        }

        self.compile_filters()?;
        Ok(())
    }

    /// Bootstrap endpoints with the default port filled in.
    pub fn bootstrap_hosts(&self) -> Vec<String> {
        parse_bootstrap_servers(&self.bootstrap_servers)
    }

    pub fn compile_filters(&self) -> Result<CompiledFilters> {
        let groups = if self.groups.is_empty() {
            MATCH_NOTHING
        } else {
            self.groups.as_str()
        };

        let topic_exclude = self
            .topic_exclude
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let group_exclude = self
            .group_exclude
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(CompiledFilters {
            topics: Regex::new(&self.topics)?,
            groups: Regex::new(groups)?,
            topic_exclude,
            group_exclude,
        })
    }
}

pub fn parse_bootstrap_servers(servers: &str) -> Vec<String> {
    servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains(':') {
                s.to_string()
            } else {
                format!("{s}:{DEFAULT_KAFKA_PORT}")
            }
        })
        .collect()
}

/// Topic and group predicates. Pure; clone freely across tasks.
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    pub topics: Regex,
    pub groups: Regex,
    pub topic_exclude: Vec<Regex>,
    pub group_exclude: Vec<Regex>,
}

impl CompiledFilters {
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topics.is_match(topic) && !self.topic_exclude.iter().any(|r| r.is_match(topic))
    }

    pub fn matches_group(&self, group: &str) -> bool {
        self.groups.is_match(group) && !self.group_exclude.iter().any(|r| r.is_match(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_loads_from_file() {
        let file = write_config(
            r#"
[exporter]
http_port = 9100
metrics_path = "/metrics"

[scrape]
metadata_refresh_interval = "30s"
fetch_offset_min_interval = "10s"
fetch_offset_max_interval = "25s"
max_concurrent_fetches = 32

[cluster]
bootstrap_servers = "kafka-1,kafka-2:9093"
topics = "^orders-.*"
groups = "^billing$"
"#,
        );

        let config =
            Config::load(Some(file.path().to_str().unwrap()), &Overrides::default()).unwrap();
        assert_eq!(config.exporter.http_port, 9100);
        assert_eq!(config.exporter.metrics_path, "/metrics");
        assert_eq!(
            config.scrape.metadata_refresh_interval,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.scrape.fetch_offset_min_interval,
            Duration::from_secs(10)
        );
        assert_eq!(config.scrape.max_concurrent_fetches, Some(32));
        assert_eq!(
            config.cluster.bootstrap_hosts(),
            vec!["kafka-1:9092".to_string(), "kafka-2:9093".to_string()]
        );
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::load(
            None,
            &Overrides {
                brokers: Some("localhost".to_string()),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(config.exporter.http_port, 9000);
        assert_eq!(config.exporter.http_host, "0.0.0.0");
        assert_eq!(config.exporter.metrics_path, "/");
        assert_eq!(
            config.scrape.metadata_refresh_interval,
            Duration::from_secs(60)
        );
        assert_eq!(
            config.scrape.fetch_offset_min_interval,
            Duration::from_secs(15)
        );
        assert_eq!(
            config.scrape.fetch_offset_max_interval,
            Duration::from_secs(40)
        );
        assert_eq!(config.scrape.max_concurrent_fetches, None);
        assert_eq!(config.scrape.effective_tick_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = write_config(
            r#"
[scrape]
fetch_offset_min_interval = "10s"
fetch_offset_max_interval = "20s"

[cluster]
bootstrap_servers = "from-file:9092"
"#,
        );

        let overrides = Overrides {
            brokers: Some("from-cli".to_string()),
            fetch_max: Some(Duration::from_secs(30)),
            port: Some(9999),
            ..Overrides::default()
        };
        let config = Config::load(Some(file.path().to_str().unwrap()), &overrides).unwrap();

        assert_eq!(config.cluster.bootstrap_hosts(), vec!["from-cli:9092"]);
        assert_eq!(
            config.scrape.fetch_offset_min_interval,
            Duration::from_secs(10)
        );
        assert_eq!(
            config.scrape.fetch_offset_max_interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.exporter.http_port, 9999);
    }

    #[test]
    fn test_config_env_with_default() {
        let file = write_config(
            r#"
[cluster]
bootstrap_servers = "${KAFKA_OFFSET_EXPORTER_UNSET_VAR:-kafka:29092}"
"#,
        );

        let config =
            Config::load(Some(file.path().to_str().unwrap()), &Overrides::default()).unwrap();
        assert_eq!(config.cluster.bootstrap_hosts(), vec!["kafka:29092"]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = Config::load(Some("/nonexistent/offset-exporter.toml"), &Overrides::default());
        assert!(matches!(result, Err(ScrapeError::Config(_))));
    }

    #[test]
    fn test_config_validates_bootstrap_servers() {
        let result = Config::load(
            None,
            &Overrides {
                brokers: Some(" , ".to_string()),
                ..Overrides::default()
            },
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("bootstrap_servers cannot be empty"));
    }

    #[test]
    fn test_ceiling_must_exceed_floor() {
        let overrides = Overrides {
            brokers: Some("localhost".to_string()),
            fetch_min: Some(Duration::from_secs(30)),
            fetch_max: Some(Duration::from_secs(30)),
            ..Overrides::default()
        };
        let err = Config::load(None, &overrides).unwrap_err().to_string();
        assert!(err.contains("must exceed"));
    }

    #[test]
    fn test_tick_coarser_than_floor_rejected() {
        let scrape = ScrapeConfig {
            tick_interval: Some(Duration::from_secs(20)),
            ..ScrapeConfig::default()
        };
        assert!(scrape.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_cap_rejected() {
        let scrape = ScrapeConfig {
            max_concurrent_fetches: Some(0),
            ..ScrapeConfig::default()
        };
        assert!(scrape.validate().is_err());
    }

    #[test]
    fn test_effective_tick_is_clamped() {
        let scrape = ScrapeConfig {
            fetch_offset_min_interval: Duration::from_millis(150),
            fetch_offset_max_interval: Duration::from_secs(1),
            ..ScrapeConfig::default()
        };
        assert_eq!(scrape.effective_tick_interval(), Duration::from_millis(100));

        let scrape = ScrapeConfig {
            fetch_offset_min_interval: Duration::from_millis(50),
            fetch_offset_max_interval: Duration::from_secs(1),
            ..ScrapeConfig::default()
        };
        assert_eq!(scrape.effective_tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_metrics_path_must_not_shadow_health_routes() {
        for path in ["metrics", "/health"] {
            let overrides = Overrides {
                brokers: Some("localhost".to_string()),
                path: Some(path.to_string()),
                ..Overrides::default()
            };
            let result = Config::load(None, &overrides);
            assert!(matches!(result, Err(ScrapeError::Config(_))), "{path} accepted");
        }
    }

    #[test]
    fn test_malformed_pattern_rejected() {
        let cluster = ClusterConfig {
            bootstrap_servers: "localhost".to_string(),
            topics: "(unclosed".to_string(),
            ..ClusterConfig::default()
        };
        assert!(matches!(cluster.validate(), Err(ScrapeError::Regex(_))));
    }

    #[test]
    fn test_bootstrap_default_port() {
        assert_eq!(
            parse_bootstrap_servers("a, b:9093 ,c"),
            vec!["a:9092", "b:9093", "c:9092"]
        );
        assert!(parse_bootstrap_servers("").is_empty());
    }

    #[test]
    fn test_empty_topic_pattern_matches_all() {
        let filters = ClusterConfig::default().compile_filters().unwrap();
        assert!(filters.matches_topic("orders"));
        assert!(filters.matches_topic("__consumer_offsets"));
    }

    #[test]
    fn test_empty_group_pattern_matches_nothing() {
        let filters = ClusterConfig::default().compile_filters().unwrap();
        assert!(!filters.matches_group("billing"));
        assert!(!filters.matches_group(""));
    }

    #[test]
    fn test_topic_filter_matching_nothing_is_valid() {
        let cluster = ClusterConfig {
            bootstrap_servers: "localhost".to_string(),
            topics: "^does-not-exist$".to_string(),
            ..ClusterConfig::default()
        };
        let filters = cluster.compile_filters().unwrap();
        assert!(!filters.matches_topic("orders"));
    }

    #[test]
    fn test_exclusions_reject() {
        let cluster = ClusterConfig {
            groups: ".*".to_string(),
            topic_exclude: vec!["^__.*".to_string()],
            group_exclude: vec!["^internal-.*".to_string()],
            ..ClusterConfig::default()
        };
        let filters = cluster.compile_filters().unwrap();

        assert!(filters.matches_group("billing"));
        assert!(!filters.matches_group("internal-audit"));
        assert!(filters.matches_topic("orders"));
        assert!(!filters.matches_topic("__consumer_offsets"));
    }
}
