//! Configuration for the job queues, the distribution queues and the job scheduler.
//!
//! Configuration can be built in code, read from a TOML file, or read from `SLING_JOBS_*`
//! environment variables:
//!
//! ```toml
//! [main_queue]
//! name = "main"
//! max_retries = 10
//! retry_delay = "2s"
//! max_parallel = 15
//!
//! [[queues]]
//! name = "replication"
//! topics = ["org/apache/sling/replication/-"]
//! max_retries = -1
//! retry_delay = "250ms"
//! max_parallel = 1
//! keep_jobs = true
//!
//! [distribution]
//! add_timeout = "10s"
//! capacity = 10000
//! processing_interval = "1s"
//! ```
use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "SLING_JOBS_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helpers for durations written as `"250ms"`, `"30s"`, `"5m"`, `"1h"` or `"1d"`.
///
/// A bare number is read as seconds.
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis % 1000 != 0 {
            serializer.serialize_str(&format!("{millis}ms"))
        } else {
            let secs = millis / 1000;
            if secs != 0 && secs % 3600 == 0 {
                serializer.serialize_str(&format!("{}h", secs / 3600))
            } else if secs != 0 && secs % 60 == 0 {
                serializer.serialize_str(&format!("{}m", secs / 60))
            } else {
                serializer.serialize_str(&format!("{secs}s"))
            }
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Invalid duration format: {s}"))?;
        let (num, suffix) = s.split_at(split);
        let num: u64 = num
            .parse()
            .map_err(|_| format!("Invalid number in duration: {s}"))?;

        let unit = match suffix {
            "ms" => return Ok(Duration::from_millis(num)),
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {suffix}. Use ms, s, m, h, or d"
                ))
            }
        };
        num.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {s}"))
    }
}

/// Retries written as a number, `-1` meaning unlimited.
mod retries {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(retries: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match retries {
            Some(retries) => serializer.serialize_i64(i64::from(*retries)),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        match i64::deserialize(deserializer)? {
            -1 => Ok(None),
            value => u32::try_from(value)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("Invalid number of retries: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Handles every job no other queue matches.
    pub main_queue: QueueConfig,
    pub queues: Vec<QueueConfig>,
    pub distribution: DistributionConfig,
    pub scheduler: SchedulerConfig,
}

impl JobsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SLING_JOBS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let invalid = || ConfigError::InvalidValue {
                key: key.clone(),
                value: value.clone(),
            };
            let main = &mut config.main_queue;
            match name {
                "MAIN_MAX_RETRIES" => {
                    main.max_retries = match value.parse::<i64>().map_err(|_| invalid())? {
                        -1 => None,
                        retries => Some(u32::try_from(retries).map_err(|_| invalid())?),
                    }
                }
                "MAIN_RETRY_DELAY" => {
                    main.retry_delay = duration::parse(&value).map_err(|_| invalid())?
                }
                "MAIN_TYPE" => main.queue_type = value.parse().map_err(|_| invalid())?,
                "MAIN_MAX_PARALLEL" => main.max_parallel = value.parse().map_err(|_| invalid())?,
                "MAIN_KEEP_JOBS" => main.keep_jobs = value.parse().map_err(|_| invalid())?,
                "DISTRIBUTION_ADD_TIMEOUT" => {
                    config.distribution.add_timeout =
                        duration::parse(&value).map_err(|_| invalid())?
                }
                "DISTRIBUTION_CAPACITY" => {
                    config.distribution.capacity = value.parse().map_err(|_| invalid())?
                }
                "DISTRIBUTION_PROCESSING_INTERVAL" => {
                    config.distribution.processing_interval =
                        duration::parse(&value).map_err(|_| invalid())?
                }
                "SCHEDULER_ENABLED" => {
                    config.scheduler.enabled = value.parse().map_err(|_| invalid())?
                }
                _ => tracing::debug!(%key, "Ignoring unknown configuration variable {key}"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_main_queue(self, main_queue: QueueConfig) -> Self {
        Self { main_queue, ..self }
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_distribution(self, distribution: DistributionConfig) -> Self {
        Self {
            distribution,
            ..self
        }
    }

    pub fn with_scheduler(self, scheduler: SchedulerConfig) -> Self {
        Self { scheduler, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        for queue in self.all_queues() {
            if queue.name.trim().is_empty() {
                return Err(ConfigError::Invalid("queue without a name".to_owned()));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate queue {:?}",
                    queue.name
                )));
            }
            if queue.max_parallel == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue {:?} must allow at least one parallel job",
                    queue.name
                )));
            }
        }
        if let Some(queue) = self.queues.iter().find(|queue| queue.topics.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "queue {:?} does not list any topics",
                queue.name
            )));
        }
        if self.distribution.capacity == 0 {
            return Err(ConfigError::Invalid(
                "distribution capacity must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// The main queue followed by the configured queues.
    pub fn all_queues(&self) -> impl Iterator<Item = &QueueConfig> {
        std::iter::once(&self.main_queue).chain(self.queues.iter())
    }

    /// The queue processing jobs of `topic`: the highest ranked matching queue, the first one
    /// configured on a tie, else the main queue.
    pub fn queue_for(&self, topic: &str) -> &QueueConfig {
        self.queues
            .iter()
            .filter(|queue| queue.matches(topic))
            .fold(None, |best: Option<&QueueConfig>, queue| match best {
                Some(best) if best.ranking >= queue.ranking => Some(best),
                _ => Some(queue),
            })
            .unwrap_or(&self.main_queue)
    }
}

/// How a queue processes its jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// One job at a time in queue order. A failed job is retried before any later job runs.
    Ordered,
    #[default]
    Unordered,
    /// Jobs are stored but never processed.
    Ignore,
    /// Jobs are dropped as soon as they are added.
    Drop,
}

impl std::str::FromStr for QueueType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ordered" => Ok(Self::Ordered),
            "unordered" => Ok(Self::Unordered),
            "ignore" => Ok(Self::Ignore),
            "drop" => Ok(Self::Drop),
            _ => Err(ConfigError::Invalid(format!("unknown queue type {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    /// Topic patterns: exact, `a/b/*` for direct children of `a/b`, `a/b/-` for anything below
    /// `a/b`, or `*` for everything.
    pub topics: Vec<String>,
    /// [`None`] retries forever.
    #[serde(with = "retries")]
    pub max_retries: Option<u32>,
    #[serde(with = "duration")]
    pub retry_delay: Duration,
    pub max_parallel: usize,
    /// Keep succeeded jobs instead of removing them.
    pub keep_jobs: bool,
    pub ranking: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "main".to_owned(),
            queue_type: QueueType::Unordered,
            topics: vec![],
            max_retries: Some(10),
            retry_delay: Duration::from_secs(2),
            max_parallel: 15,
            keep_jobs: false,
            ranking: 0,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_topics<T: Into<String>>(self, topics: impl IntoIterator<Item = T>) -> Self {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_queue_type(self, queue_type: QueueType) -> Self {
        Self { queue_type, ..self }
    }

    pub fn with_max_retries(self, max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    pub fn with_max_parallel(self, max_parallel: usize) -> Self {
        Self {
            max_parallel,
            ..self
        }
    }

    pub fn with_keep_jobs(self, keep_jobs: bool) -> Self {
        Self { keep_jobs, ..self }
    }

    pub fn with_ranking(self, ranking: i32) -> Self {
        Self { ranking, ..self }
    }

    /// The number of jobs this queue runs at once, always one for an ordered queue.
    pub fn parallelism(&self) -> usize {
        match self.queue_type {
            QueueType::Ordered => 1,
            _ => self.max_parallel,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.topics.iter().any(|pattern| topic_matches(pattern, topic))
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(package) = pattern.strip_suffix('*') {
        return topic
            .strip_prefix(package)
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
    }
    if let Some(package) = pattern.strip_suffix('-') {
        return topic
            .strip_prefix(package)
            .is_some_and(|rest| !rest.is_empty());
    }
    pattern == topic
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// How long adding to a full distribution queue waits for space.
    #[serde(with = "duration")]
    pub add_timeout: Duration,
    pub capacity: usize,
    /// The period of the processing task enabled per queue.
    #[serde(with = "duration")]
    pub processing_interval: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            add_timeout: Duration::from_secs(10),
            capacity: 10_000,
            processing_interval: Duration::from_secs(1),
        }
    }
}

impl DistributionConfig {
    pub fn with_add_timeout(self, add_timeout: Duration) -> Self {
        Self {
            add_timeout,
            ..self
        }
    }

    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    pub fn with_processing_interval(self, processing_interval: Duration) -> Self {
        Self {
            processing_interval,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether scheduled jobs fire on this instance.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
