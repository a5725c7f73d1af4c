//! Fetch configuration
//!
//! Everything the fetch engine reads from its environment: which queues to
//! watch and how to order them, whether to poll the schedule set instead,
//! and the timing constants of the fetch cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys;
use crate::queue_set::QueueSet;

/// Blocking pop timeout and outage backoff period
pub const TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration errors
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// No queue names were given
    #[error("at least one queue must be configured")]
    NoQueues,

    /// A queue entry could not be parsed
    #[error("invalid queue entry {entry:?}: {reason}")]
    InvalidQueue { entry: String, reason: String },

    /// An environment variable held an unparseable value
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Fetch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    /// Weighted queue names; duplicates encode relative weight
    pub queues: Vec<String>,

    /// Check queues in configured order instead of weighted-random order
    pub strict: bool,

    /// Poll the schedule set instead of the ready queues
    pub poll_schedule: bool,

    /// Optional key namespace
    pub namespace: Option<String>,

    /// Blocking pop timeout and backoff period
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Number of worker slots, one fetch engine each
    pub concurrency: usize,

    /// How long shutdown waits for in-flight work before requeueing it
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Schedule set name (before namespacing)
    pub schedule_set: String,

    /// Set receiving malformed scheduled entries (before namespacing)
    pub dead_set: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            strict: true,
            poll_schedule: false,
            namespace: None,
            timeout: TIMEOUT,
            concurrency: 10,
            shutdown_timeout: Duration::from_secs(8),
            schedule_set: "schedule".to_string(),
            dead_set: "dead".to_string(),
        }
    }
}

impl FetchConfig {
    /// Create a configuration for the given weighted queue list
    ///
    /// Strict ordering is enabled when no queue is listed more than once.
    pub fn new(queues: Vec<String>) -> Self {
        let strict = !has_duplicates(&queues);
        Self {
            queues,
            strict,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// - `CORRAL_QUEUES`: comma-separated names, `name:weight` repeats a name
    /// - `CORRAL_STRICT`: force strict (`true`) or fair (`false`) ordering
    /// - `CORRAL_POLL_SCHEDULE`: poll the schedule set instead of the queues
    /// - `CORRAL_NAMESPACE`: key namespace
    /// - `CORRAL_CONCURRENCY`: worker slots
    /// - `CORRAL_SHUTDOWN_TIMEOUT_MS`: shutdown grace period
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CORRAL_QUEUES") {
            Ok(raw) => Self::new(parse_queue_list(&raw)?),
            Err(_) => Self::default(),
        };

        if let Ok(raw) = std::env::var("CORRAL_STRICT") {
            config.strict = parse_bool("CORRAL_STRICT", &raw)?;
        }
        if let Ok(raw) = std::env::var("CORRAL_POLL_SCHEDULE") {
            config.poll_schedule = parse_bool("CORRAL_POLL_SCHEDULE", &raw)?;
        }
        if let Ok(ns) = std::env::var("CORRAL_NAMESPACE") {
            config.namespace = Some(ns).filter(|ns| !ns.is_empty());
        }
        if let Ok(raw) = std::env::var("CORRAL_CONCURRENCY") {
            let concurrency = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|c| *c > 0)
                .ok_or(ConfigError::InvalidValue {
                    var: "CORRAL_CONCURRENCY",
                    value: raw.clone(),
                })?;
            config.concurrency = concurrency;
        }
        if let Ok(raw) = std::env::var("CORRAL_SHUTDOWN_TIMEOUT_MS") {
            let millis = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: "CORRAL_SHUTDOWN_TIMEOUT_MS",
                    value: raw.clone(),
                })?;
            config.shutdown_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    /// Force strict or fair ordering
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Select the schedule-polling strategy
    pub fn with_poll_schedule(mut self, poll: bool) -> Self {
        self.poll_schedule = poll;
        self
    }

    /// Set the key namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the number of worker slots
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check invariants that `Default` and the builders cannot enforce
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        if let Some(bad) = self.queues.iter().find(|q| q.trim().is_empty()) {
            return Err(ConfigError::InvalidQueue {
                entry: bad.clone(),
                reason: "empty name".to_string(),
            });
        }
        Ok(())
    }

    /// Queue set with this configuration's ordering policy
    pub fn queue_set(&self) -> QueueSet {
        QueueSet::new(self.queues.clone(), self.strict)
    }

    /// Namespaced schedule set key
    pub fn schedule_key(&self) -> String {
        keys::namespaced(self.namespace.as_deref(), &self.schedule_set)
    }

    /// Namespaced dead set key
    pub fn dead_key(&self) -> String {
        keys::namespaced(self.namespace.as_deref(), &self.dead_set)
    }
}

/// Parse `a,b:3,c` into a weighted list (`b` repeated three times)
pub fn parse_queue_list(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut queues = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = match entry.split_once(':') {
            Some((name, weight)) => {
                let weight = weight
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|w| *w > 0)
                    .ok_or_else(|| ConfigError::InvalidQueue {
                        entry: entry.to_string(),
                        reason: "weight must be a positive integer".to_string(),
                    })?;
                (name.trim(), weight)
            }
            None => (entry, 1),
        };

        if name.is_empty() {
            return Err(ConfigError::InvalidQueue {
                entry: entry.to_string(),
                reason: "empty name".to_string(),
            });
        }

        queues.extend(std::iter::repeat(name.to_string()).take(weight));
    }

    if queues.is_empty() {
        return Err(ConfigError::NoQueues);
    }
    Ok(queues)
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
        }),
    }
}

fn has_duplicates(queues: &[String]) -> bool {
    queues
        .iter()
        .enumerate()
        .any(|(i, q)| queues[..i].contains(q))
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
