//! Configuration types for fanout-fetch

use crate::error::{Error, Result};
use crate::fanout::GroupRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
///
/// - [`fetch`](FetchConfig) - HTTP client, concurrency cap, URL overrides
/// - [`retry`](RetryPolicy) - default retry policy for every request
/// - [`leaf_retry`](RetryOverrides) - overrides applied to leaf item fetches
/// - [`run`](RunConfig) - manifest locations, outer retry loop, output paths
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// HTTP client settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Default retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Retry overrides for leaf item fetches (default: 11 attempts, 5s timeout)
    #[serde(default = "default_leaf_retry")]
    pub leaf_retry: RetryOverrides,

    /// Orchestrator settings
    #[serde(default)]
    pub run: RunConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            retry: RetryPolicy::default(),
            leaf_retry: default_leaf_retry(),
            run: RunConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config: Config = serde_json::from_slice(&content)?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        self.retry.validate("retry")?;
        self.retry
            .with_overrides(&self.leaf_retry)
            .validate("leaf_retry")?;

        if self.fetch.max_concurrent_requests == 0 {
            return Err(Error::config(
                "fetch.max_concurrent_requests",
                "must be at least 1",
            ));
        }
        if self.run.max_iterations == 0 {
            return Err(Error::config("run.max_iterations", "must be at least 1"));
        }
        if self.run.manifest_url.is_empty() {
            return Err(Error::config("run.manifest_url", "must not be empty"));
        }
        url::Url::parse(&self.run.manifest_url)
            .map_err(|e| Error::config("run.manifest_url", format!("invalid URL: {e}")))?;

        Ok(())
    }
}

/// HTTP client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum requests in flight across the whole process (default: 10)
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Leaf URLs known to be broken upstream, mapped to a working replacement
    #[serde(default)]
    pub url_overrides: HashMap<String, String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            user_agent: default_user_agent(),
            url_overrides: HashMap::new(),
        }
    }
}

impl FetchConfig {
    /// The URL to actually request for `url`, after applying overrides
    pub fn resolve_url<'a>(&'a self, url: &'a str) -> &'a str {
        self.url_overrides.get(url).map_or(url, String::as_str)
    }
}

/// Retry policy for a single logical request
///
/// Attempt indices are 0-based; at most `max_attempts` physical attempts are
/// made per call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Deadline of each attempt (default: 10 seconds)
    #[serde(default = "default_per_attempt_timeout", with = "duration_ms_serde")]
    pub per_attempt_timeout: Duration,

    /// Backoff before the second attempt (default: 250ms)
    #[serde(default = "default_backoff_base", with = "duration_ms_serde")]
    pub backoff_base: Duration,

    /// Multiplier applied per attempt (default: 2.0)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Replace the computed backoff with a uniform draw in `[0, backoff]` (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Methods whose connection-level failures may be retried (default: GET, HEAD, OPTIONS)
    #[serde(default = "default_retryable_methods")]
    pub retryable_methods: BTreeSet<String>,

    /// HTTP statuses that may be retried (default: 408, 429, 500, 502, 503, 504)
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            per_attempt_timeout: default_per_attempt_timeout(),
            backoff_base: default_backoff_base(),
            backoff_factor: default_backoff_factor(),
            jitter: true,
            retryable_methods: default_retryable_methods(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl RetryPolicy {
    /// A new policy with every field set in `overrides` replaced
    #[must_use]
    pub fn with_overrides(&self, overrides: &RetryOverrides) -> Self {
        Self {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            per_attempt_timeout: overrides
                .per_attempt_timeout
                .unwrap_or(self.per_attempt_timeout),
            backoff_base: overrides.backoff_base.unwrap_or(self.backoff_base),
            backoff_factor: overrides.backoff_factor.unwrap_or(self.backoff_factor),
            jitter: overrides.jitter.unwrap_or(self.jitter),
            retryable_methods: overrides
                .retryable_methods
                .clone()
                .unwrap_or_else(|| self.retryable_methods.clone()),
            retryable_status_codes: overrides
                .retryable_status_codes
                .clone()
                .unwrap_or_else(|| self.retryable_status_codes.clone()),
        }
    }

    /// True if connection-level failures of `method` may be retried
    pub fn retries_method(&self, method: &str) -> bool {
        self.retryable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(
                &format!("{prefix}.max_attempts"),
                "must be at least 1",
            ));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(Error::config(
                &format!("{prefix}.backoff_factor"),
                "must be at least 1.0",
            ));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(Error::config(
                &format!("{prefix}.per_attempt_timeout"),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Per-request changes to a [`RetryPolicy`]
///
/// Unset fields keep the base policy's value. Applying overrides never
/// mutates the base policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    /// Total attempts including the first one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Deadline of each attempt
    #[serde(
        default,
        with = "optional_duration_ms_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub per_attempt_timeout: Option<Duration>,

    /// Backoff before the second attempt
    #[serde(
        default,
        with = "optional_duration_ms_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub backoff_base: Option<Duration>,

    /// Multiplier applied per attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,

    /// Full jitter on/off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,

    /// Methods whose connection-level failures may be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_methods: Option<BTreeSet<String>>,

    /// HTTP statuses that may be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_status_codes: Option<BTreeSet<u16>>,
}

/// Fan-out orchestrator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// URL of the batch manifest (JSON array of groups)
    #[serde(default)]
    pub manifest_url: String,

    /// Prefix joined with a group id when the group names no manifest of its own
    #[serde(default)]
    pub group_manifest_base: String,

    /// Maximum outer iterations over the whole batch (default: 5)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Pause between failed iterations (default: 10 seconds)
    #[serde(default = "default_iteration_delay", with = "duration_ms_serde")]
    pub iteration_delay: Duration,

    /// Root directory for fetched payloads (default: "./fetched")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Where the run metrics are written at exit (default: "./metrics.json")
    #[serde(default = "default_metrics_path")]
    pub metrics_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            group_manifest_base: String::new(),
            max_iterations: default_max_iterations(),
            iteration_delay: default_iteration_delay(),
            output_dir: default_output_dir(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl RunConfig {
    /// URL of a group's item manifest
    pub fn group_manifest_url(&self, group: &GroupRef) -> String {
        match &group.manifest {
            Some(url) => url.clone(),
            None => format!("{}{}", self.group_manifest_base, group.id),
        }
    }
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_user_agent() -> String {
    format!("fanout-fetch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> u32 {
    3
}

fn default_per_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(250)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_retryable_methods() -> BTreeSet<String> {
    ["GET", "HEAD", "OPTIONS"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

fn default_leaf_retry() -> RetryOverrides {
    RetryOverrides {
        max_attempts: Some(11),
        per_attempt_timeout: Some(Duration::from_secs(5)),
        ..RetryOverrides::default()
    }
}

fn default_max_iterations() -> u32 {
    5
}

fn default_iteration_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./fetched")
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("./metrics.json")
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// Optional Duration serialization helper (milliseconds)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
