use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Admission limits for LLM calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    pub ceiling: u32,
    pub window: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ceiling: 30,
            window: Duration::from_millis(60_000),
        }
    }
}

/// Pacing and retry knobs for a single record's generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Pause after every successful call, independent of quota.
    pub call_delay: Duration,
    /// Backoff before retry `i` after a rate-limit rejection.
    pub schedule: Vec<Duration>,
    /// Upper bound on a single call.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            call_delay: Duration::from_millis(1_000),
            schedule: [2_000, 5_000, 10_000, 30_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Run configuration. Every field has a default and may be overridden from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            retry: RetryConfig::default(),
            batch_size: 5,
            batch_delay: Duration::from_millis(2_000),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("DESCRIBER_QUOTA_CEILING") {
            config.quota.ceiling = parse("DESCRIBER_QUOTA_CEILING", &v)?;
        }
        if let Some(v) = get("DESCRIBER_QUOTA_WINDOW_MS") {
            config.quota.window = millis("DESCRIBER_QUOTA_WINDOW_MS", &v)?;
        }
        if let Some(v) = get("DESCRIBER_BATCH_SIZE") {
            config.batch_size = parse("DESCRIBER_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("DESCRIBER_CALL_DELAY_MS") {
            config.retry.call_delay = millis("DESCRIBER_CALL_DELAY_MS", &v)?;
        }
        if let Some(v) = get("DESCRIBER_BATCH_DELAY_MS") {
            config.batch_delay = millis("DESCRIBER_BATCH_DELAY_MS", &v)?;
        }
        if let Some(v) = get("DESCRIBER_RETRY_DELAYS_MS") {
            config.retry.schedule = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| millis("DESCRIBER_RETRY_DELAYS_MS", s))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = get("DESCRIBER_CALL_TIMEOUT_SECS") {
            config.retry.call_timeout =
                Duration::from_secs(parse("DESCRIBER_CALL_TIMEOUT_SECS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quota.ceiling == 0 {
            bail!("quota ceiling must be at least 1");
        }
        if self.quota.window.is_zero() {
            bail!("quota window must be longer than 0ms");
        }
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.retry.call_timeout.is_zero() {
            bail!("call timeout must be longer than 0s");
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {}: {:?}", key, value))
}

fn millis(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
