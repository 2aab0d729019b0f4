use crate::models::Stage;
use crate::safety::ContentRules;
use serde::Deserialize;
use std::{env, path::PathBuf, time::Duration};
use thiserror::Error;

/// Hard ceiling for any retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid pipeline config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("env {key}={value:?} is not valid")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Run against in-memory collaborators instead of remote services.
    pub demo: bool,
    pub ops_port: u16,
    pub workers: WorkerSettings,
    pub queue: QueueSettings,
    pub recovery: RecoverySettings,
    pub stages: StagePolicies,
    pub content: ContentRules,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            demo: false,
            ops_port: 8000,
            workers: WorkerSettings::default(),
            queue: QueueSettings::default(),
            recovery: RecoverySettings::default(),
            stages: StagePolicies::default(),
            content: ContentRules::default(),
        }
    }
}

impl PipelineSettings {
    /// Loads `PIPELINE_CONFIG` (YAML) if set, applies env overrides and validates.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut settings = match env::var("PIPELINE_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let raw = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path, source })?;
                serde_yaml::from_str(&raw)?
            }
            Err(_) => Self::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(count) = parse_env::<usize>("WORKER_COUNT")? {
            self.workers.count = count;
        }
        if let Some(port) = parse_env::<u16>("OPS_PORT")? {
            self.ops_port = port;
        }
        if let Some(demo) = parse_env_bool("PIPELINE_DEMO")? {
            self.demo = demo;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            self.queue.redis_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("workers.count must be at least 1".into()));
        }
        for stage in Stage::RUNNABLE {
            let policy = self.stages.for_stage(stage);
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.max_attempts must be at least 1"
                )));
            }
            if policy.base_delay_ms > policy.max_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.base_delay_ms exceeds max_delay_ms"
                )));
            }
            if policy.max_delay() > MAX_RETRY_DELAY {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.max_delay_ms exceeds one hour"
                )));
            }
            if policy.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.timeout_ms must be positive"
                )));
            }
            if !self.demo && policy.endpoint.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.endpoint is required outside demo mode"
                )));
            }
        }
        let floor = self.stages.longest_timeout() + self.recovery.processing_overhead();
        if self.recovery.liveness_timeout() <= floor {
            return Err(ConfigError::Invalid(format!(
                "recovery.liveness_timeout_secs must exceed the longest stage timeout plus overhead ({}s)",
                floor.as_secs()
            )));
        }
        if self.recovery.interval_secs == 0 {
            return Err(ConfigError::Invalid("recovery.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub count: usize,
    pub receive_wait_ms: u64,
    /// Pause after a store or transport failure before the worker polls again.
    pub transport_backoff_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 4,
            receive_wait_ms: 5_000,
            transport_backoff_ms: 1_000,
        }
    }
}

impl WorkerSettings {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn transport_backoff(&self) -> Duration {
        Duration::from_millis(self.transport_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub redis_url: Option<String>,
    pub namespace: String,
    pub visibility_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "relist:jobs".into(),
            visibility_timeout_ms: 120_000,
            poll_interval_ms: 250,
        }
    }
}

impl QueueSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoverySettings {
    pub interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub processing_overhead_secs: u64,
    pub retention_hours: u64,
    pub paused_recheck_secs: u64,
    pub batch_limit: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            liveness_timeout_secs: 300,
            processing_overhead_secs: 60,
            retention_hours: 24 * 7,
            paused_recheck_secs: 900,
            batch_limit: 500,
        }
    }
}

impl RecoverySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn processing_overhead(&self) -> Duration {
        Duration::from_secs(self.processing_overhead_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn paused_recheck(&self) -> Duration {
        Duration::from_secs(self.paused_recheck_secs)
    }
}

/// Retry and timeout policy for one stage.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
    /// Remote endpoint for the stage call. Unused in demo mode.
    pub endpoint: Option<String>,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: MAX_RETRY_DELAY.as_millis() as u64,
            timeout_ms: 30_000,
            endpoint: None,
        }
    }
}

impl StagePolicy {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagePolicies {
    pub scrape: StagePolicy,
    pub enrich: StagePolicy,
    pub validate: StagePolicy,
    pub price: StagePolicy,
    pub publish: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            scrape: StagePolicy::default(),
            enrich: StagePolicy::default(),
            validate: StagePolicy::default(),
            price: StagePolicy::default(),
            publish: StagePolicy {
                base_delay_ms: 5_000,
                ..StagePolicy::default()
            },
        }
    }
}

impl StagePolicies {
    /// `Done` has no work of its own; it reports the publish policy.
    pub fn for_stage(&self, stage: Stage) -> &StagePolicy {
        match stage {
            Stage::Scrape => &self.scrape,
            Stage::Enrich => &self.enrich,
            Stage::Validate => &self.validate,
            Stage::Price => &self.price,
            Stage::Publish | Stage::Done => &self.publish,
        }
    }

    pub fn longest_timeout(&self) -> Duration {
        Stage::RUNNABLE
            .iter()
            .map(|stage| self.for_stage(*stage).timeout())
            .max()
            .unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}

fn parse_env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv { key, value }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_defaults_validate() {
        let settings = PipelineSettings::from_yaml_str("demo: true\n").expect("defaults");
        assert_eq!(settings.workers.count, 4);
        assert_eq!(settings.stages.publish.base_delay_ms, 5_000);
        assert_eq!(settings.stages.enrich.max_attempts, 3);
        assert!(settings.recovery.liveness_timeout() > settings.stages.longest_timeout());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PipelineSettings::from_yaml_str("demo: true\nstages:\n  enrich:\n    max_atempts: 5\n")
            .expect_err("typo must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn endpoints_required_outside_demo() {
        let err = PipelineSettings::from_yaml_str("demo: false\n").expect_err("no endpoints");
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn liveness_must_exceed_stage_timeout() {
        let raw = "demo: true\nrecovery:\n  liveness_timeout_secs: 60\nstages:\n  publish:\n    timeout_ms: 45000\n";
        let err = PipelineSettings::from_yaml_str(raw).expect_err("liveness too short");
        assert!(err.to_string().contains("liveness_timeout_secs"));
    }

    #[test]
    fn inverted_delays_are_rejected() {
        let raw = "demo: true\nstages:\n  price:\n    base_delay_ms: 10000\n    max_delay_ms: 1000\n";
        assert!(PipelineSettings::from_yaml_str(raw).is_err());
    }
}
