//! backlogd configuration.
//!
//! Loaded from an optional TOML file, then overlaid with environment
//! variables, then validated. Every component receives the section it
//! needs at construction; nothing reads the environment after startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Longest metadata session token the endpoint issues.
const MAX_TOKEN_TTL_SECS: u64 = 21_600;
/// Longest visibility timeout the queue accepts.
const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;
const MAX_SCALING_WINDOW_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Region of the queue and scaling group. Empty means "ask the
    /// metadata endpoint".
    pub region: String,
    /// Override for the cloud service endpoints (local emulators).
    pub endpoint_url: Option<String>,
    pub queue: QueueConfig,
    pub group: GroupConfig,
    pub scaling: ScalingConfig,
    pub metadata: MetadataConfig,
    pub backend: BackendConfig,
    pub worker: LoopConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Long-poll wait per receive.
    pub wait_secs: u64,
    /// Visibility timeout applied to each receive. Unset keeps the
    /// queue's own setting.
    pub visibility_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub name: String,
    /// Termination lifecycle hook to release when draining.
    pub lifecycle_hook_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_members: u32,
    pub max_members: u32,
    pub backlog_per_member_threshold: f64,
    pub cooldown_secs: u64,
    /// How long a requested capacity is trusted before the group is
    /// described again.
    pub member_settle_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub token_ttl_secs: u64,
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `host:port` of the local execution backend.
    pub address: String,
    pub connect_retry_secs: u64,
    /// Deadline for a single job graph. Unset means no deadline.
    pub execution_timeout_secs: Option<u64>,
    /// Directory fetched artifacts are written to.
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Pause after an iteration that hit an error.
    pub error_delay_secs: u64,
    /// Shell command run while draining, before the lifecycle hook is
    /// released (e.g. copy logs to durable storage).
    pub drain_command: Option<String>,
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            wait_secs: 20,
            visibility_timeout_secs: None,
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_members: 0,
            max_members: 10,
            backlog_per_member_threshold: 3.0,
            cooldown_secs: 60,
            member_settle_secs: 30,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://169.254.169.254".to_string(),
            token_ttl_secs: 21_600,
            check_interval_secs: 20,
            timeout_secs: 2,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            connect_retry_secs: 5,
            execution_timeout_secs: None,
            output_dir: None,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            error_delay_secs: 5,
            drain_command: None,
            drain_timeout_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load the file (if any), overlay the process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup.
    ///
    /// Queue and group names fall back to `{PREFIX}-{ENV}-queue` and
    /// `{PREFIX}-{ENV}-asg` when neither the file nor the environment
    /// names them.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k).filter(|v| !v.is_empty()));

        if let Some(v) = first(&["AWS_REGION", "REGION"]) {
            self.region = v;
        }
        if let Some(v) = first(&["AWS_ENDPOINT_URL"]) {
            self.endpoint_url = Some(v);
        }
        if let Some(v) = first(&["QUEUE_NAME", "SQS_NAME"]) {
            self.queue.name = v;
        }
        if let Some(v) = first(&["ASG_NAME"]) {
            self.group.name = v;
        }
        if let Some(v) = first(&["LIFECYCLE_HOOK_NAME"]) {
            self.group.lifecycle_hook_name = Some(v);
        }
        if let Some(v) = first(&["COMFY_ADDR"]) {
            self.backend.address = v;
        }
        if let Some(v) = first(&["NOTIFY_WEBHOOK"]) {
            self.notify.webhook = Some(v);
        }
        if let Some(v) = first(&["DRAIN_COMMAND"]) {
            self.worker.drain_command = Some(v);
        }

        if let Some(v) = first(&["MIN_MEMBERS"]) {
            self.scaling.min_members = parse_env("MIN_MEMBERS", &v)?;
        }
        if let Some(v) = first(&["MAX_MEMBERS"]) {
            self.scaling.max_members = parse_env("MAX_MEMBERS", &v)?;
        }
        if let Some(v) = first(&["BACKLOG_THRESHOLD"]) {
            self.scaling.backlog_per_member_threshold = parse_env("BACKLOG_THRESHOLD", &v)?;
        }
        if let Some(v) = first(&["SCALING_COOLDOWN_SECONDS"]) {
            self.scaling.cooldown_secs = parse_env("SCALING_COOLDOWN_SECONDS", &v)?;
        }
        if let Some(v) = first(&["VISIBILITY_TIMEOUT_SECONDS"]) {
            self.queue.visibility_timeout_secs =
                Some(parse_env("VISIBILITY_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = first(&["EXECUTION_TIMEOUT_SECONDS"]) {
            self.backend.execution_timeout_secs =
                Some(parse_env("EXECUTION_TIMEOUT_SECONDS", &v)?);
        }

        let prefix = first(&["PREFIX"]).unwrap_or_else(|| "simple-comfy".to_string());
        let env = first(&["ENV"]).unwrap_or_else(|| "base".to_string());
        if self.queue.name.is_empty() {
            self.queue.name = format!("{prefix}-{env}-queue");
        }
        if self.group.name.is_empty() {
            self.group.name = format!("{prefix}-{env}-asg");
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scaling;
        if s.min_members > s.max_members {
            return Err(ConfigError::Invalid(format!(
                "min_members ({}) exceeds max_members ({})",
                s.min_members, s.max_members
            )));
        }
        let threshold = s.backlog_per_member_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "backlog_per_member_threshold must be a positive number, got {}",
                s.backlog_per_member_threshold
            )));
        }
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue name is empty".to_string()));
        }
        if self.group.name.trim().is_empty() {
            return Err(ConfigError::Invalid("group name is empty".to_string()));
        }
        if self.queue.wait_secs > 20 {
            return Err(ConfigError::Invalid(format!(
                "queue wait_secs must be at most 20, got {}",
                self.queue.wait_secs
            )));
        }
        if self.backend.address.trim().is_empty() {
            return Err(ConfigError::Invalid("backend address is empty".to_string()));
        }

        let ttl = self.metadata.token_ttl_secs;
        if !(1..=MAX_TOKEN_TTL_SECS).contains(&ttl) {
            return Err(ConfigError::Invalid(format!(
                "metadata token_ttl_secs must be between 1 and {MAX_TOKEN_TTL_SECS}, got {ttl}"
            )));
        }
        if let Some(v) = self.queue.visibility_timeout_secs
            && v > MAX_VISIBILITY_TIMEOUT_SECS
        {
            return Err(ConfigError::Invalid(format!(
                "visibility_timeout_secs must be at most {MAX_VISIBILITY_TIMEOUT_SECS}, got {v}"
            )));
        }
        for (key, value) in [
            ("cooldown_secs", s.cooldown_secs),
            ("member_settle_secs", s.member_settle_secs),
        ] {
            if value > MAX_SCALING_WINDOW_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be at most {MAX_SCALING_WINDOW_SECS}, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue.wait_secs)
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.queue.visibility_timeout_secs.map(Duration::from_secs)
    }

}

impl BackendConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn names_default_from_prefix_and_env() {
        let mut config = WorkerConfig::default();
        config.apply_env(env(&[])).unwrap();
        assert_eq!(config.queue.name, "simple-comfy-base-queue");
        assert_eq!(config.group.name, "simple-comfy-base-asg");

        let mut config = WorkerConfig::default();
        config
            .apply_env(env(&[("PREFIX", "render"), ("ENV", "prod")]))
            .unwrap();
        assert_eq!(config.queue.name, "render-prod-queue");
        assert_eq!(config.group.name, "render-prod-asg");
    }

    #[test]
    fn env_overrides_scaling_and_names() {
        let mut config = WorkerConfig::default();
        config
            .apply_env(env(&[
                ("SQS_NAME", "jobs"),
                ("ASG_NAME", "workers"),
                ("REGION", "eu-west-1"),
                ("MIN_MEMBERS", "1"),
                ("MAX_MEMBERS", "8"),
                ("BACKLOG_THRESHOLD", "2.5"),
                ("SCALING_COOLDOWN_SECONDS", "90"),
                ("VISIBILITY_TIMEOUT_SECONDS", "600"),
            ]))
            .unwrap();

        assert_eq!(config.queue.name, "jobs");
        assert_eq!(config.group.name, "workers");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.scaling.min_members, 1);
        assert_eq!(config.scaling.max_members, 8);
        assert_eq!(config.scaling.backlog_per_member_threshold, 2.5);
        assert_eq!(config.scaling.cooldown_secs, 90);
        assert_eq!(config.visibility_timeout(), Some(Duration::from_secs(600)));
        config.validate().unwrap();
    }

    #[test]
    fn queue_name_takes_precedence_over_alias() {
        let mut config = WorkerConfig::default();
        config
            .apply_env(env(&[("QUEUE_NAME", "primary"), ("SQS_NAME", "alias")]))
            .unwrap();
        assert_eq!(config.queue.name, "primary");
    }

    #[test]
    fn bad_numeric_env_is_rejected() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_env(env(&[("MAX_MEMBERS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "MAX_MEMBERS"));
    }

    #[test]
    fn validate_rejects_inverted_bounds_and_bad_threshold() {
        let mut config = WorkerConfig::default();
        config.apply_env(env(&[])).unwrap();

        config.scaling.min_members = 5;
        config.scaling.max_members = 2;
        assert!(config.validate().is_err());

        config.scaling.min_members = 0;
        config.scaling.backlog_per_member_threshold = 0.0;
        assert!(config.validate().is_err());

        config.scaling.backlog_per_member_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_bounds_durations() {
        let mut config = WorkerConfig::default();
        config.apply_env(env(&[])).unwrap();
        config.validate().unwrap();

        config.metadata.token_ttl_secs = u64::MAX;
        assert!(config.validate().is_err());
        config.metadata.token_ttl_secs = 0;
        assert!(config.validate().is_err());
        config.metadata.token_ttl_secs = 21_600;
        config.validate().unwrap();

        config.scaling.cooldown_secs = u64::MAX;
        assert!(config.validate().is_err());
        config.scaling.cooldown_secs = 60;

        config.scaling.member_settle_secs = 86_401;
        assert!(config.validate().is_err());
        config.scaling.member_settle_secs = 30;

        config.queue.visibility_timeout_secs = Some(43_201);
        assert!(config.validate().is_err());
        config.queue.visibility_timeout_secs = Some(43_200);
        config.validate().unwrap();
    }

    #[test]
    fn endpoint_override_comes_from_env() {
        let mut config = WorkerConfig::default();
        assert_eq!(config.endpoint_url, None);
        config
            .apply_env(env(&[("AWS_ENDPOINT_URL", "http://127.0.0.1:4566")]))
            .unwrap();
        assert_eq!(config.endpoint_url.as_deref(), Some("http://127.0.0.1:4566"));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
region = "us-east-1"

[queue]
name = "render-jobs"
visibility_timeout_secs = 900

[scaling]
max_members = 4
"#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.name, "render-jobs");
        assert_eq!(config.queue.wait_secs, 20);
        assert_eq!(config.scaling.max_members, 4);
        assert_eq!(config.scaling.backlog_per_member_threshold, 3.0);
        assert_eq!(config.metadata.check_interval_secs, 20);
        assert!(config.metadata.enabled);
    }

    #[test]
    fn from_file_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlogd.toml");
        let mut config = WorkerConfig::default();
        config.queue.name = "q".to_string();
        config.group.name = "g".to_string();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
