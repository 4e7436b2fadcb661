//! Harness configuration
//!
//! Resolved in layers: built-in defaults, an optional YAML file, then
//! `KFTO_*` environment variables. CLI flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::poller::PollSettings;

const CONFIG_DIR_NAME: &str = "kfto-e2e";
const CONFIG_FILE_NAME: &str = "config.yaml";

/// Deadline tier a stage waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutTier {
    Short,
    Medium,
    Long,
    Double,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(with = "duration_str")]
    #[schemars(with = "String")]
    pub short: Duration,
    #[serde(with = "duration_str")]
    #[schemars(with = "String")]
    pub medium: Duration,
    #[serde(with = "duration_str")]
    #[schemars(with = "String")]
    pub long: Duration,
    #[serde(with = "duration_str")]
    #[schemars(with = "String")]
    pub double: Duration,
    /// Time between two polls of a stage
    #[serde(with = "duration_str")]
    #[schemars(with = "String")]
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(60),
            medium: Duration::from_secs(2 * 60),
            long: Duration::from_secs(5 * 60),
            double: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    pub fn deadline(&self, tier: TimeoutTier) -> Duration {
        match tier {
            TimeoutTier::Short => self.short,
            TimeoutTier::Medium => self.medium,
            TimeoutTier::Long => self.long,
            TimeoutTier::Double => self.double,
        }
    }

    /// Poll settings for a tier, using the configured interval
    pub fn poll(&self, tier: TimeoutTier) -> Result<PollSettings> {
        PollSettings::new(self.poll_interval, self.deadline(tier))
    }

    fn validate(&self) -> Result<()> {
        for (name, tier) in [
            ("short", TimeoutTier::Short),
            ("medium", TimeoutTier::Medium),
            ("long", TimeoutTier::Long),
            ("double", TimeoutTier::Double),
        ] {
            if self.poll_interval >= self.deadline(tier) {
                return Err(Error::config(format!(
                    "poll interval {} must be shorter than the {} timeout {}",
                    format_duration(self.poll_interval),
                    name,
                    format_duration(self.deadline(tier))
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct Images {
    pub training_cuda: String,
    pub training_rocm: String,
    pub notebook: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            training_cuda: "quay.io/modh/training:py311-cuda121-torch241".to_string(),
            training_rocm: "quay.io/modh/training:py311-rocm61-torch241".to_string(),
            notebook: "quay.io/modh/odh-generic-data-science-notebook:v2-2024a".to_string(),
        }
    }
}

/// Non-admin user the HPO notebook runs as
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct NotebookUser {
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsSettings {
    /// Query GPU utilisation during NVIDIA training runs
    pub enabled: bool,
    /// Utilisation percentage at least one GPU of every pod must exceed
    pub utilization_threshold: f64,
    #[serde(with = "duration_str")]
    #[schemars(with = "String")]
    pub deadline: Duration,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            utilization_threshold: 20.0,
            deadline: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct TeardownSettings {
    /// Wait for the scenario namespace to disappear before reporting
    pub await_namespace_deletion: bool,
}

impl Default for TeardownSettings {
    fn default() -> Self {
        Self {
            await_namespace_deletion: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct HarnessConfig {
    pub timeouts: Timeouts,
    pub images: Images,
    pub notebook_user: NotebookUser,
    /// Prefix of generated scenario namespaces
    pub namespace_prefix: String,
    pub metrics: MetricsSettings,
    pub teardown: TeardownSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            images: Images::default(),
            notebook_user: NotebookUser::default(),
            namespace_prefix: "test-ns".to_string(),
            metrics: MetricsSettings::default(),
            teardown: TeardownSettings::default(),
        }
    }
}

impl HarnessConfig {
    /// Defaults, then the YAML file (explicit or the user config dir), then env
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))
    }

    /// Overlay `KFTO_*` variables read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let durations: [(&str, &mut Duration); 5] = [
            ("KFTO_TEST_TIMEOUT_SHORT", &mut self.timeouts.short),
            ("KFTO_TEST_TIMEOUT_MEDIUM", &mut self.timeouts.medium),
            ("KFTO_TEST_TIMEOUT_LONG", &mut self.timeouts.long),
            ("KFTO_TEST_TIMEOUT_DOUBLE", &mut self.timeouts.double),
            ("KFTO_POLL_INTERVAL", &mut self.timeouts.poll_interval),
        ];
        for (key, slot) in durations {
            if let Some(raw) = lookup(key) {
                *slot = parse_duration(&raw)
                    .map_err(|e| Error::config(format!("{}: {}", key, e)))?;
                debug!(key, value = %raw, "duration overridden from environment");
            }
        }

        let strings: [(&str, &mut String); 4] = [
            ("KFTO_TRAINING_CUDA_IMAGE", &mut self.images.training_cuda),
            ("KFTO_TRAINING_ROCM_IMAGE", &mut self.images.training_rocm),
            ("KFTO_NOTEBOOK_IMAGE", &mut self.images.notebook),
            ("KFTO_NAMESPACE_PREFIX", &mut self.namespace_prefix),
        ];
        for (key, slot) in strings {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                debug!(key, "setting overridden from environment");
                *slot = value;
            }
        }

        if let Some(name) = lookup("KFTO_NOTEBOOK_USER_NAME") {
            self.notebook_user.name = Some(name);
        }
        if let Some(token) = lookup("KFTO_NOTEBOOK_USER_TOKEN") {
            self.notebook_user.token = Some(token);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;
        if self.namespace_prefix.is_empty() {
            return Err(Error::config("namespace prefix must not be empty"));
        }
        if self.metrics.utilization_threshold < 0.0 {
            return Err(Error::config("utilization threshold must not be negative"));
        }
        Ok(())
    }

    /// JSON schema of the configuration file
    pub fn schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(HarnessConfig)).unwrap_or_default()
    }
}

/// `<config dir>/kfto-e2e/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Parse `90s`, `5m`, `1h`, `250ms` or bare seconds
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::config(format!("invalid duration '{}'", raw)))?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => {
            return Err(Error::config(format!(
                "unknown duration unit '{}' in '{}'",
                other, raw
            )));
        }
    };
    Ok(duration)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
