use crate::core::errors::{ProcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Stage layout and polling behavior shared by upload and calc jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Stage names of the upload pipeline, in execution order
    #[serde(default = "default_upload_task_names")]
    pub upload_task_names: Vec<String>,
    /// Normalizer stages run on every calc between parsing and archiving
    #[serde(default = "default_normalizers")]
    pub normalizers: Vec<String>,
    /// Final stage of every calc pipeline
    #[serde(default = "default_archiving_task_name")]
    pub archiving_task_name: String,
    /// Sleep between reconciliations while waiting on an upload
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up waiting after this long (None = wait until terminal)
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    /// Reject unrecognised payload fields instead of quarantining them
    #[serde(default)]
    pub strict_merge: bool,
}

fn default_upload_task_names() -> Vec<String> {
    ["uploading", "extracting", "parse_all", "cleanup"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_normalizers() -> Vec<String> {
    vec!["SystemNormalizer".to_string()]
}

fn default_archiving_task_name() -> String {
    "archiving".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            upload_task_names: default_upload_task_names(),
            normalizers: default_normalizers(),
            archiving_task_name: default_archiving_task_name(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: None,
            strict_merge: false,
        }
    }
}

impl TrackerConfig {
    /// Load a configuration from YAML text; missing keys fall back to defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: TrackerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProcError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.upload_task_names.is_empty() {
            return Err(ProcError::configuration_field(
                "upload pipeline needs at least one stage",
                "upload_task_names",
            ));
        }

        let mut seen = HashSet::new();
        for name in &self.upload_task_names {
            if name.is_empty() {
                return Err(ProcError::configuration_field(
                    "stage names must not be empty",
                    "upload_task_names",
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(ProcError::configuration_field(
                    format!("duplicate upload stage '{}'", name),
                    "upload_task_names",
                ));
            }
        }

        if self.normalizers.iter().any(|n| n.is_empty()) {
            return Err(ProcError::configuration_field(
                "normalizer names must not be empty",
                "normalizers",
            ));
        }

        if self.archiving_task_name.is_empty() {
            return Err(ProcError::configuration_field(
                "archiving stage name must not be empty",
                "archiving_task_name",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ProcError::configuration_field(
                "poll_interval_ms must be greater than 0",
                "poll_interval_ms",
            ));
        }

        Ok(())
    }

    /// Merges two configurations, with override_with taking precedence
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let defaults = Self::default();
        let pick = |over: &Vec<String>, base: &Vec<String>, default: &Vec<String>| {
            if over != default {
                over.clone()
            } else {
                base.clone()
            }
        };

        let merged = Self {
            upload_task_names: pick(
                &override_with.upload_task_names,
                &base.upload_task_names,
                &defaults.upload_task_names,
            ),
            normalizers: pick(
                &override_with.normalizers,
                &base.normalizers,
                &defaults.normalizers,
            ),
            archiving_task_name: if override_with.archiving_task_name
                != defaults.archiving_task_name
            {
                override_with.archiving_task_name.clone()
            } else {
                base.archiving_task_name.clone()
            },
            poll_interval_ms: if override_with.poll_interval_ms != defaults.poll_interval_ms {
                override_with.poll_interval_ms
            } else {
                base.poll_interval_ms
            },
            wait_timeout_ms: override_with.wait_timeout_ms.or(base.wait_timeout_ms),
            strict_merge: override_with.strict_merge || base.strict_merge,
        };

        merged.validate()?;
        Ok(merged)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    /// Full stage list of a calc pipeline: parser, normalizers, archiving
    pub fn calc_task_names(&self, parser_name: &str) -> Vec<String> {
        std::iter::once(parser_name.to_string())
            .chain(self.normalizers.iter().cloned())
            .chain(std::iter::once(self.archiving_task_name.clone()))
            .collect()
    }
}
