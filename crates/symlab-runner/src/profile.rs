use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::extract::FieldSelection;

const BUILTIN_PROFILE: &str = include_str!("../profiles/health_flat_rewards.yaml");

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateProfile {
    #[serde(default = "default_output_subdir")]
    pub output_subdir: String,
    #[serde(default = "default_config_file")]
    pub config_file: String,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default)]
    pub summary_params: BTreeSet<String>,
    #[serde(default)]
    pub time_series_params: BTreeSet<String>,
    pub metric_files: Vec<MetricFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricFile {
    pub file: String,
    pub prefix: String,
    #[serde(default)]
    pub summary_fields: Option<BTreeSet<String>>,
    #[serde(default)]
    pub time_series_fields: BTreeSet<String>,
    #[serde(default)]
    pub interaction_values: bool,
}

fn default_output_subdir() -> String {
    "output".to_string()
}

fn default_config_file() -> String {
    "run_config.csv".to_string()
}

fn default_time_column() -> String {
    "update".to_string()
}

impl MetricFile {
    pub fn summary_selection(&self) -> FieldSelection {
        match &self.summary_fields {
            Some(fields) => FieldSelection::Only(fields.clone()),
            None => FieldSelection::All,
        }
    }

    pub fn time_series_selection(&self) -> FieldSelection {
        FieldSelection::Only(self.time_series_fields.clone())
    }
}

impl AggregateProfile {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_PROFILE).context("built-in aggregate profile")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid profile {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let profile: AggregateProfile = serde_yaml::from_str(raw)?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.metric_files.is_empty() {
            return Err(anyhow!("profile lists no metric_files"));
        }
        let interaction = self
            .metric_files
            .iter()
            .filter(|m| m.interaction_values)
            .count();
        if interaction > 1 {
            return Err(anyhow!(
                "at most one metric file may set interaction_values (found {})",
                interaction
            ));
        }
        let mut seen = BTreeSet::new();
        for m in &self.metric_files {
            if !seen.insert(m.file.as_str()) {
                return Err(anyhow!("metric file listed twice: {}", m.file));
            }
        }
        Ok(())
    }

    pub fn primary(&self) -> &MetricFile {
        &self.metric_files[0]
    }
}
