use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

const BUILTIN_DESIGN: &str = include_str!("../designs/diff_rewards.yaml");

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentDesign {
    pub executable: String,
    #[serde(default)]
    pub fixed_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub axes: Vec<Axis>,
    #[serde(default = "default_config_globs")]
    pub config_globs: Vec<String>,
}

fn default_config_globs() -> Vec<String> {
    vec!["*.cfg".to_string(), "*.json".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Axis {
    Rendered { name: String, values: Vec<String> },
    Verbatim { name: String, values: Vec<String> },
}

impl Axis {
    pub fn name(&self) -> &str {
        match self {
            Axis::Rendered { name, .. } | Axis::Verbatim { name, .. } => name,
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            Axis::Rendered { values, .. } | Axis::Verbatim { values, .. } => values,
        }
    }

    fn setting(&self, value: &str) -> Setting {
        match self {
            Axis::Rendered { name, .. } => Setting::Flag {
                name: name.clone(),
                value: value.to_string(),
            },
            Axis::Verbatim { name, .. } => Setting::Verbatim {
                axis: name.clone(),
                text: value.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    Flag { name: String, value: String },
    Verbatim { axis: String, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub index: usize,
    pub settings: Vec<Setting>,
}

impl Condition {
    /// Simulation command-line parameters for this condition. Fixed and
    /// rendered parameters (plus `extra`, which wins on a name clash) come
    /// first as `-NAME value`, sorted by name; verbatim strings follow in
    /// axis order.
    pub fn command_line(
        &self,
        fixed: &BTreeMap<String, String>,
        extra: &[(&str, &str)],
    ) -> String {
        let mut flags: BTreeMap<&str, &str> = fixed
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for &(k, v) in extra {
            flags.insert(k, v);
        }
        for setting in &self.settings {
            if let Setting::Flag { name, value } = setting {
                flags.insert(name, value);
            }
        }
        let verbatim = self.settings.iter().filter_map(|s| match s {
            Setting::Verbatim { text, .. } => Some(text.clone()),
            Setting::Flag { .. } => None,
        });
        flags
            .iter()
            .map(|(k, v)| format!("-{} {}", k, v))
            .chain(verbatim)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ExperimentDesign {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_DESIGN).context("built-in experiment design")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read design {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid design {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let design: ExperimentDesign = serde_yaml::from_str(raw)?;
        design.validate()?;
        Ok(design)
    }

    fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(anyhow!("design executable is empty"));
        }
        let mut names = BTreeSet::new();
        for axis in &self.axes {
            if !names.insert(axis.name()) {
                return Err(anyhow!("axis declared twice: {}", axis.name()));
            }
            if axis.values().is_empty() {
                return Err(anyhow!("axis {} has no values", axis.name()));
            }
        }
        Ok(())
    }

    /// Cartesian product of all axes. The first axis varies slowest; a design
    /// without axes has exactly one (empty) condition.
    pub fn conditions(&self) -> Vec<Condition> {
        let total: usize = self.axes.iter().map(|a| a.values().len()).product();
        let mut picks = vec![0usize; self.axes.len()];
        let mut out = Vec::with_capacity(total);
        for index in 0..total {
            let settings = self
                .axes
                .iter()
                .zip(&picks)
                .map(|(axis, &p)| axis.setting(&axis.values()[p]))
                .collect();
            out.push(Condition { index, settings });
            for (slot, axis) in picks.iter_mut().zip(&self.axes).rev() {
                *slot += 1;
                if *slot < axis.values().len() {
                    break;
                }
                *slot = 0;
            }
        }
        out
    }
}
