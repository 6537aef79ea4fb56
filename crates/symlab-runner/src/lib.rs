pub mod aggregate;
pub mod design;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod profile;
pub mod run_config;
pub mod sampling;
pub mod table;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub use aggregate::{aggregate, locate_run_dirs, AggregateOptions, AggregateReport, RunOutcome};
pub use design::{Axis, Condition, ExperimentDesign, Setting};
pub use error::SymlabError;
pub use extract::FieldSelection;
pub use jobs::{generate_jobs, JobOptions, JobReport, BUILTIN_TEMPLATE};
pub use profile::{AggregateProfile, MetricFile};
pub use sampling::{nearest_index, resolve_target, SamplePolicy, SampleUnit};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
pub(crate) fn test_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "symlab_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    ensure_dir(&dir).expect("temp dir");
    dir
}
