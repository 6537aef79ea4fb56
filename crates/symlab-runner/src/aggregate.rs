use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::ensure_dir;
use crate::error::SymlabError;
use crate::extract::{add_time_series_fields, extract_summary_row, FieldSelection};
use crate::profile::AggregateProfile;
use crate::run_config::RunConfig;
use crate::sampling::{reached_target, resolve_target, SamplePolicy, SampleUnit};
use crate::table::{write_records, AppendTable, Record, Table};

pub const SUMMARY_FILE: &str = "summary.csv";
pub const INTERACTION_VALUES_FILE: &str = "symbiont_interaction_values.csv";
pub const TIME_SERIES_FILE: &str = "time_series.csv";
pub const DEFAULT_RUN_IDENTIFIER: &str = "RUN_";
const REACHED_TARGET_FIELD: &str = "reached_target_update";
const MAX_POP_SIZE_FIELD: &str = "max_pop_size";

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub data_dir: PathBuf,
    pub dump_dir: PathBuf,
    /// Update the summary is taken at; `None` means each run's last row.
    pub target_update: Option<i64>,
    pub time_series_unit: SampleUnit,
    pub time_series_resolution: i64,
    pub run_identifier: String,
}

impl AggregateOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            dump_dir: PathBuf::from("."),
            target_update: None,
            time_series_unit: SampleUnit::Interval,
            time_series_resolution: 1,
            run_identifier: DEFAULT_RUN_IDENTIFIER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    SkippedIncomplete,
    SkippedEmpty,
    SummarizedOnly,
    SummarizedAndTimeSeries,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::SkippedIncomplete => "skipped_incomplete",
            RunOutcome::SkippedEmpty => "skipped_empty",
            RunOutcome::SummarizedOnly => "summarized_only",
            RunOutcome::SummarizedAndTimeSeries => "summarized_and_time_series",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub run_dirs_found: usize,
    pub outcomes: Vec<(String, RunOutcome)>,
    pub incomplete_runs: Vec<String>,
    pub summary_rows: usize,
    pub time_series_rows: usize,
    pub summary_path: PathBuf,
    pub interaction_values_path: PathBuf,
    pub time_series_path: PathBuf,
}

struct RunRecords {
    summary: Record,
    interaction_values: Record,
    time_series: Vec<Record>,
}

enum RunAggregate {
    Incomplete,
    Empty,
    Aggregated { reached: bool, records: RunRecords },
}

pub fn locate_run_dirs(data_dir: &Path, identifier: &str) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(data_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.file_type().is_dir() && entry.file_name().to_string_lossy().contains(identifier) {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

pub fn aggregate(options: &AggregateOptions, profile: &AggregateProfile) -> Result<AggregateReport> {
    if !options.data_dir.exists() {
        return Err(SymlabError::MissingDataDir(options.data_dir.clone()).into());
    }
    let policy = SamplePolicy::new(options.time_series_unit, options.time_series_resolution)?;
    ensure_dir(&options.dump_dir)?;

    let run_dirs = locate_run_dirs(&options.data_dir, &options.run_identifier)?;
    info!(count = run_dirs.len(), data_dir = %options.data_dir.display(), "found run directories");

    let mut time_series = AppendTable::create(&options.dump_dir.join(TIME_SERIES_FILE))?;
    let mut summary_rows = Vec::new();
    let mut interaction_rows = Vec::new();
    let mut incomplete_runs = Vec::new();
    let mut outcomes = Vec::new();

    for (i, run_dir) in run_dirs.iter().enumerate() {
        let run = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("...({}/{}) aggregating from {}", i + 1, run_dirs.len(), run);

        let outcome = match aggregate_run(run_dir, &run, options.target_update, &policy, profile)
            .with_context(|| format!("failed to aggregate {}", run))?
        {
            RunAggregate::Incomplete => {
                warn!(run = %run, "run did not finish, skipping");
                incomplete_runs.push(run.clone());
                RunOutcome::SkippedIncomplete
            }
            RunAggregate::Empty => {
                debug!(run = %run, "primary metric file is empty, skipping");
                RunOutcome::SkippedEmpty
            }
            RunAggregate::Aggregated { reached, records } => {
                summary_rows.push(records.summary);
                interaction_rows.push(records.interaction_values);
                if reached {
                    time_series.append(&run, &records.time_series)?;
                    RunOutcome::SummarizedAndTimeSeries
                } else {
                    RunOutcome::SummarizedOnly
                }
            }
        };
        outcomes.push((run, outcome));
    }

    let summary_path = options.dump_dir.join(SUMMARY_FILE);
    write_records(&summary_path, &summary_rows)?;
    let interaction_values_path = options.dump_dir.join(INTERACTION_VALUES_FILE);
    write_records(&interaction_values_path, &interaction_rows)?;
    info!(
        summary_rows = summary_rows.len(),
        time_series_rows = time_series.rows_written(),
        incomplete = incomplete_runs.len(),
        "aggregation finished"
    );

    Ok(AggregateReport {
        run_dirs_found: run_dirs.len(),
        outcomes,
        incomplete_runs,
        summary_rows: summary_rows.len(),
        time_series_rows: time_series.rows_written(),
        summary_path,
        interaction_values_path,
        time_series_path: time_series.path().to_path_buf(),
    })
}

fn aggregate_run(
    run_dir: &Path,
    run: &str,
    target: Option<i64>,
    policy: &SamplePolicy,
    profile: &AggregateProfile,
) -> Result<RunAggregate> {
    let output_dir = run_dir.join(&profile.output_subdir);
    let config_path = output_dir.join(&profile.config_file);
    if !config_path.is_file() {
        return Ok(RunAggregate::Incomplete);
    }
    let config = RunConfig::load(run, &config_path)?;

    let mut summary = Record::new();
    for (param, value) in config.iter() {
        if profile.summary_params.contains(param) {
            summary.insert(param.to_string(), value.to_string());
        }
    }
    summary.insert(
        MAX_POP_SIZE_FIELD.to_string(),
        config.max_pop_size()?.to_string(),
    );

    let time_column = profile.time_column.as_str();
    let primary = Table::read(&output_dir.join(&profile.primary().file))?;
    let updates = primary.time_indices(time_column)?;
    let Some(summary_update) = resolve_target(target, &updates) else {
        return Ok(RunAggregate::Empty);
    };
    let reached = reached_target(target, &updates);

    let mut series: BTreeMap<i64, Record> = BTreeMap::new();
    if reached {
        for update in policy.sample(&updates) {
            let mut record = Record::new();
            for param in &profile.time_series_params {
                record.insert(param.clone(), config.require(param)?.to_string());
            }
            record.insert(time_column.to_string(), update.to_string());
            series.insert(update, record);
        }
        debug!(run, sampled = series.len(), "sampled time series updates");
    }

    summary.insert(time_column.to_string(), summary_update.to_string());
    summary.insert(
        REACHED_TARGET_FIELD.to_string(),
        if reached { "True" } else { "False" }.to_string(),
    );
    let mut interaction_values = summary.clone();

    for (i, metric) in profile.metric_files.iter().enumerate() {
        let loaded;
        let table = if i == 0 {
            &primary
        } else {
            loaded = Table::read(&output_dir.join(&metric.file))?;
            &loaded
        };
        debug!(run, file = %metric.file, rows = table.rows.len(), "extracting");

        summary.extend(extract_summary_row(
            table,
            &metric.file,
            time_column,
            Some(summary_update),
            &metric.summary_selection(),
            Some(&metric.prefix),
        )?);
        if reached {
            add_time_series_fields(
                table,
                time_column,
                &mut series,
                &metric.time_series_selection(),
                Some(&metric.prefix),
            )?;
        }
        if metric.interaction_values {
            interaction_values.extend(extract_summary_row(
                table,
                &metric.file,
                time_column,
                Some(summary_update),
                &FieldSelection::All,
                None,
            )?);
        }
    }

    Ok(RunAggregate::Aggregated {
        reached,
        records: RunRecords {
            summary,
            interaction_values,
            time_series: series.into_values().collect(),
        },
    })
}
