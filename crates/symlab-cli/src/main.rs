use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use symlab_runner::jobs::{
    load_template, DEFAULT_MEM_REQUEST, DEFAULT_REPLICATES, DEFAULT_SEED_OFFSET,
    DEFAULT_TIME_REQUEST,
};
use symlab_runner::{AggregateProfile, ExperimentDesign, SymlabError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "symlab", version = "0.3.0", about = "Symbulation experiment tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum UnitsArg {
    #[value(name = "interval")]
    Interval,
    #[value(name = "total")]
    Total,
}

impl From<UnitsArg> for symlab_runner::SampleUnit {
    fn from(value: UnitsArg) -> Self {
        match value {
            UnitsArg::Interval => symlab_runner::SampleUnit::Interval,
            UnitsArg::Total => symlab_runner::SampleUnit::Total,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate replicate run directories into summary and time-series CSVs.
    Aggregate {
        #[arg(long = "data_dir", alias = "data-dir")]
        data_dir: PathBuf,
        #[arg(long = "dump_dir", alias = "dump-dir", default_value = ".")]
        dump_dir: PathBuf,
        #[arg(long = "summary_update", alias = "summary-update")]
        summary_update: Option<i64>,
        #[arg(
            long = "time_series_units",
            alias = "time-series-units",
            value_enum,
            default_value = "interval"
        )]
        time_series_units: UnitsArg,
        #[arg(
            long = "time_series_resolution",
            alias = "time-series-resolution",
            default_value_t = 1,
            allow_negative_numbers = true
        )]
        time_series_resolution: i64,
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long = "run_identifier", alias = "run-identifier", default_value = "RUN_")]
        run_identifier: String,
        #[arg(long)]
        json: bool,
    },
    /// Generate one SLURM submission script per experiment condition.
    GenJobs {
        #[arg(long = "data_dir", alias = "data-dir")]
        data_dir: PathBuf,
        #[arg(long = "config_dir", alias = "config-dir")]
        config_dir: String,
        #[arg(long, default_value_t = DEFAULT_REPLICATES)]
        replicates: u64,
        /// Defaults to `<data_dir>/jobs`.
        #[arg(long = "job_dir", alias = "job-dir")]
        job_dir: Option<PathBuf>,
        #[arg(long = "seed_offset", alias = "seed-offset", default_value_t = DEFAULT_SEED_OFFSET)]
        seed_offset: u64,
        #[arg(long = "hpc_account", alias = "hpc-account")]
        hpc_account: Option<String>,
        #[arg(long = "time_request", alias = "time-request", default_value = DEFAULT_TIME_REQUEST)]
        time_request: String,
        #[arg(long, default_value = DEFAULT_MEM_REQUEST)]
        mem: String,
        /// Replicates per job-set subdirectory; -1 disables subdirectories.
        #[arg(
            long = "runs_per_subdir",
            alias = "runs-per-subdir",
            default_value_t = -1,
            allow_negative_numbers = true
        )]
        runs_per_subdir: i64,
        #[arg(long = "repo_dir", alias = "repo-dir")]
        repo_dir: String,
        #[arg(long = "hpc_env_file", alias = "hpc-env-file")]
        hpc_env_file: Option<String>,
        #[arg(long)]
        design: Option<PathBuf>,
        #[arg(long)]
        template: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let Some(failure) = report_failure(&err, json_mode) else {
                return Err(err);
            };
            println!("{}", failure.output);
            std::process::exit(failure.exit_code);
        }
    }
}

#[derive(Debug)]
struct Failure {
    exit_code: i32,
    output: String,
}

// `None` lets the error propagate out of `main`.
fn report_failure(err: &anyhow::Error, json_mode: bool) -> Option<Failure> {
    let diagnostic = err
        .downcast_ref::<SymlabError>()
        .filter(|e| e.exits_with_diagnostic());
    match (diagnostic, json_mode) {
        (Some(diag), false) => Some(Failure {
            exit_code: -1,
            output: diag.to_string(),
        }),
        (Some(diag), true) => Some(Failure {
            exit_code: -1,
            output: json_line(&json_error("aggregate_failed", diag.to_string())),
        }),
        (None, true) => Some(Failure {
            exit_code: 1,
            output: json_line(&json_error("command_failed", format!("{:#}", err))),
        }),
        (None, false) => None,
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Aggregate {
            data_dir,
            dump_dir,
            summary_update,
            time_series_units,
            time_series_resolution,
            profile,
            run_identifier,
            json,
        } => {
            let profile = match profile {
                Some(path) => {
                    debug!(path = %path.display(), "loading aggregate profile");
                    AggregateProfile::load(&path)?
                }
                None => AggregateProfile::builtin()?,
            };
            let options = symlab_runner::AggregateOptions {
                data_dir,
                dump_dir,
                target_update: summary_update,
                time_series_unit: time_series_units.into(),
                time_series_resolution,
                run_identifier,
            };
            let report = symlab_runner::aggregate(&options, &profile)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "report": aggregate_report_to_json(&report),
                })));
            }
            println!("Found {} run directories.", report.run_dirs_found);
            println!("summary: {}", report.summary_path.display());
            println!(
                "interaction_values: {}",
                report.interaction_values_path.display()
            );
            println!("time_series: {}", report.time_series_path.display());
            println!("Incomplete runs:");
            println!("{}", report.incomplete_runs.join("\n"));
        }
        Commands::GenJobs {
            data_dir,
            config_dir,
            replicates,
            job_dir,
            seed_offset,
            hpc_account,
            time_request,
            mem,
            runs_per_subdir,
            repo_dir,
            hpc_env_file,
            design,
            template,
            json,
        } => {
            let design = match design {
                Some(path) => {
                    debug!(path = %path.display(), "loading experiment design");
                    ExperimentDesign::load(&path)?
                }
                None => ExperimentDesign::builtin()?,
            };
            let template = load_template(template.as_deref())?;
            let mut options = symlab_runner::JobOptions::new(&data_dir, &config_dir, &repo_dir);
            if let Some(dir) = job_dir {
                options.job_dir = dir;
            }
            options.replicates = replicates;
            options.seed_offset = seed_offset;
            options.hpc_account = hpc_account;
            options.time_request = time_request;
            options.mem_request = mem;
            options.runs_per_subdir = (runs_per_subdir != -1).then_some(runs_per_subdir);
            options.hpc_env_file = hpc_env_file;

            if !json {
                let conditions = design.conditions();
                for c in &conditions {
                    println!("{:?}", c.settings);
                }
                println!(
                    "Generating {} jobs across {} slurm files!",
                    options.replicates * conditions.len() as u64,
                    conditions.len()
                );
                print_job_options(&options);
            }
            let report = symlab_runner::generate_jobs(&design, &template, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "gen-jobs",
                    "report": job_report_to_json(&report),
                })));
            }
            println!("manifest: {}", report.manifest_path.display());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    println!("{}", json_line(value));
}

fn json_line(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| {
        "{\"ok\":false,\"error\":{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}".to_string()
    })
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Aggregate { json, .. } | Commands::GenJobs { json, .. } => *json,
    }
}

fn aggregate_report_to_json(report: &symlab_runner::AggregateReport) -> Value {
    json!({
        "run_dirs_found": report.run_dirs_found,
        "summary_rows": report.summary_rows,
        "time_series_rows": report.time_series_rows,
        "incomplete_runs": report.incomplete_runs,
        "summary": report.summary_path.display().to_string(),
        "interaction_values": report.interaction_values_path.display().to_string(),
        "time_series": report.time_series_path.display().to_string(),
        "runs": report
            .outcomes
            .iter()
            .map(|(run, outcome)| json!({ "run": run, "outcome": outcome.as_str() }))
            .collect::<Vec<_>>(),
    })
}

fn job_report_to_json(report: &symlab_runner::JobReport) -> Value {
    json!({
        "total_runs": report.total_runs,
        "manifest": report.manifest_path.display().to_string(),
        "jobs": report
            .jobs
            .iter()
            .map(|j| json!({
                "condition": j.condition,
                "job_name": j.job_name,
                "path": j.path.display().to_string(),
                "seed_offset": j.seed_offset,
            }))
            .collect::<Vec<_>>(),
    })
}

fn print_job_options(options: &symlab_runner::JobOptions) {
    println!(" - Data directory: {}", options.data_dir.display());
    println!(" - Config directory: {}", options.config_dir);
    println!(" - Repository directory: {}", options.repo_dir);
    println!(" - Job directory: {}", options.job_dir.display());
    println!(" - Replicates: {}", options.replicates);
    println!(
        " - Account: {}",
        options.hpc_account.as_deref().unwrap_or("none")
    );
    println!(" - Time Request: {}", options.time_request);
    println!(" - Memory: {}", options.mem_request);
    println!(" - Seed offset: {}", options.seed_offset);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_defaults_match_documented_surface() {
        let cli = Cli::try_parse_from(["symlab", "aggregate", "--data_dir", "/data"]).unwrap();
        match cli.command {
            Commands::Aggregate {
                dump_dir,
                summary_update,
                time_series_units,
                time_series_resolution,
                run_identifier,
                ..
            } => {
                assert_eq!(dump_dir, PathBuf::from("."));
                assert_eq!(summary_update, None);
                assert!(matches!(time_series_units, UnitsArg::Interval));
                assert_eq!(time_series_resolution, 1);
                assert_eq!(run_identifier, "RUN_");
            }
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn aggregate_accepts_non_positive_resolution_for_later_validation() {
        let cli = Cli::try_parse_from([
            "symlab",
            "aggregate",
            "--data-dir",
            "/data",
            "--time_series_units",
            "total",
            "--time_series_resolution",
            "-2",
        ])
        .unwrap();
        match cli.command {
            Commands::Aggregate {
                time_series_units,
                time_series_resolution,
                ..
            } => {
                assert!(matches!(time_series_units, UnitsArg::Total));
                assert_eq!(time_series_resolution, -2);
            }
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn aggregate_requires_data_dir() {
        assert!(Cli::try_parse_from(["symlab", "aggregate"]).is_err());
    }

    fn temp_dir(label: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("symlab_cli_{}_{}", label, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn run_args(args: &[&str]) -> anyhow::Error {
        let cli = Cli::try_parse_from(args.iter().copied()).unwrap();
        run_command(cli.command).expect_err("command should fail")
    }

    #[test]
    fn missing_data_dir_exits_minus_one_with_diagnostic() {
        let err = run_args(&["symlab", "aggregate", "--data_dir", "/no/such/symlab/data"]);
        let failure = report_failure(&err, false).expect("diagnostic");
        assert_eq!(failure.exit_code, -1);
        assert_eq!(
            failure.output,
            "Unable to find data directory: /no/such/symlab/data"
        );
    }

    #[test]
    fn bad_resolution_exits_minus_one_before_reading_runs() {
        let root = temp_dir("resolution");
        let dump = root.join("dump");
        let err = run_args(&[
            "symlab",
            "aggregate",
            "--data_dir",
            root.to_str().unwrap(),
            "--dump_dir",
            dump.to_str().unwrap(),
            "--time_series_resolution",
            "0",
        ]);
        let failure = report_failure(&err, false).expect("diagnostic");
        assert_eq!(failure.exit_code, -1);
        assert!(failure.output.contains("got 0"), "{}", failure.output);
        assert!(!dump.exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn json_mode_wraps_diagnostics_and_other_errors() {
        let err = run_args(&["symlab", "aggregate", "--data_dir", "/no/such/symlab/data", "--json"]);
        let failure = report_failure(&err, true).expect("json failure");
        assert_eq!(failure.exit_code, -1);
        let payload: Value = serde_json::from_str(&failure.output).unwrap();
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error"]["code"], "aggregate_failed");

        let other = anyhow::anyhow!("failed to read profile /x.yaml");
        let failure = report_failure(&other, true).expect("json failure");
        assert_eq!(failure.exit_code, 1);
        assert!(failure.output.contains("command_failed"));
    }

    #[test]
    fn other_errors_propagate_in_text_mode() {
        let err = run_args(&[
            "symlab",
            "aggregate",
            "--data_dir",
            "/tmp",
            "--profile",
            "/no/such/symlab/profile.yaml",
        ]);
        assert!(report_failure(&err, false).is_none());
    }

    #[test]
    fn gen_jobs_defaults() {
        let cli = Cli::try_parse_from([
            "symlab",
            "gen-jobs",
            "--data_dir",
            "/data",
            "--config_dir",
            "/cfg",
            "--repo_dir",
            "/repo",
        ])
        .unwrap();
        match cli.command {
            Commands::GenJobs {
                replicates,
                seed_offset,
                time_request,
                mem,
                runs_per_subdir,
                job_dir,
                hpc_account,
                ..
            } => {
                assert_eq!(replicates, 30);
                assert_eq!(seed_offset, 1000);
                assert_eq!(time_request, "8:00:00");
                assert_eq!(mem, "4G");
                assert_eq!(runs_per_subdir, -1);
                assert_eq!(job_dir, None);
                assert_eq!(hpc_account, None);
            }
            _ => panic!("expected gen-jobs"),
        }
    }
}
