use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::design::{Condition, ExperimentDesign};
use crate::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};

pub const BUILTIN_TEMPLATE: &str = include_str!("../templates/base_slurm_script.txt");
pub const JOB_MANIFEST_FILE: &str = "job_manifest.json";
pub const DEFAULT_REPLICATES: u64 = 30;
pub const DEFAULT_SEED_OFFSET: u64 = 1000;
pub const DEFAULT_TIME_REQUEST: &str = "8:00:00";
pub const DEFAULT_MEM_REQUEST: &str = "4G";

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub data_dir: PathBuf,
    pub config_dir: String,
    pub repo_dir: String,
    pub replicates: u64,
    pub job_dir: PathBuf,
    pub seed_offset: u64,
    pub hpc_account: Option<String>,
    pub time_request: String,
    pub mem_request: String,
    /// Start a new `job-set-<n>` directory roughly every this many runs;
    /// `None` writes every script straight into `job_dir`.
    pub runs_per_subdir: Option<i64>,
    pub hpc_env_file: Option<String>,
}

impl JobOptions {
    pub fn new(data_dir: impl Into<PathBuf>, config_dir: &str, repo_dir: &str) -> Self {
        let data_dir = data_dir.into();
        Self {
            job_dir: data_dir.join("jobs"),
            data_dir,
            config_dir: config_dir.to_string(),
            repo_dir: repo_dir.to_string(),
            replicates: DEFAULT_REPLICATES,
            seed_offset: DEFAULT_SEED_OFFSET,
            hpc_account: None,
            time_request: DEFAULT_TIME_REQUEST.to_string(),
            mem_request: DEFAULT_MEM_REQUEST.to_string(),
            runs_per_subdir: None,
            hpc_env_file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobFile {
    pub condition: usize,
    pub job_name: String,
    pub path: PathBuf,
    pub seed_offset: u64,
    pub run_params: String,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub jobs: Vec<JobFile>,
    pub total_runs: u64,
    pub manifest_path: PathBuf,
}

#[derive(Debug)]
struct SubdirBuckets {
    runs_per_subdir: Option<i64>,
    replicates: i64,
    run_count: i64,
    subdir: usize,
}

impl SubdirBuckets {
    fn new(runs_per_subdir: Option<i64>, replicates: u64) -> Self {
        Self {
            runs_per_subdir,
            replicates: replicates as i64,
            run_count: 0,
            subdir: 0,
        }
    }

    fn current(&self, job_dir: &Path) -> PathBuf {
        match self.runs_per_subdir {
            None => job_dir.to_path_buf(),
            Some(_) => job_dir.join(format!("job-set-{}", self.subdir)),
        }
    }

    /// Rolls over once the running count exceeds `runs_per_subdir - replicates`.
    fn advance(&mut self) {
        let Some(limit) = self.runs_per_subdir else {
            return;
        };
        self.run_count += self.replicates;
        if self.run_count > limit - self.replicates {
            self.run_count = 0;
            self.subdir += 1;
        }
    }
}

fn run_commands(run_params: &str) -> String {
    [
        format!("RUN_PARAMS=\"{}\"", run_params),
        "echo \"./${EXEC} ${RUN_PARAMS}\" > cmd.log".to_string(),
        "./${EXEC} ${RUN_PARAMS} > run.log".to_string(),
    ]
    .join("\n")
}

fn config_copy_commands(globs: &[String]) -> String {
    globs
        .iter()
        .map(|g| format!("cp ${{CONFIG_DIR}}/{} .", g))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_job_script(
    template: &str,
    design: &ExperimentDesign,
    condition: &Condition,
    options: &JobOptions,
    seed_offset: u64,
) -> (String, String) {
    let job_name = format!("C{}", condition.index);
    let run_dir = options
        .data_dir
        .join(format!("RUN_{}_${{SEED}}", job_name));
    let run_params = condition.command_line(&design.fixed_parameters, &[("SEED", "${SEED}")]);
    let account = options
        .hpc_account
        .as_ref()
        .map(|a| format!("#SBATCH --account {}", a))
        .unwrap_or_default();
    let env_setup = options
        .hpc_env_file
        .as_ref()
        .map(|f| format!("source {}", f))
        .unwrap_or_default();

    let script = template
        .replace("<<TIME_REQUEST>>", &options.time_request)
        .replace("<<ARRAY_ID_RANGE>>", &format!("1-{}", options.replicates))
        .replace("<<MEMORY_REQUEST>>", &options.mem_request)
        .replace("<<JOB_NAME>>", &job_name)
        .replace("<<CONFIG_DIR>>", &options.config_dir)
        .replace("<<REPO_DIR>>", &options.repo_dir)
        .replace("<<EXEC>>", &design.executable)
        .replace("<<JOB_SEED_OFFSET>>", &seed_offset.to_string())
        .replace("<<HPC_ACCOUNT_INFO>>", &account)
        .replace("<<SETUP_HPC_ENV>>", &env_setup)
        .replace("<<RUN_DIR>>", &run_dir.to_string_lossy())
        .replace("<<RUN_CMDS>>", &run_commands(&run_params))
        .replace("<<CONFIG_CP_CMDS>>", &config_copy_commands(&design.config_globs));
    (script, run_params)
}

pub fn load_template(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => fs::read_to_string(p)
            .with_context(|| format!("failed to read job template {}", p.display())),
        None => Ok(BUILTIN_TEMPLATE.to_string()),
    }
}

pub fn generate_jobs(
    design: &ExperimentDesign,
    template: &str,
    options: &JobOptions,
) -> Result<JobReport> {
    if options.replicates == 0 {
        return Err(anyhow!("replicates must be at least 1"));
    }
    let conditions = design.conditions();
    let total_runs = options.replicates * conditions.len() as u64;
    info!(
        jobs = total_runs,
        files = conditions.len(),
        job_dir = %options.job_dir.display(),
        "generating job scripts"
    );

    let mut buckets = SubdirBuckets::new(options.runs_per_subdir, options.replicates);
    let mut jobs = Vec::with_capacity(conditions.len());
    for condition in &conditions {
        let seed_offset = options.seed_offset + condition.index as u64 * options.replicates;
        let (script, run_params) =
            render_job_script(template, design, condition, options, seed_offset);

        let dir = buckets.current(&options.job_dir);
        ensure_dir(&dir)?;
        let path = dir.join(format!("RUN_C{}.sb", condition.index));
        atomic_write_bytes(&path, script.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(condition = condition.index, seed_offset, path = %path.display(), "wrote job script");

        jobs.push(JobFile {
            condition: condition.index,
            job_name: format!("C{}", condition.index),
            path,
            seed_offset,
            run_params,
        });
        buckets.advance();
    }

    let manifest_path = options.job_dir.join(JOB_MANIFEST_FILE);
    let manifest = json!({
        "schema_version": "job_manifest_v1",
        "created_at": Utc::now().to_rfc3339(),
        "executable": design.executable,
        "replicates": options.replicates,
        "total_runs": total_runs,
        "jobs": jobs.iter().map(|j| json!({
            "condition": j.condition,
            "job_name": j.job_name,
            "path": j.path.display().to_string(),
            "seed_first": j.seed_offset + 1,
            "seed_last": j.seed_offset + options.replicates,
            "run_params": j.run_params,
        })).collect::<Vec<_>>(),
    });
    ensure_dir(&options.job_dir)?;
    atomic_write_json_pretty(&manifest_path, &manifest)?;

    Ok(JobReport {
        jobs,
        total_runs,
        manifest_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Axis;
    use crate::test_dir;
    use std::collections::BTreeSet;

    const DESIGN: &str = r#"
executable: symbulation_sgp
fixed_parameters:
  UPDATES: "1000"
  POP_SIZE: "-1"
axes:
  - kind: rendered
    name: SYM_INT
    values: ["-1", "0", "1"]
  - kind: verbatim
    name: symbiont
    values:
      - "-START_MOI 0 -VERTICAL_TRANSMISSION 0"
      - "-START_MOI 1 -VERTICAL_TRANSMISSION 1"
"#;

    fn options(root: &Path) -> JobOptions {
        JobOptions {
            replicates: 10,
            ..JobOptions::new(root.join("data"), "/cfg", "/repo")
        }
    }

    fn sb_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "sb"))
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn one_file_per_condition_with_disjoint_seed_blocks() {
        let root = test_dir("jobs_count");
        let design = ExperimentDesign::from_yaml(DESIGN).unwrap();
        let opts = options(&root);
        let report = generate_jobs(&design, BUILTIN_TEMPLATE, &opts).expect("generate");

        assert_eq!(report.jobs.len(), 6);
        assert_eq!(report.total_runs, 60);
        assert_eq!(sb_files(&opts.job_dir).len(), 6);

        let mut seeds = BTreeSet::new();
        for job in &report.jobs {
            for s in job.seed_offset + 1..=job.seed_offset + opts.replicates {
                assert!(seeds.insert(s), "seed {} reused", s);
            }
        }
        assert_eq!(seeds.len(), 60);
        assert_eq!(report.jobs[0].seed_offset, 1000);
        assert_eq!(report.jobs[5].seed_offset, 1050);
        assert!(report.manifest_path.is_file());
        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(&report.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["jobs"][5]["seed_last"], 1060);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn every_flag_appears_exactly_once() {
        let root = test_dir("jobs_flags");
        let design = ExperimentDesign::from_yaml(DESIGN).unwrap();
        let report = generate_jobs(&design, BUILTIN_TEMPLATE, &options(&root)).expect("generate");
        for job in &report.jobs {
            let tokens: Vec<&str> = job
                .run_params
                .split_whitespace()
                .filter(|t| t.starts_with('-') && t.parse::<f64>().is_err())
                .collect();
            let unique: BTreeSet<&str> = tokens.iter().copied().collect();
            assert_eq!(tokens.len(), unique.len(), "{}", job.run_params);
            for flag in [
                "-UPDATES",
                "-POP_SIZE",
                "-SEED",
                "-SYM_INT",
                "-START_MOI",
                "-VERTICAL_TRANSMISSION",
            ] {
                assert!(unique.contains(flag), "{} missing in {}", flag, job.run_params);
            }
        }
        let verbatim: BTreeSet<String> = report
            .jobs
            .iter()
            .map(|j| {
                let i = j.run_params.find("-START_MOI").unwrap();
                j.run_params[i..].to_string()
            })
            .collect();
        let expected: BTreeSet<String> = match &design.axes[1] {
            Axis::Verbatim { values, .. } => values.iter().cloned().collect(),
            Axis::Rendered { .. } => panic!("expected verbatim axis"),
        };
        assert_eq!(verbatim, expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn template_placeholders_are_all_filled() {
        let root = test_dir("jobs_render");
        let design = ExperimentDesign::from_yaml(DESIGN).unwrap();
        let mut opts = options(&root);
        opts.hpc_account = Some("devolab".to_string());
        opts.hpc_env_file = Some("/home/me/load_modules.sh".to_string());
        let cond = &design.conditions()[1];
        let (script, params) = render_job_script(BUILTIN_TEMPLATE, &design, cond, &opts, 1010);

        assert!(!script.contains("<<"), "unfilled placeholder:\n{}", script);
        assert!(script.contains("#SBATCH --array=1-10"));
        assert!(script.contains("#SBATCH --account devolab"));
        assert!(script.contains("source /home/me/load_modules.sh"));
        assert!(script.contains("JOB_SEED_OFFSET=1010"));
        assert!(script.contains("#SBATCH --job-name C1"));
        assert!(script.contains("cp ${CONFIG_DIR}/*.cfg ."));
        assert!(script.contains("RUN_C1_${SEED}"));
        assert!(script.contains(&format!("RUN_PARAMS=\"{}\"", params)));
        assert!(params.starts_with("-POP_SIZE -1 -SEED ${SEED} -SYM_INT -1 -UPDATES 1000"));

        opts.hpc_account = None;
        opts.hpc_env_file = None;
        let (script, _) = render_job_script(BUILTIN_TEMPLATE, &design, cond, &opts, 1010);
        assert!(!script.contains("--account"));
        assert!(!script.contains("source "));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn subdir_rollover_follows_running_count() {
        let mut b = SubdirBuckets::new(Some(60), 30);
        let root = Path::new("/jobs");
        let mut dirs = Vec::new();
        for _ in 0..5 {
            dirs.push(b.current(root));
            b.advance();
        }
        let names: Vec<String> = dirs
            .iter()
            .map(|d| d.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["job-set-0", "job-set-0", "job-set-1", "job-set-1", "job-set-2"]
        );

        // A limit below two conditions' worth rolls over after every file.
        let mut b = SubdirBuckets::new(Some(50), 30);
        assert_eq!(b.current(root), root.join("job-set-0"));
        b.advance();
        assert_eq!(b.current(root), root.join("job-set-1"));

        let mut b = SubdirBuckets::new(None, 30);
        b.advance();
        assert_eq!(b.current(root), root.to_path_buf());
    }

    #[test]
    fn bucketed_generation_spreads_files() {
        let root = test_dir("jobs_bucket");
        let design = ExperimentDesign::from_yaml(DESIGN).unwrap();
        let mut opts = options(&root);
        opts.runs_per_subdir = Some(20);
        let report = generate_jobs(&design, BUILTIN_TEMPLATE, &opts).expect("generate");
        let dirs: BTreeSet<PathBuf> = report
            .jobs
            .iter()
            .map(|j| j.path.parent().unwrap().to_path_buf())
            .collect();
        assert_eq!(dirs.len(), 3);
        assert!(opts.job_dir.join("job-set-2").join("RUN_C5.sb").is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_replicates_is_rejected() {
        let root = test_dir("jobs_zero");
        let design = ExperimentDesign::from_yaml(DESIGN).unwrap();
        let mut opts = options(&root);
        opts.replicates = 0;
        assert!(generate_jobs(&design, BUILTIN_TEMPLATE, &opts).is_err());
        assert!(!opts.job_dir.exists());
        let _ = fs::remove_dir_all(root);
    }
}
