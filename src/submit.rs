//! Batch-script rendering and job submission.
//!
//! A template is a plain batch script with `{{ key }}` placeholders:
//!
//! #!/bin/bash
//! {{ sbatch_cmds }}
//! {{ env_exports }}
//! srun {{ srun_opts }} bash -c '{{ launcher }} {{ megatron_cmd }}'
//!
//! With `nest_launcher` the launcher and training command are single-quote
//! escaped so they survive being nested inside `bash -c '...'`.

use crate::cmdline::render_command;
use crate::config::{SlurmConfig, TrainConfig};
use crate::run::{RunOptions, run_with_tee};
use anyhow::{Context, bail};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SCRIPT_FILE: &str = "train_megatron.sbatch";
pub const CONFIG_FILE: &str = "submit_config.yaml";

/// Replace every `{{ key }}` with its value. Unknown placeholders stay as-is.
pub fn render_template(template: &str, replacements: &BTreeMap<&str, String>) -> String {
    replacements
        .iter()
        .fold(template.to_string(), |text, (key, value)| {
            text.replace(&format!("{{{{ {} }}}}", key), value)
        })
}

pub fn load_template(dir: &Path, name: &str) -> anyhow::Result<String> {
    let path = dir.join(name);
    fs::read_to_string(&path).with_context(|| format!("read template {}", path.display()))
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `#SBATCH --key=value` lines for the allocation and every extra key.
pub fn sbatch_directives(slurm: &SlurmConfig) -> String {
    let mut lines = vec![
        format!("#SBATCH --nodes={}", slurm.nodes),
        format!("#SBATCH --gpus-per-node={}", slurm.gpus_per_node),
        format!("#SBATCH --account={}", slurm.account),
        format!("#SBATCH --partition={}", slurm.partition),
    ];
    lines.extend(
        slurm
            .extra
            .iter()
            .map(|(k, v)| format!("#SBATCH --{}={}", k.replace('_', "-"), plain(v))),
    );
    lines.join("\n")
}

pub fn env_exports(env: &BTreeMap<String, Value>) -> String {
    env.iter()
        .map(|(k, v)| format!("export {}={}", k, plain(v)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Escape single quotes for use inside a single-quoted bash string.
pub fn quote_bash(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

pub fn render_script(config: &TrainConfig, template: &str, tokens: &[String]) -> String {
    let mut launcher = config.launcher.cmd.clone();
    let mut megatron_cmd = render_command(&config.entrypoint, tokens);
    if config.nest_launcher {
        launcher = quote_bash(&launcher);
        megatron_cmd = quote_bash(&megatron_cmd);
    }
    let replacements = BTreeMap::from([
        ("env_exports", env_exports(&config.env)),
        ("sbatch_cmds", sbatch_directives(&config.slurm)),
        ("launcher", launcher),
        ("srun_opts", config.srun.opts.clone()),
        ("megatron_cmd", megatron_cmd),
    ]);
    render_template(template, &replacements)
}

const JOB_ID_RE: &str = r"Submitted batch job (\d+)";

pub fn extract_job_id(text: &str) -> anyhow::Result<Option<String>> {
    let re = Regex::new(JOB_ID_RE)?;
    Ok(re.captures(text).map(|caps| caps[1].to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Print the script instead of writing anything.
    pub debug: bool,
    /// Submit after writing.
    pub run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Printed,
    Written { script: PathBuf },
    Submitted { script: PathBuf, job_id: Option<String> },
}

/// Writes and submits batch scripts.
#[derive(Debug, Clone)]
pub struct Submitter {
    /// Submission program, `sbatch` unless overridden.
    pub program: String,
}

impl Default for Submitter {
    fn default() -> Self {
        Self {
            program: "sbatch".to_string(),
        }
    }
}

impl Submitter {
    pub fn submit(
        &self,
        config: &TrainConfig,
        script: &str,
        options: SubmitOptions,
        out: &mut dyn Write,
    ) -> anyhow::Result<SubmitOutcome> {
        writeln!(out, "Output Directory: {}", config.output_dir)?;
        if options.debug {
            writeln!(out, "SLURM_SCRIPT:")?;
            writeln!(out, "{}", script)?;
            return Ok(SubmitOutcome::Printed);
        }

        if let Some(slurm_out) = config.slurm.output() {
            writeln!(out, "SLURMOUT: {}", slurm_out)?;
        }
        let script_path = write_submission(config, script)?;
        if !options.run {
            writeln!(
                out,
                "Successful, to execute, run: SUBMIT_TIMESTAMP={} {} {}",
                config.timestamp,
                self.program,
                script_path.display()
            )?;
            return Ok(SubmitOutcome::Written {
                script: script_path,
            });
        }

        let job_id = self.sbatch(&script_path, &config.timestamp)?;
        Ok(SubmitOutcome::Submitted {
            script: script_path,
            job_id,
        })
    }

    /// Run the submission program on `script`; returns the job id it reported.
    pub fn sbatch(&self, script: &Path, timestamp: &str) -> anyhow::Result<Option<String>> {
        let argv = vec![self.program.clone(), script.display().to_string()];
        let env = BTreeMap::from([("SUBMIT_TIMESTAMP".to_string(), timestamp.to_string())]);
        self.submit_args(&argv, env)
    }

    /// Run a complete submission command line with extra environment.
    pub fn submit_args(
        &self,
        argv: &[String],
        env: BTreeMap<String, String>,
    ) -> anyhow::Result<Option<String>> {
        let result = run_with_tee(argv, &RunOptions::default().checked().with_env(env))
            .with_context(|| format!("submit {}", argv.join(" ")))?;
        let job_id = extract_job_id(&result.stdout_text())?;
        match &job_id {
            Some(id) => info!(job_id = %id, "submitted"),
            None => info!("submitted, no job id in output"),
        }
        Ok(job_id)
    }
}

/// Create the output directory and write the script plus the resolved config.
pub fn write_submission(config: &TrainConfig, script: &str) -> anyhow::Result<PathBuf> {
    let dir = Path::new(&config.output_dir);
    if config.output_dir.is_empty() {
        bail!("output_dir must be set");
    }
    if dir.exists() {
        bail!("output directory {} already exists", dir.display());
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let script_path = dir.join(SCRIPT_FILE);
    fs::write(&script_path, script)
        .with_context(|| format!("write {}", script_path.display()))?;

    let config_path = dir.join(CONFIG_FILE);
    let yaml = serde_yaml::to_string(config).context("serialize submit config")?;
    fs::write(&config_path, yaml).with_context(|| format!("write {}", config_path.display()))?;
    Ok(script_path)
}
