//! Scheduler queries: where does a job write its output?
//!
//! `scontrol show jobid=<id>` prints free-form `Key=Value` text; the output
//! path is the `StdOut=` token:
//!
//! JobId=4242 JobName=train ...
//!    StdOut=/scratch/runs/debug/slurm-4242.out

use crate::run::{RunOptions, run_with_tee};
use anyhow::Context;
use regex::Regex;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("scheduler reported no StdOut path for job {job_id}")]
    MissingStdOut { job_id: String },
}

/// A cluster scheduler that can describe a job.
pub trait Scheduler {
    /// Free-form status text for `job_id`.
    fn show_job(&self, job_id: &str) -> anyhow::Result<String>;
}

/// SLURM via `scontrol`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slurm;

impl Scheduler for Slurm {
    fn show_job(&self, job_id: &str) -> anyhow::Result<String> {
        let argv = vec![
            "scontrol".to_string(),
            "show".to_string(),
            format!("jobid={}", job_id),
        ];
        let result = run_with_tee(&argv, &RunOptions::default())
            .with_context(|| format!("query job {}", job_id))?;
        Ok(result.stdout_text().into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub output_path: Option<PathBuf>,
}

const STDOUT_RE: &str = r"StdOut=(\S+)";

pub fn parse_stdout_path(text: &str) -> anyhow::Result<Option<PathBuf>> {
    let re = Regex::new(STDOUT_RE)?;
    Ok(re.captures(text).map(|caps| PathBuf::from(&caps[1])))
}

/// One scheduler query; no retries.
pub fn resolve(scheduler: &dyn Scheduler, job_id: &str) -> anyhow::Result<JobHandle> {
    let text = scheduler.show_job(job_id)?;
    let path = parse_stdout_path(&text)?.ok_or_else(|| ResolutionError::MissingStdOut {
        job_id: job_id.to_string(),
    })?;
    debug!(job_id, path = %path.display(), "resolved job output");
    Ok(JobHandle {
        job_id: job_id.to_string(),
        output_path: Some(path),
    })
}
