//! Running the submit step inside an Apptainer/Singularity image.
//!
//! The image carries Megatron and the Python stack but not the scheduler
//! client, so `submit` runs in the container without `--run` and prints its
//! hand-off line:
//!
//! Successful, to execute, run: SUBMIT_TIMESTAMP=20260101_120000 sbatch /runs/a/train_megatron.sbatch
//!
//! The line is then executed on the host, with the leading `KEY=VALUE`
//! words layered over this process's environment.

use crate::run::{RunOptions, run_with_tee};
use crate::submit::Submitter;
use anyhow::Context;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};

const SUBMIT_LINE_RE: &str = r"(?m)^Successful, to execute, run: (.+)$";

/// A container runtime and the image to run in.
#[derive(Debug, Clone)]
pub struct Container {
    /// Runtime command, e.g. `["singularity"]` or `["apptainer"]`.
    pub runtime: Vec<String>,
    pub image: String,
    /// Shell prefix for the inner command, e.g. `PYTHONPATH=src:Megatron-LM`.
    pub env: String,
}

/// The host-side submission printed by the inner command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitLine {
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOutcome {
    /// The inner command printed no hand-off line (`--debug`, say).
    NoSubmitLine,
    Prepared { line: SubmitLine },
    Submitted { line: SubmitLine, job_id: Option<String> },
}

impl Container {
    /// `<runtime> exec <image> bash -c '<env> <inner...>'`.
    pub fn command(&self, inner: &[String]) -> Vec<String> {
        let words: Vec<String> = inner.iter().map(|w| shell_word(w)).collect();
        let script = if self.env.is_empty() {
            words.join(" ")
        } else {
            format!("{} {}", self.env, words.join(" "))
        };
        let mut argv = self.runtime.clone();
        argv.extend([
            "exec".to_string(),
            self.image.clone(),
            "bash".to_string(),
            "-c".to_string(),
            script,
        ]);
        argv
    }

    /// Run `inner` in the image, then submit what it printed unless `no_run`.
    pub fn run(
        &self,
        inner: &[String],
        submitter: &Submitter,
        no_run: bool,
    ) -> anyhow::Result<ContainerOutcome> {
        let argv = self.command(inner);
        debug!(image = %self.image, ?argv, "running in container");
        let result = run_with_tee(&argv, &RunOptions::default().checked())
            .with_context(|| format!("run in container {}", self.image))?;

        let Some(line) = parse_submit_line(&result.stdout_text())? else {
            info!("no submit line in container output");
            return Ok(ContainerOutcome::NoSubmitLine);
        };
        if no_run {
            return Ok(ContainerOutcome::Prepared { line });
        }
        let job_id = submitter.submit_args(&line.argv, line.env.clone())?;
        Ok(ContainerOutcome::Submitted { line, job_id })
    }
}

/// The last hand-off line in `text`, split into env assignments and argv.
pub fn parse_submit_line(text: &str) -> anyhow::Result<Option<SubmitLine>> {
    let re = Regex::new(SUBMIT_LINE_RE)?;
    let Some(caps) = re.captures_iter(text).last() else {
        return Ok(None);
    };
    let mut env = BTreeMap::new();
    let mut words = caps[1].split_whitespace().peekable();
    while let Some(&word) = words.peek() {
        match assignment(word) {
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
                words.next();
            }
            None => break,
        }
    }
    let argv: Vec<String> = words.map(str::to_string).collect();
    if argv.is_empty() {
        return Ok(None);
    }
    Ok(Some(SubmitLine { env, argv }))
}

fn assignment(word: &str) -> Option<(&str, &str)> {
    let (key, value) = word.split_once('=')?;
    let ident = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    ident.then_some((key, value))
}

fn shell_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
