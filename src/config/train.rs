//! Submission config: the resolved YAML document a run is launched from.
//!
//! YAML shape:
//! megatron:            # schema-driven fields (+ optional `aux` mapping)
//!   lr: 3.0e-4
//! slurm:
//!   nodes: 2
//!   gpus_per_node: 4
//!   account: proj
//!   partition: gpu
//!   template: train.sbatch
//!   time: "02:00:00"   # any extra key becomes an #SBATCH directive
//! env:
//!   CUDA_DEVICE_MAX_CONNECTIONS: 1
//! launcher:
//!   cmd: torchrun --nproc-per-node 4
//! srun:
//!   opts: --cpu-bind=none
//! output_dir: runs/debug

use crate::config::model::{ConfigType, ConfigValue};
use crate::config::rules::{ValidationError, ValidationRules};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_ENTRYPOINT: &str = "$RUN_DIR/Megatron-LM/pretrain_gpt.py";

fn one() -> u32 {
    1
}

fn yes() -> bool {
    true
}

fn default_experiment_name() -> String {
    "debug".to_string()
}

fn default_global_batch_size() -> u64 {
    1
}

fn default_entrypoint() -> String {
    DEFAULT_ENTRYPOINT.to_string()
}

/// Seconds since the epoch; used when the config does not pin a timestamp.
pub fn default_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SlurmConfig {
    #[serde(default = "one")]
    pub nodes: u32,

    #[serde(default = "one")]
    pub gpus_per_node: u32,

    #[serde(default)]
    pub account: String,

    #[serde(default)]
    pub partition: String,

    #[serde(default)]
    pub total_gpus: Option<u32>,

    /// Name of the batch-script template under the template directory.
    #[serde(default)]
    pub template: String,

    /// Everything else (time, output, job_name, ...), passed through as directives.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SlurmConfig {
    /// Fill `total_gpus` and check the allocation is consistent.
    pub fn finalize(&mut self) -> Result<(), ValidationError> {
        let invalid = |message: String| ValidationError::Invalid {
            rule: "slurm".to_string(),
            message,
        };
        for (name, value) in [
            ("template", &self.template),
            ("account", &self.account),
            ("partition", &self.partition),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("`slurm.{}` must be set", name)));
            }
        }
        let expected = self.nodes.checked_mul(self.gpus_per_node).ok_or_else(|| {
            invalid(format!(
                "nodes ({}) * gpus_per_node ({}) overflows",
                self.nodes, self.gpus_per_node
            ))
        })?;
        match self.total_gpus {
            None => self.total_gpus = Some(expected),
            Some(total) if total != expected => {
                return Err(invalid(format!(
                    "total_gpus ({}) != nodes ({}) * gpus_per_node ({})",
                    total, self.nodes, self.gpus_per_node
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// The `output` directive, if the config sets one.
    pub fn output(&self) -> Option<String> {
        self.extra.get("output").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub cmd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SrunConfig {
    #[serde(default)]
    pub opts: String,
}

/// The document as written, before the `megatron` section is typed.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrainConfig {
    #[serde(default)]
    pub megatron: Value,

    pub slurm: SlurmConfig,

    #[serde(default)]
    pub env: BTreeMap<String, Value>,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub srun: SrunConfig,

    #[serde(default = "default_global_batch_size")]
    pub global_batch_size: u64,

    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,

    #[serde(default)]
    pub timestamp: Option<String>,

    pub output_dir: String,

    #[serde(default = "yes")]
    pub nest_launcher: bool,

    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub megatron: ConfigValue,
    pub slurm: SlurmConfig,
    pub env: BTreeMap<String, Value>,
    pub launcher: LauncherConfig,
    pub srun: SrunConfig,
    pub global_batch_size: u64,
    pub experiment_name: String,
    pub timestamp: String,
    pub output_dir: String,
    pub nest_launcher: bool,
    pub entrypoint: String,
}

impl TrainConfig {
    /// Type the `megatron` section against `ty`.
    pub fn from_raw(raw: RawTrainConfig, ty: &ConfigType) -> anyhow::Result<Self> {
        let megatron = ty
            .instantiate_value(&raw.megatron)
            .context("megatron section")?;
        Ok(Self {
            megatron,
            slurm: raw.slurm,
            env: raw.env,
            launcher: raw.launcher,
            srun: raw.srun,
            global_batch_size: raw.global_batch_size,
            experiment_name: raw.experiment_name,
            timestamp: raw.timestamp.unwrap_or_else(default_timestamp),
            output_dir: raw.output_dir,
            nest_launcher: raw.nest_launcher,
            entrypoint: raw.entrypoint,
        })
    }

    /// Validate once, at the finalization boundary.
    pub fn finalize(&mut self, rules: &ValidationRules) -> Result<(), ValidationError> {
        self.slurm.finalize()?;
        rules.validate(&self.megatron, &self.env)
    }
}

/// Parse a resolved YAML document into a validated `TrainConfig`.
pub fn parse_train_config(
    text: &str,
    ty: &ConfigType,
    rules: &ValidationRules,
) -> anyhow::Result<TrainConfig> {
    let raw: RawTrainConfig = serde_yaml::from_str(text).context("parse train config")?;
    let mut config = TrainConfig::from_raw(raw, ty)?;
    config.finalize(rules)?;
    Ok(config)
}

pub fn load_train_config(
    path: &str,
    ty: &ConfigType,
    rules: &ValidationRules,
) -> anyhow::Result<TrainConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("read config file {}", path))?;
    parse_train_config(&text, ty, rules).with_context(|| format!("config file {}", path))
}

/// Load a diff baseline: the `megatron` section of a YAML file, or the whole
/// document when it has no such key.
pub fn load_baseline(path: &str, ty: &ConfigType) -> anyhow::Result<ConfigValue> {
    let text = fs::read_to_string(path).with_context(|| format!("read baseline file {}", path))?;
    let doc: Value =
        serde_yaml::from_str(&text).with_context(|| format!("parse baseline file {}", path))?;
    let section = match doc.get("megatron") {
        Some(section) => section,
        None => &doc,
    };
    Ok(ty
        .instantiate_value(section)
        .with_context(|| format!("baseline file {}", path))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::build;
    use crate::schema::{ArgKind, ArgumentSpec, ScalarType, Schema, ValueType};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn ty() -> ConfigType {
        let schema: Schema = [
            ArgumentSpec::new("lr", ValueType::Scalar(ScalarType::Float), json!(null), ArgKind::Store),
            ArgumentSpec::new("seed", ValueType::Scalar(ScalarType::Int), json!(1234), ArgKind::Store),
        ]
        .into_iter()
        .collect();
        build(&schema, &BTreeSet::new(), &BTreeMap::new()).unwrap()
    }

    const DOC: &str = r#"
megatron:
  lr: 0.001
  aux:
    sweep: a
slurm:
  nodes: 2
  gpus_per_node: 4
  account: proj
  partition: gpu
  template: train.sbatch
  time: "01:00:00"
env:
  CUDA_DEVICE_MAX_CONNECTIONS: 1
launcher:
  cmd: torchrun
output_dir: runs/x
timestamp: "2024-01-01"
"#;

    #[test]
    fn parses_and_finalizes() {
        let config = parse_train_config(DOC, &ty(), &ValidationRules::new()).unwrap();
        assert_eq!(config.megatron.get("lr"), Some(&json!(0.001)));
        assert_eq!(config.megatron.get("seed"), Some(&json!(1234)));
        assert_eq!(config.megatron.aux().get("sweep"), Some(&json!("a")));
        assert_eq!(config.slurm.total_gpus, Some(8));
        assert_eq!(config.slurm.extra.get("time"), Some(&json!("01:00:00")));
        assert_eq!(config.experiment_name, "debug");
        assert!(config.nest_launcher);
        assert_eq!(config.entrypoint, DEFAULT_ENTRYPOINT);
    }

    #[test]
    fn inconsistent_gpu_count_is_rejected() {
        let doc = DOC.replace("gpus_per_node: 4", "gpus_per_node: 4\n  total_gpus: 6");
        let err = parse_train_config(&doc, &ty(), &ValidationRules::new()).unwrap_err();
        let err = err.downcast::<ValidationError>().unwrap();
        assert_eq!(err.rule(), "slurm");
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let doc = DOC
            .replace("nodes: 2", "nodes: 4294967295")
            .replace("gpus_per_node: 4", "gpus_per_node: 2");
        let err = parse_train_config(&doc, &ty(), &ValidationRules::new()).unwrap_err();
        let err = err.downcast::<ValidationError>().unwrap();
        assert_eq!(err.rule(), "slurm");
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn missing_template_is_rejected() {
        let doc = DOC.replace("template: train.sbatch", "");
        let err = parse_train_config(&doc, &ty(), &ValidationRules::new()).unwrap_err();
        assert!(err.to_string().contains("slurm.template"));
    }

    #[test]
    fn unknown_megatron_key_fails_fast() {
        let doc = DOC.replace("lr: 0.001", "learning_rate: 0.001");
        let err = parse_train_config(&doc, &ty(), &ValidationRules::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown config field: learning_rate"));
    }

    #[test]
    fn baseline_accepts_section_or_bare_document() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("full.yaml");
        let bare = dir.path().join("bare.yaml");
        std::fs::write(&full, "megatron:\n  seed: 1\n").unwrap();
        std::fs::write(&bare, "seed: 2\n").unwrap();
        let a = load_baseline(full.to_str().unwrap(), &ty()).unwrap();
        let b = load_baseline(bare.to_str().unwrap(), &ty()).unwrap();
        assert_eq!(a.get("seed"), Some(&json!(1)));
        assert_eq!(b.get("seed"), Some(&json!(2)));
    }
}
