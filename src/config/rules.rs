//! Cross-field business rules for the training config.
//!
//! Rules are data: a named `Rule` in a `ValidationRules` table. They are
//! checked once, when the config is finalized, never during compilation.
//! A rule that mentions a field the config does not carry (excluded from the
//! schema) is skipped, except `Require`, which reports the field as missing.

use crate::config::model::ConfigValue;
use crate::schema::value::{symbolic_name, truthy};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("[{rule}] required field `{field}` is missing or null")]
    MissingRequired { rule: String, field: String },

    #[error("[{rule}] at most one of {flags:?} may be enabled, found {enabled:?}")]
    Exclusive {
        rule: String,
        flags: Vec<String>,
        enabled: Vec<String>,
    },

    #[error("[{rule}] `{field}` ({value}) must not exceed `{limit}` ({limit_value})")]
    Exceeds {
        rule: String,
        field: String,
        value: String,
        limit: String,
        limit_value: String,
    },

    #[error("[{rule}] `{flag}` requires `{field}` to be one of {allowed:?}, got {value}")]
    NotAllowed {
        rule: String,
        flag: String,
        field: String,
        allowed: Vec<String>,
        value: String,
    },

    #[error("[{rule}] `{flag}` requires one of {others:?} to be enabled")]
    MissingCompanion {
        rule: String,
        flag: String,
        others: Vec<String>,
    },

    #[error("[{rule}] {var}={value} is below {min}; `{field}` must be {expected}, got {actual}")]
    EnvConflict {
        rule: String,
        var: String,
        value: i64,
        min: i64,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("[{rule}] {message}")]
    Invalid { rule: String, message: String },
}

impl ValidationError {
    /// Name of the rule that failed.
    pub fn rule(&self) -> &str {
        match self {
            ValidationError::MissingRequired { rule, .. }
            | ValidationError::Exclusive { rule, .. }
            | ValidationError::Exceeds { rule, .. }
            | ValidationError::NotAllowed { rule, .. }
            | ValidationError::MissingCompanion { rule, .. }
            | ValidationError::EnvConflict { rule, .. }
            | ValidationError::Invalid { rule, .. } => rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// Every listed field must be present and non-null.
    Require(Vec<String>),
    /// At most one flag in the group may be enabled.
    Exclusive(Vec<String>),
    /// `field <= limit`, numerically.
    NotExceeding { field: String, limit: String },
    /// If `flag` is enabled, `field` must take one of `allowed`.
    RequiresOneOf {
        flag: String,
        field: String,
        allowed: Vec<String>,
    },
    /// If `flag` is enabled, at least one of `others` must be too.
    RequiresAny { flag: String, others: Vec<String> },
    /// If env `var` is set below `min`, `field` must equal `expected`.
    EnvFloor {
        var: String,
        min: i64,
        field: String,
        expected: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedRule {
    pub name: String,
    pub rule: Rule,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    rules: Vec<NamedRule>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ValidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, rule: Rule) -> Self {
        self.rules.push(NamedRule {
            name: name.to_string(),
            rule,
        });
        self
    }

    pub fn rules(&self) -> &[NamedRule] {
        &self.rules
    }

    /// Rule table for Megatron-LM training configs.
    pub fn megatron() -> Self {
        Self::new()
            .with(
                "required_fields",
                Rule::Require(strings(&[
                    "micro_batch_size",
                    "train_iters",
                    "lr_decay_style",
                    "lr",
                    "num_layers",
                    "hidden_size",
                    "ffn_hidden_size",
                    "kv_channels",
                    "num_attention_heads",
                    "vocab_size",
                    "max_position_embeddings",
                ])),
            )
            .with(
                "distributed_optimizer_vs_fsdp2",
                Rule::Exclusive(strings(&["use_distributed_optimizer", "use_torch_fsdp2"])),
            )
            .with(
                "megatron_fsdp_vs_fsdp2",
                Rule::Exclusive(strings(&["use_megatron_fsdp", "use_torch_fsdp2"])),
            )
            .with(
                "grad_accum_fusion_vs_fsdp2",
                Rule::Exclusive(strings(&["gradient_accumulation_fusion", "use_torch_fsdp2"])),
            )
            .with(
                "warmup_within_train_iters",
                Rule::NotExceeding {
                    field: "lr_warmup_iters".into(),
                    limit: "train_iters".into(),
                },
            )
            .with(
                "megatron_fsdp_ckpt_format",
                Rule::RequiresOneOf {
                    flag: "use_megatron_fsdp".into(),
                    field: "ckpt_format".into(),
                    allowed: strings(&["fsdp_dtensor"]),
                },
            )
            .with(
                "overlap_param_gather_needs_sharded_optimizer",
                Rule::RequiresAny {
                    flag: "overlap_param_gather".into(),
                    others: strings(&["use_distributed_optimizer", "use_megatron_fsdp"]),
                },
            )
            .with(
                "grad_accum_fusion_sharding",
                Rule::RequiresOneOf {
                    flag: "gradient_accumulation_fusion".into(),
                    field: "data_parallel_sharding_strategy".into(),
                    allowed: strings(&["no_shard", "optim"]),
                },
            )
            .with(
                "device_connections_sharding",
                Rule::EnvFloor {
                    var: "CUDA_DEVICE_MAX_CONNECTIONS".into(),
                    min: 2,
                    field: "data_parallel_sharding_strategy".into(),
                    expected: "no_shard".into(),
                },
            )
    }

    /// First violation, in table order.
    pub fn validate(
        &self,
        config: &ConfigValue,
        env: &BTreeMap<String, Value>,
    ) -> Result<(), ValidationError> {
        match self.violations(config, env).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Every violation, in table order.
    pub fn violations(
        &self,
        config: &ConfigValue,
        env: &BTreeMap<String, Value>,
    ) -> Vec<ValidationError> {
        let mut out = Vec::new();
        for named in &self.rules {
            check(named, config, env, &mut out);
        }
        out
    }
}

fn check(
    named: &NamedRule,
    config: &ConfigValue,
    env: &BTreeMap<String, Value>,
    out: &mut Vec<ValidationError>,
) {
    let rule = named.name.clone();
    match &named.rule {
        Rule::Require(fields) => {
            for field in fields {
                if config.is_null(field) {
                    out.push(ValidationError::MissingRequired {
                        rule: rule.clone(),
                        field: field.clone(),
                    });
                }
            }
        }
        Rule::Exclusive(flags) => {
            let enabled: Vec<String> = flags
                .iter()
                .filter(|f| config.get(f).map(truthy).unwrap_or(false))
                .cloned()
                .collect();
            if enabled.len() > 1 {
                out.push(ValidationError::Exclusive {
                    rule,
                    flags: flags.clone(),
                    enabled,
                });
            }
        }
        Rule::NotExceeding { field, limit } => {
            let (Some(v), Some(l)) = (
                config.get(field).and_then(Value::as_f64),
                config.get(limit).and_then(Value::as_f64),
            ) else {
                return;
            };
            if v > l {
                out.push(ValidationError::Exceeds {
                    rule,
                    field: field.clone(),
                    value: display(config.get(field)),
                    limit: limit.clone(),
                    limit_value: display(config.get(limit)),
                });
            }
        }
        Rule::RequiresOneOf {
            flag,
            field,
            allowed,
        } => {
            if !config.get(flag).map(truthy).unwrap_or(false) {
                return;
            }
            let Some(value) = config.get(field) else {
                return;
            };
            let actual = display(Some(value));
            if !allowed.iter().any(|a| a == &actual) {
                out.push(ValidationError::NotAllowed {
                    rule,
                    flag: flag.clone(),
                    field: field.clone(),
                    allowed: allowed.clone(),
                    value: actual,
                });
            }
        }
        Rule::RequiresAny { flag, others } => {
            if !config.get(flag).map(truthy).unwrap_or(false) {
                return;
            }
            if others.iter().all(|o| config.get(o).is_none()) {
                return;
            }
            if !others.iter().any(|o| config.get(o).map(truthy).unwrap_or(false)) {
                out.push(ValidationError::MissingCompanion {
                    rule,
                    flag: flag.clone(),
                    others: others.clone(),
                });
            }
        }
        Rule::EnvFloor {
            var,
            min,
            field,
            expected,
        } => {
            let Some(value) = env.get(var).and_then(env_int) else {
                return;
            };
            let Some(actual) = config.get(field) else {
                return;
            };
            let actual = display(Some(actual));
            if value < *min && &actual != expected {
                out.push(ValidationError::EnvConflict {
                    rule,
                    var: var.clone(),
                    value,
                    min: *min,
                    field: field.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
    }
}

/// Text of a config value for comparisons and messages; enum members
/// (`Type.member`) by symbolic name.
fn display(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) if is_enum_member(s) => symbolic_name(s).to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

/// `ShardingStrategy.optim`: a capitalized identifier, one dot, an identifier.
fn is_enum_member(s: &str) -> bool {
    let ident = |t: &str| !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    match s.split_once('.') {
        Some((ty, member)) => {
            ty.starts_with(|c: char| c.is_ascii_uppercase()) && ident(ty) && ident(member)
        }
        None => false,
    }
}

fn env_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn valid() -> ConfigValue {
        ConfigValue::new()
            .with("micro_batch_size", json!(4))
            .with("train_iters", json!(1000))
            .with("lr_decay_style", json!("cosine"))
            .with("lr", json!(3e-4))
            .with("num_layers", json!(12))
            .with("hidden_size", json!(768))
            .with("ffn_hidden_size", json!(3072))
            .with("kv_channels", json!(64))
            .with("num_attention_heads", json!(12))
            .with("vocab_size", json!(50304))
            .with("max_position_embeddings", json!(2048))
            .with("lr_warmup_iters", json!(100))
            .with("use_distributed_optimizer", json!(true))
            .with("use_torch_fsdp2", json!(false))
            .with("use_megatron_fsdp", json!(false))
            .with("gradient_accumulation_fusion", json!(true))
            .with("overlap_param_gather", json!(false))
            .with("ckpt_format", json!("torch_dist"))
            .with("data_parallel_sharding_strategy", json!("no_shard"))
    }

    fn no_env() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn first_rule(config: &ConfigValue, env: &BTreeMap<String, Value>) -> String {
        ValidationRules::megatron()
            .validate(config, env)
            .unwrap_err()
            .rule()
            .to_string()
    }

    #[test]
    fn valid_config_passes() {
        assert_eq!(ValidationRules::megatron().validate(&valid(), &no_env()), Ok(()));
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let config = valid().with("vocab_size", json!(null));
        let err = ValidationRules::megatron().validate(&config, &no_env()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingRequired {
                rule: "required_fields".into(),
                field: "vocab_size".into()
            }
        );
    }

    #[test]
    fn exclusive_group_allows_at_most_one() {
        let config = valid().with("use_torch_fsdp2", json!(true));
        let errs = ValidationRules::megatron().violations(&config, &no_env());
        let rules: Vec<_> = errs.iter().map(|e| e.rule()).collect();
        assert_eq!(
            rules,
            vec!["distributed_optimizer_vs_fsdp2", "grad_accum_fusion_vs_fsdp2"]
        );
    }

    #[test]
    fn warmup_may_not_exceed_train_iters() {
        let config = valid().with("lr_warmup_iters", json!(1001));
        assert_eq!(first_rule(&config, &no_env()), "warmup_within_train_iters");
        let config = valid().with("lr_warmup_iters", json!(1000));
        assert!(ValidationRules::megatron().validate(&config, &no_env()).is_ok());
    }

    #[test]
    fn accumulation_fusion_restricts_sharding_strategy() {
        let config = valid().with("data_parallel_sharding_strategy", json!("optim_grads_params"));
        assert_eq!(first_rule(&config, &no_env()), "grad_accum_fusion_sharding");
        let config = valid().with("data_parallel_sharding_strategy", json!("optim"));
        assert!(ValidationRules::megatron().validate(&config, &no_env()).is_ok());
    }

    #[test]
    fn low_device_connections_conflict_with_sharding() {
        let config = valid()
            .with("gradient_accumulation_fusion", json!(false))
            .with("data_parallel_sharding_strategy", json!("optim_grads_params"));
        let env = BTreeMap::from([("CUDA_DEVICE_MAX_CONNECTIONS".to_string(), json!(1))]);
        assert_eq!(first_rule(&config, &env), "device_connections_sharding");

        let env = BTreeMap::from([("CUDA_DEVICE_MAX_CONNECTIONS".to_string(), json!("8"))]);
        assert!(ValidationRules::megatron().validate(&config, &env).is_ok());
    }

    #[test]
    fn overlap_param_gather_needs_a_sharded_optimizer() {
        let config = valid()
            .with("overlap_param_gather", json!(true))
            .with("use_distributed_optimizer", json!(false));
        assert_eq!(
            first_rule(&config, &no_env()),
            "overlap_param_gather_needs_sharded_optimizer"
        );
    }

    #[test]
    fn rules_on_absent_fields_are_skipped() {
        let config = ConfigValue::new().with("gradient_accumulation_fusion", json!(true));
        let rules = ValidationRules::new().with(
            "fusion",
            Rule::RequiresOneOf {
                flag: "gradient_accumulation_fusion".into(),
                field: "data_parallel_sharding_strategy".into(),
                allowed: vec!["no_shard".into()],
            },
        );
        assert!(rules.validate(&config, &no_env()).is_ok());
    }

    #[test]
    fn enum_values_compare_by_symbolic_name() {
        let config = valid().with(
            "data_parallel_sharding_strategy",
            json!("ShardingStrategy.optim"),
        );
        assert!(ValidationRules::megatron().validate(&config, &no_env()).is_ok());
    }

    #[test]
    fn dotted_plain_values_are_not_truncated() {
        let config = valid().with("data_parallel_sharding_strategy", json!("v2.optim"));
        assert_eq!(first_rule(&config, &no_env()), "grad_accum_fusion_sharding");
        assert!(is_enum_member("ShardingStrategy.no_shard"));
        assert!(!is_enum_member("v2.optim"));
        assert!(!is_enum_member("a.B.c"));
    }

    #[test]
    fn error_messages_name_the_rule() {
        let config = valid().with("lr", json!(null));
        let err = ValidationRules::megatron().validate(&config, &no_env()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "[required_fields] required field `lr` is missing or null"
        );
    }
}
