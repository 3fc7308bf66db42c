//! Schema-driven config model.
//!
//! `build` turns a `Schema` into a `ConfigType`: one `FieldDescriptor` per
//! argument that is not excluded, with its default possibly replaced by an
//! override. `ConfigType::instantiate` then checks a resolved mapping against
//! that descriptor list and produces a `ConfigValue`.
//!
//! Unknown names fail fast, both for overrides and for config keys. The only
//! open-ended part is the `aux` bucket, which is kept apart from the typed
//! fields and never reaches the command line.

use crate::schema::value::parse_typed;
use crate::schema::{Schema, ValueType};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Config key that holds auxiliary, non-argument values.
pub const AUX_KEY: &str = "aux";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown config field: {0}")]
    UnknownField(String),
    #[error("override must look like key=value, got {0:?}")]
    MalformedOverride(String),
    #[error("`aux` must be a mapping")]
    AuxNotMapping,
    #[error("config section must be a mapping")]
    NotMapping,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub value_type: ValueType,
    pub default: Value,
}

/// Default replacement for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Override {
    /// Text from the command line; parsed toward the field's declared type.
    Raw(String),
    Value(Value),
}

/// Structural description of a config: the ordered descriptor list.
#[derive(Debug, Clone, Default)]
pub struct ConfigType {
    fields: Vec<FieldDescriptor>,
}

/// `key=value` => (`key`, `Override::Raw(value)`); splits on the first `=`.
pub fn parse_override(text: &str) -> Result<(String, Override), ConfigError> {
    match text.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), Override::Raw(value.to_string())))
        }
        _ => Err(ConfigError::MalformedOverride(text.to_string())),
    }
}

/// Build the config type for `schema`, minus `excluded`, with `overrides` applied
/// to the defaults.
pub fn build(
    schema: &Schema,
    excluded: &BTreeSet<String>,
    overrides: &BTreeMap<String, Override>,
) -> Result<ConfigType, ConfigError> {
    let fields: Vec<FieldDescriptor> = schema
        .iter()
        .filter(|arg| !excluded.contains(&arg.name))
        .map(|arg| {
            let default = match overrides.get(&arg.name) {
                Some(Override::Raw(text)) => parse_typed(text, &arg.value_type),
                Some(Override::Value(v)) => v.clone(),
                None => arg.default.clone(),
            };
            FieldDescriptor {
                name: arg.name.clone(),
                value_type: arg.value_type.clone(),
                default,
            }
        })
        .collect();

    let ty = ConfigType { fields };
    for name in overrides.keys() {
        if !ty.contains(name) {
            return Err(ConfigError::UnknownField(name.clone()));
        }
    }
    Ok(ty)
}

impl ConfigType {
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// A value holding every field's default; the usual diff baseline.
    pub fn defaults(&self) -> ConfigValue {
        ConfigValue {
            fields: self
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.default.clone()))
                .collect(),
            aux: BTreeMap::new(),
        }
    }

    /// Start from defaults and apply every entry of `section`.
    pub fn instantiate(&self, section: &Map<String, Value>) -> Result<ConfigValue, ConfigError> {
        let mut config = self.defaults();
        for (key, value) in section {
            if key == AUX_KEY {
                match value {
                    Value::Object(aux) => {
                        config.aux = aux.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    }
                    Value::Null => {}
                    _ => return Err(ConfigError::AuxNotMapping),
                }
                continue;
            }
            if !self.contains(key) {
                return Err(ConfigError::UnknownField(key.clone()));
            }
            config.fields.insert(key.clone(), value.clone());
        }
        Ok(config)
    }

    /// Same as `instantiate`, for an arbitrary value that must be a mapping.
    pub fn instantiate_value(&self, section: &Value) -> Result<ConfigValue, ConfigError> {
        match section {
            Value::Object(map) => self.instantiate(map),
            Value::Null => Ok(self.defaults()),
            _ => Err(ConfigError::NotMapping),
        }
    }
}

/// A resolved config: typed fields plus the auxiliary bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigValue {
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
    aux: BTreeMap<String, Value>,
}

impl ConfigValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every schema default, ignoring exclusions and overrides.
    pub fn defaults(schema: &Schema) -> Self {
        Self {
            fields: schema
                .iter()
                .map(|arg| (arg.name.clone(), arg.default.clone()))
                .collect(),
            aux: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Absent or explicitly null.
    pub fn is_null(&self, name: &str) -> bool {
        self.get(name).map(Value::is_null).unwrap_or(true)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn aux(&self) -> &BTreeMap<String, Value> {
        &self.aux
    }

    pub fn aux_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.aux
    }
}

/// Convenience for `--override` lists from the command line.
pub fn parse_overrides(items: &[String]) -> Result<BTreeMap<String, Override>, ConfigError> {
    items.iter().map(|item| parse_override(item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArgKind, ArgumentSpec, ScalarType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> Schema {
        [
            ArgumentSpec::new("lr", ValueType::Scalar(ScalarType::Float), json!(null), ArgKind::Store),
            ArgumentSpec::new("seed", ValueType::Scalar(ScalarType::Int), json!(1234), ArgKind::Store),
            ArgumentSpec::new("fp16", ValueType::Scalar(ScalarType::Bool), json!(false), ArgKind::StoreTrue),
            ArgumentSpec::new("rank", ValueType::Scalar(ScalarType::Int), json!(0), ArgKind::Store),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn build_excludes_and_overrides() {
        let excluded = BTreeSet::from(["rank".to_string()]);
        let overrides = BTreeMap::from([
            ("lr".to_string(), Override::Raw("3e-4".into())),
            ("seed".to_string(), Override::Value(json!(7))),
        ]);
        let ty = build(&schema(), &excluded, &overrides).unwrap();
        let names: Vec<_> = ty.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["lr", "seed", "fp16"]);
        assert_eq!(ty.get("lr").unwrap().default, json!(3e-4));
        assert_eq!(ty.get("seed").unwrap().default, json!(7));
    }

    #[test]
    fn raw_override_follows_declared_type() {
        let overrides = BTreeMap::from([("lr".to_string(), Override::Raw("1".into()))]);
        let ty = build(&schema(), &BTreeSet::new(), &overrides).unwrap();
        assert_eq!(ty.get("lr").unwrap().default, json!(1.0));
    }

    #[test]
    fn override_of_unknown_or_excluded_field_fails() {
        let overrides = BTreeMap::from([("rank".to_string(), Override::Value(json!(1)))]);
        let excluded = BTreeSet::from(["rank".to_string()]);
        assert_eq!(
            build(&schema(), &excluded, &overrides).unwrap_err(),
            ConfigError::UnknownField("rank".into())
        );
    }

    #[test]
    fn instantiate_fills_fields_and_aux() {
        let ty = build(&schema(), &BTreeSet::new(), &BTreeMap::new()).unwrap();
        let section = json!({"lr": 0.01, "aux": {"note": "sweep-3"}});
        let config = ty.instantiate_value(&section).unwrap();
        assert_eq!(config.get("lr"), Some(&json!(0.01)));
        assert_eq!(config.get("seed"), Some(&json!(1234)));
        assert_eq!(config.aux().get("note"), Some(&json!("sweep-3")));
    }

    #[test]
    fn instantiate_rejects_unknown_keys() {
        let ty = build(&schema(), &BTreeSet::new(), &BTreeMap::new()).unwrap();
        let err = ty.instantiate_value(&json!({"learning_rate": 0.1})).unwrap_err();
        assert_eq!(err, ConfigError::UnknownField("learning_rate".into()));
        let err = ty.instantiate_value(&json!({"aux": [1]})).unwrap_err();
        assert_eq!(err, ConfigError::AuxNotMapping);
    }

    #[test]
    fn parse_override_splits_on_first_equals() {
        assert_eq!(
            parse_override("data_path=a=b").unwrap(),
            ("data_path".to_string(), Override::Raw("a=b".into()))
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn serializes_fields_flat_with_aux() {
        let config = ConfigValue::new().with("lr", json!(0.1));
        let v = serde_json::to_value(&config).unwrap();
        assert_eq!(v, json!({"lr": 0.1, "aux": {}}));
    }
}
