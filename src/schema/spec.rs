//! Normalized argument table.
//!
//! Every external declaration is reduced to one `ArgumentSpec`, keyed by its
//! destination name. `Schema` keeps declaration order because emitted command
//! lines follow it.

use serde_json::Value;
use std::collections::HashMap;

/// Base scalar type of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int,
    Float,
    Str,
    Bool,
    /// No declared type: the value is whatever the config holds (scalar-or-string).
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Scalar(ScalarType),
    List(ScalarType),
    /// Enumeration; the payload is the enum's type name (e.g. `AttnBackend`).
    Enum(String),
}

impl ValueType {
    pub fn is_list(&self) -> bool {
        matches!(self, ValueType::List(_))
    }
}

/// How the external parser consumes the flag.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    Store,
    StoreTrue,
    StoreFalse,
    StoreConst(Value),
    Append,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSpec {
    pub name: String,
    /// Primary spelling on the command line, e.g. `--learning-rate`.
    pub flag: String,
    pub value_type: ValueType,
    pub default: Value,
    pub kind: ArgKind,
    pub choices: Option<Vec<Value>>,
    pub help: Option<String>,
}

impl ArgumentSpec {
    pub fn new(name: &str, value_type: ValueType, default: Value, kind: ArgKind) -> Self {
        Self {
            name: name.to_string(),
            flag: derived_flag(name),
            value_type,
            default,
            kind,
            choices: None,
            help: None,
        }
    }

    pub fn with_flag(mut self, flag: &str) -> Self {
        self.flag = flag.to_string();
        self
    }

    pub fn with_choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }

    /// The literal a presence-only flag stores, if this is one.
    ///
    /// `StoreTrue`/`StoreFalse` are constant flags whose literal is implied.
    pub fn constant(&self) -> Option<Value> {
        match &self.kind {
            ArgKind::StoreTrue => Some(Value::Bool(true)),
            ArgKind::StoreFalse => Some(Value::Bool(false)),
            ArgKind::StoreConst(c) => Some(c.clone()),
            ArgKind::Store | ArgKind::Append => None,
        }
    }
}

/// `learning_rate` => `--learning-rate`
pub fn derived_flag(name: &str) -> String {
    format!("--{}", name.replace('_', "-"))
}

/// Ordered `name -> ArgumentSpec` table.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    args: Vec<ArgumentSpec>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a spec. Returns false (and keeps the existing entry) when the name
    /// is already declared: the first declaration governs.
    pub fn insert(&mut self, spec: ArgumentSpec) -> bool {
        if self.index.contains_key(&spec.name) {
            return false;
        }
        self.index.insert(spec.name.clone(), self.args.len());
        self.args.push(spec);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ArgumentSpec> {
        self.index.get(name).map(|&i| &self.args[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ArgumentSpec> {
        self.args.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|a| a.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn choices_of(&self, name: &str) -> Option<&[Value]> {
        self.get(name)?.choices.as_deref()
    }

    pub fn help_of(&self, name: &str) -> Option<&str> {
        self.get(name)?.help.as_deref()
    }
}

impl FromIterator<ArgumentSpec> for Schema {
    fn from_iter<I: IntoIterator<Item = ArgumentSpec>>(iter: I) -> Self {
        let mut schema = Schema::new();
        for spec in iter {
            schema.insert(spec);
        }
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derived_flag_replaces_underscores() {
        assert_eq!(derived_flag("learning_rate"), "--learning-rate");
        assert_eq!(derived_flag("lr"), "--lr");
    }

    #[test]
    fn first_declaration_wins() {
        let mut schema = Schema::new();
        assert!(schema.insert(ArgumentSpec::new(
            "fp16",
            ValueType::Scalar(ScalarType::Bool),
            json!(false),
            ArgKind::StoreTrue,
        )));
        assert!(!schema.insert(ArgumentSpec::new(
            "fp16",
            ValueType::Scalar(ScalarType::Any),
            json!(null),
            ArgKind::Store,
        )));
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.get("fp16").map(|a| &a.kind), Some(&ArgKind::StoreTrue));
    }

    #[test]
    fn implied_constants() {
        let t = ArgumentSpec::new("a", ValueType::Scalar(ScalarType::Bool), json!(false), ArgKind::StoreTrue);
        let f = ArgumentSpec::new("b", ValueType::Scalar(ScalarType::Bool), json!(true), ArgKind::StoreFalse);
        let s = ArgumentSpec::new("c", ValueType::Scalar(ScalarType::Int), json!(1), ArgKind::Store);
        assert_eq!(t.constant(), Some(json!(true)));
        assert_eq!(f.constant(), Some(json!(false)));
        assert_eq!(s.constant(), None);
    }
}
